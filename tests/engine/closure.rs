use crate::helpers::{await_signal, eventually, spawn_engine, usd};
use bancs::broadcast::EngineSignal;
use bancs::model::transfer::{DepositoryType, PaymentNetwork};
use bancs::model::{AccountCommandData, AccountEventData, AccountStatus, DomesticRecipient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

fn recipient() -> DomesticRecipient {
    DomesticRecipient {
        name: "Robin Milner".to_string(),
        account_number: "444555666".to_string(),
        routing_number: "021000021".to_string(),
        depository: DepositoryType::Checking,
        payment_network: PaymentNetwork::Ach,
    }
}

#[tokio::test]
async fn closed_account_drains_in_flight_transfers_then_deletes() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    // the transfer hangs in progress for a while, then fails terminally
    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "status": "outgoing",
            "transactionId": "gw-slow",
        })))
        .mount(&app.gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/transfers/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "status": "failed",
            "reason": "gateway_meltdown",
        })))
        .mount(&app.gateway)
        .await;

    let (account, org) = app.open_account("ada").await;
    app.deposit(account, org, usd(600_00)).await;
    let register = app.command(account, org, AccountCommandData::RegisterDomesticRecipient {
        recipient: recipient(),
    });
    app.engine.accounts.send_command(register).await.expect("recipient registration failed");
    let transfer = app.command(account, org, AccountCommandData::DomesticTransfer {
        amount: usd(200_00),
        recipient_id: recipient().recipient_id(),
    });
    app.engine.accounts.send_command(transfer).await.expect("transfer failed");

    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id, event, .. }
                if *account_id == account
                    && matches!(event.data, AccountEventData::DomesticTransferPending { .. })
        )
    })
    .await;

    // close while the transfer is still in flight
    let close = app.command(account, org, AccountCommandData::CloseAccount {
        reference: Some("owner request".to_string()),
    });
    app.engine.accounts.send_command(close).await.expect("close failed");

    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id, event, .. }
                if *account_id == account
                    && matches!(event.data, AccountEventData::AccountClosed { .. })
        )
    })
    .await;

    // new business commands are refused on the closed account
    let late_deposit =
        app.command(account, org, AccountCommandData::DepositCash { amount: usd(1_00) });
    app.engine.accounts.send_command(late_deposit).await.expect("rejected commands confirm");
    await_signal(&mut signals, Duration::from_secs(2), |signal| {
        matches!(
            signal,
            EngineSignal::ValidationRejected { account_id: id, error, .. }
                if *id == account && error.contains("not active")
        )
    })
    .await;

    // the closure finalizer deregistered scheduled obligations
    let services = app.services.clone();
    eventually(Duration::from_secs(3), || {
        let services = services.clone();
        async move { services.removed_obligations.lock().await.contains(&account) }
    })
    .await;

    // the in-flight rejection still applies to the closed account
    await_signal(&mut signals, Duration::from_secs(5), |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id, event, .. }
                if *account_id == account
                    && matches!(event.data, AccountEventData::DomesticTransferRejected { .. })
        )
    })
    .await;

    // once quiescent the finalizer deletes the journal and the entity
    // passivates; the next activation starts from a blank aggregate
    let accounts = app.engine.accounts.clone();
    eventually(Duration::from_secs(5), || {
        let accounts = accounts.clone();
        async move {
            match accounts.get(account).await {
                Ok(None) => true,
                Ok(Some(snapshot)) => snapshot.status == AccountStatus::ReadyForDelete,
                Err(_) => false,
            }
        }
    })
    .await;

    use bancs::journal::EventJournal;
    eventually(Duration::from_secs(3), || {
        let journal = app.engine.account_journal.clone();
        let entity_id = account.to_string();
        async move {
            use futures::TryStreamExt;
            let events: Vec<_> = journal
                .read(&entity_id, 1, u64::MAX)
                .await
                .expect("journal read failed")
                .try_collect()
                .await
                .expect("journal stream failed");
            events.is_empty()
        }
    })
    .await;
}
