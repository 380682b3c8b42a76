use crate::helpers::{await_signal, spawn_engine, usd};
use bancs::broadcast::EngineSignal;
use bancs::model::transfer::{DepositoryType, PaymentNetwork};
use bancs::model::{AccountCommandData, AccountEventData, DomesticRecipient};
use bancs::transfer::BreakerState;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

fn recipient(account_number: &str) -> DomesticRecipient {
    DomesticRecipient {
        name: "Niklaus Wirth".to_string(),
        account_number: account_number.to_string(),
        routing_number: "021000021".to_string(),
        depository: DepositoryType::Checking,
        payment_network: PaymentNetwork::Ach,
    }
}

#[tokio::test]
async fn breaker_opens_after_failures_and_recovers_through_half_open() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    // the gateway melts down for the first two calls (failure threshold),
    // then recovers
    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&app.gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "status": "complete",
            "transactionId": "gw-ok",
        })))
        .mount(&app.gateway)
        .await;

    let (sender, org) = app.open_account("alice").await;
    app.deposit(sender, org, usd(1000_00)).await;

    for (account_number, amount) in [("111000111", usd(100_00)), ("222000222", usd(150_00))] {
        let register =
            app.command(sender, org, AccountCommandData::RegisterDomesticRecipient {
                recipient: recipient(account_number),
            });
        app.engine.accounts.send_command(register).await.expect("recipient registration failed");
        let transfer = app.command(sender, org, AccountCommandData::DomesticTransfer {
            amount,
            recipient_id: recipient(account_number).recipient_id(),
        });
        app.engine.accounts.send_command(transfer).await.expect("transfer failed");
    }

    // two consecutive gateway failures trip the breaker open
    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::CircuitBreaker { state: BreakerState::Open, .. }
        )
    })
    .await;

    // after the cooldown a single probe goes through and closes it again
    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::CircuitBreaker { state: BreakerState::HalfOpen, .. }
        )
    })
    .await;
    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::CircuitBreaker { state: BreakerState::Closed, .. }
        )
    })
    .await;

    // both queued transfers complete once the gateway recovers
    let mut approved = 0;
    while approved < 2 {
        await_signal(&mut signals, Duration::from_secs(5), |signal| {
            matches!(
                signal,
                EngineSignal::AccountEvent { event, .. }
                    if matches!(event.data, AccountEventData::DomesticTransferApproved { .. })
            )
        })
        .await;
        approved += 1;
    }
    assert_eq!(app.balance(sender).await, usd(750_00));
}
