use crate::helpers::{await_signal, eventually, spawn_engine, usd};
use bancs::broadcast::EngineSignal;
use bancs::model::{
    AccountCommandData, AccountEventData, Card, CardId, EmployeeCommand, EmployeeCommandData,
    EmployeeEnvelope, EmployeeId, EmployeeRole, EmployeeStatus, InitiatorId, InviteToken,
};
use bancs::services::EmailMessage;
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn deposit_and_get_reflect_the_committed_balance() {
    let app = spawn_engine().await;
    let (account_id, org_id) = app.open_account("ada").await;

    app.deposit(account_id, org_id, usd(125_50)).await;
    assert_eq!(app.balance(account_id).await, usd(125_50));
}

#[tokio::test]
async fn validation_rejections_are_broadcast_keyed_by_account() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();
    let (account_id, org_id) = app.open_account("ada").await;

    // zero deposit violates the minimum-deposit rule
    let command =
        app.command(account_id, org_id, AccountCommandData::DepositCash { amount: usd(0) });
    app.engine.accounts.send_command(command).await.expect("rejected commands still confirm");

    let signal = await_signal(&mut signals, Duration::from_secs(2), |signal| {
        matches!(signal, EngineSignal::ValidationRejected { account_id: id, .. } if *id == account_id)
    })
    .await;
    match signal {
        EngineSignal::ValidationRejected { command, error, .. } => {
            assert_eq!(command, "deposit_cash");
            assert!(error.contains("too small"));
        },
        other => panic!("unexpected signal: {other:?}"),
    }
}

#[tokio::test]
async fn card_purchase_over_balance_declines_back_to_the_employee() {
    let app = spawn_engine().await;
    let (account_id, org_id) = app.open_account("ada").await;
    app.deposit(account_id, org_id, usd(10_00)).await;

    // invite an employee with a card and confirm the invitation
    let employee_id = EmployeeId::new();
    let card_id = CardId::new();
    let token = InviteToken::new();
    let create = EmployeeCommand::new(
        EmployeeEnvelope::new(employee_id, org_id, InitiatorId::new()),
        EmployeeCommandData::CreateEmployee {
            name: "lin".to_string(),
            email: "lin@example.com".to_string(),
            role: EmployeeRole::CardHolder,
            invite_token: token,
            card: Some(Card {
                card_id,
                last4: "9001".to_string(),
                virtual_card: false,
                daily_limit: usd(500_00),
                monthly_limit: usd(2000_00),
            }),
        },
    );
    app.engine.employees.send_command(create).await.expect("employee create failed");
    let confirm = EmployeeCommand::new(
        EmployeeEnvelope::new(employee_id, org_id, InitiatorId::new()),
        EmployeeCommandData::ConfirmInvitation { token },
    );
    app.engine.employees.send_command(confirm).await.expect("invite confirm failed");

    // a 20.00 purchase against a 10.00 balance
    let intent = EmployeeCommand::new(
        EmployeeEnvelope::new(employee_id, org_id, InitiatorId::new()),
        EmployeeCommandData::PurchaseIntent {
            account_id,
            card_id,
            amount: usd(20_00),
            merchant: "espresso cart".to_string(),
        },
    );
    app.engine.employees.send_command(intent).await.expect("purchase intent failed");

    // the account rejects with InsufficientBalance and the compensating
    // decline reaches the employee, which emails the cardholder
    let services = app.services.clone();
    eventually(Duration::from_secs(3), || {
        let services = services.clone();
        async move {
            services.emails.lock().await.iter().any(|message| {
                matches!(
                    message,
                    EmailMessage::PurchaseDeclined { email, reason }
                        if email == "lin@example.com" && reason.contains("insufficient account funds")
                )
            })
        }
    })
    .await;

    // no event was persisted for the failed debit
    assert_eq!(app.balance(account_id).await, usd(10_00));
}

#[tokio::test]
async fn successful_card_purchase_debits_and_approves() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();
    let (account_id, org_id) = app.open_account("ada").await;
    app.deposit(account_id, org_id, usd(100_00)).await;

    let employee_id = EmployeeId::new();
    let card_id = CardId::new();
    let token = InviteToken::new();
    let create = EmployeeCommand::new(
        EmployeeEnvelope::new(employee_id, org_id, InitiatorId::new()),
        EmployeeCommandData::CreateEmployee {
            name: "lin".to_string(),
            email: "lin@example.com".to_string(),
            role: EmployeeRole::CardHolder,
            invite_token: token,
            card: Some(Card {
                card_id,
                last4: "9001".to_string(),
                virtual_card: true,
                daily_limit: usd(500_00),
                monthly_limit: usd(2000_00),
            }),
        },
    );
    app.engine.employees.send_command(create).await.expect("employee create failed");
    let confirm = EmployeeCommand::new(
        EmployeeEnvelope::new(employee_id, org_id, InitiatorId::new()),
        EmployeeCommandData::ConfirmInvitation { token },
    );
    app.engine.employees.send_command(confirm).await.expect("invite confirm failed");

    let intent = EmployeeCommand::new(
        EmployeeEnvelope::new(employee_id, org_id, InitiatorId::new()),
        EmployeeCommandData::PurchaseIntent {
            account_id,
            card_id,
            amount: usd(35_00),
            merchant: "stationery".to_string(),
        },
    );
    app.engine.employees.send_command(intent).await.expect("purchase intent failed");

    await_signal(&mut signals, Duration::from_secs(2), |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id: id, event, .. }
                if *id == account_id && matches!(event.data, AccountEventData::Debited { .. })
        )
    })
    .await;
    assert_eq!(app.balance(account_id).await, usd(65_00));

    // employee confirms the invitation is still active after settling
    let status = app.engine.employees.status(employee_id).await.expect("status ask failed");
    assert_eq!(status, Some(EmployeeStatus::Active));
}

#[tokio::test]
async fn persist_failure_is_broadcast_and_leaves_state_unchanged() {
    let app = spawn_engine().await;
    let (account_id, org_id) = app.open_account("ada").await;
    app.deposit(account_id, org_id, usd(50_00)).await;

    let mut signals = app.engine.bus.subscribe();
    app.engine.account_journal.set_fail_appends(true);

    let command =
        app.command(account_id, org_id, AccountCommandData::DepositCash { amount: usd(5_00) });
    let err = app.engine.accounts.send_command(command).await.unwrap_err();
    assert!(err.to_string().contains("unconfirmed"));

    await_signal(&mut signals, Duration::from_secs(2), |signal| {
        matches!(signal, EngineSignal::PersistFailed { entity_type, .. } if *entity_type == "account")
    })
    .await;

    app.engine.account_journal.set_fail_appends(false);
    assert_eq!(app.balance(account_id).await, usd(50_00));
}

#[tokio::test]
async fn journal_replay_matches_the_live_aggregate() {
    use bancs::journal::EventJournal;
    use futures::TryStreamExt;

    let app = spawn_engine().await;
    let (account_id, org_id) = app.open_account("ada").await;
    app.deposit(account_id, org_id, usd(300_00)).await;
    app.deposit(account_id, org_id, usd(42_00)).await;

    let live = app.balance(account_id).await;

    let events: Vec<_> = app
        .engine
        .account_journal
        .read(&account_id.to_string(), 1, u64::MAX)
        .await
        .expect("journal read failed")
        .try_collect()
        .await
        .expect("journal stream failed");
    let mut replayed = bancs::model::Account::default();
    let policy = bancs::model::AccountPolicy::default();
    for event in &events {
        replayed.apply(&event.payload, &policy);
    }
    assert_eq!(replayed.balance(), Some(live));

    // gap-free, monotonically numbered stream
    let sequences: Vec<_> = events.iter().map(|event| event.sequence).collect();
    assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());
}
