use crate::helpers::{await_signal, eventually, spawn_engine, usd};
use bancs::broadcast::EngineSignal;
use bancs::model::AccountEventData;
use bancs::services::{AccountRef, EmailMessage};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn qualifying_deposit_skips_the_maintenance_fee() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (account, org) = app.open_account("ada").await;
    // 300.00 is above the 250.00 qualifying-deposit threshold
    app.deposit(account, org, usd(300_00)).await;
    app.read_model.upsert(AccountRef { account_id: account, org_id: org }, None).await;

    app.engine.billing.start_cycle().await;

    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id, event, .. }
                if *account_id == account
                    && matches!(event.data, AccountEventData::BillingCycleStarted { .. })
        )
    })
    .await;

    let skipped = await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id, event, .. }
                if *account_id == account
                    && matches!(event.data, AccountEventData::MaintenanceFeeSkipped { .. })
        )
    })
    .await;
    match skipped {
        EngineSignal::AccountEvent { event, .. } => match event.data {
            AccountEventData::MaintenanceFeeSkipped { criteria } => {
                assert!(criteria.qualifying_deposit_found);
            },
            other => panic!("unexpected event: {other:?}"),
        },
        other => panic!("unexpected signal: {other:?}"),
    }

    // no fee was taken
    assert_eq!(app.balance(account).await, usd(300_00));

    // statement appended and billing email queued
    let services = app.services.clone();
    eventually(Duration::from_secs(2), || {
        let services = services.clone();
        async move {
            let statements = services.statements.lock().await;
            statements.iter().any(|statement| statement.account_id == account)
        }
    })
    .await;
    let services = app.services.clone();
    eventually(Duration::from_secs(2), || {
        let services = services.clone();
        async move {
            services.emails.lock().await.iter().any(|message| {
                matches!(message, EmailMessage::BillingStatement { account_id, .. } if *account_id == account)
            })
        }
    })
    .await;

    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(signal, EngineSignal::BillingCycleFinished { accounts } if *accounts == 1)
    })
    .await;
}

#[tokio::test]
async fn account_missing_both_criteria_pays_the_fee() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (account, org) = app.open_account("ada").await;
    // small deposit, balance below the daily threshold the whole cycle
    app.deposit(account, org, usd(100_00)).await;
    app.read_model.upsert(AccountRef { account_id: account, org_id: org }, None).await;

    app.engine.billing.start_cycle().await;

    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id, event, .. }
                if *account_id == account
                    && matches!(event.data, AccountEventData::MaintenanceFeeDebited { .. })
        )
    })
    .await;
    assert_eq!(app.balance(account).await, usd(95_00));
}

#[tokio::test]
async fn billing_cycle_is_idempotent_per_period() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (account, org) = app.open_account("ada").await;
    app.deposit(account, org, usd(300_00)).await;
    app.read_model.upsert(AccountRef { account_id: account, org_id: org }, None).await;

    app.engine.billing.start_cycle().await;
    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(signal, EngineSignal::BillingCycleFinished { .. })
    })
    .await;

    // a duplicate fan-out in the same period starts no second cycle
    app.engine.billing.start_cycle().await;
    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(signal, EngineSignal::BillingCycleFinished { .. })
    })
    .await;

    let started: Vec<_> = {
        use bancs::journal::EventJournal;
        use futures::TryStreamExt;
        let events: Vec<_> = app
            .engine
            .account_journal
            .read(&account.to_string(), 1, u64::MAX)
            .await
            .expect("journal read failed")
            .try_collect()
            .await
            .expect("journal stream failed");
        events
            .into_iter()
            .filter(|event| {
                matches!(event.payload.data, AccountEventData::BillingCycleStarted { .. })
            })
            .collect()
    };
    assert_eq!(started.len(), 1);
}
