use crate::helpers::{await_signal, eventually, spawn_engine, usd, TestApp};
use bancs::broadcast::EngineSignal;
use bancs::model::{
    AccountCommandData, AccountEventData, AccountId, AutoTransferConfig, AutoTransferFrequency,
    AutoTransferRule, CorrelationId, DistributionDestination, DomesticRecipient, InternalTarget,
    RecipientId, RecipientRegistrationStatus, TransferRecipient, TransferRejectionReason,
};
use bancs::model::transfer::{DepositoryType, PaymentNetwork};
use bancs::services::EmailMessage;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

fn account_event_matcher(
    account_id: AccountId, mut data_matches: impl FnMut(&AccountEventData) -> bool,
) -> impl FnMut(&EngineSignal) -> bool {
    move |signal| {
        matches!(
            signal,
            EngineSignal::AccountEvent { account_id: id, event, .. }
                if *id == account_id && data_matches(&event.data)
        )
    }
}

fn event_correlation(signal: &EngineSignal) -> CorrelationId {
    match signal {
        EngineSignal::AccountEvent { event, .. } => event.base.correlation_id,
        other => panic!("not an account event: {other:?}"),
    }
}

async fn register_within_org_recipient(
    app: &TestApp, sender: AccountId, sender_org: bancs::model::OrgId, recipient: AccountId,
) -> RecipientId {
    let command = app.command(sender, sender_org, AccountCommandData::RegisterInternalRecipient {
        recipient: TransferRecipient::InternalWithinOrg {
            name: "ops".to_string(),
            account_id: recipient,
            status: RecipientRegistrationStatus::Confirmed,
        },
    });
    app.engine.accounts.send_command(command).await.expect("recipient registration failed");
    RecipientId::internal(recipient)
}

fn domestic_recipient() -> DomesticRecipient {
    DomesticRecipient {
        name: "Tony Hoare".to_string(),
        account_number: "555666777".to_string(),
        routing_number: "021000021".to_string(),
        depository: DepositoryType::Checking,
        payment_network: PaymentNetwork::Ach,
    }
}

#[tokio::test]
async fn within_org_transfer_happy_path_ties_all_three_events() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (sender, org) = app.open_account("alice").await;
    let (recipient, _) = {
        // the recipient lives in the same org
        let recipient = AccountId::new();
        let command = app.command(recipient, org, AccountCommandData::CreateAccount {
            owner_name: "bob".to_string(),
            email: "bob@example.com".to_string(),
            currency: money2::Currency::Usd,
        });
        app.engine.accounts.send_command(command).await.expect("recipient create failed");
        (recipient, org)
    };
    app.deposit(sender, org, usd(1000_00)).await;
    let recipient_id = register_within_org_recipient(&app, sender, org, recipient).await;

    let transfer = app.command(sender, org, AccountCommandData::InternalTransferWithinOrg {
        amount: usd(200_00),
        recipient_id,
    });
    app.engine.accounts.send_command(transfer).await.expect("transfer failed");

    let pending = await_signal(
        &mut signals,
        Duration::from_secs(2),
        account_event_matcher(sender, |data| {
            matches!(data, AccountEventData::InternalTransferWithinOrgPending { .. })
        }),
    )
    .await;
    let approved = await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(sender, |data| {
            matches!(data, AccountEventData::InternalTransferWithinOrgApproved { .. })
        }),
    )
    .await;
    let deposited = await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(recipient, |data| {
            matches!(data, AccountEventData::InternalTransferWithinOrgDeposited { .. })
        }),
    )
    .await;

    let correlation = event_correlation(&pending);
    assert_eq!(event_correlation(&approved), correlation);
    assert_eq!(event_correlation(&deposited), correlation);

    assert_eq!(app.balance(sender).await, usd(800_00));
    assert_eq!(app.balance(recipient).await, usd(200_00));
}

#[tokio::test]
async fn between_orgs_transfer_registers_sender_and_emails_recipient() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (sender, sender_org) = app.open_account("alice").await;
    let (recipient, recipient_org) = app.open_account("carol").await;
    app.deposit(sender, sender_org, usd(500_00)).await;

    let command = app.command(sender, sender_org, AccountCommandData::RegisterInternalRecipient {
        recipient: TransferRecipient::InternalBetweenOrgs {
            name: "carol".to_string(),
            account_id: recipient,
            org_id: recipient_org,
            status: RecipientRegistrationStatus::Confirmed,
        },
    });
    app.engine.accounts.send_command(command).await.expect("recipient registration failed");

    let transfer = app.command(sender, sender_org, AccountCommandData::InternalTransferBetweenOrgs {
        amount: usd(120_00),
        recipient_id: RecipientId::internal(recipient),
    });
    app.engine.accounts.send_command(transfer).await.expect("transfer failed");

    // the coordinator auto-registers the sender before depositing
    await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(recipient, |data| {
            matches!(data, AccountEventData::InternalSenderRegistered { .. })
        }),
    )
    .await;
    await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(recipient, |data| {
            matches!(data, AccountEventData::InternalTransferBetweenOrgsDeposited { .. })
        }),
    )
    .await;

    assert_eq!(app.balance(sender).await, usd(380_00));
    assert_eq!(app.balance(recipient).await, usd(120_00));

    let services = app.services.clone();
    eventually(Duration::from_secs(2), || {
        let services = services.clone();
        async move {
            services.emails.lock().await.iter().any(|message| {
                matches!(message, EmailMessage::TransferDeposited { email, .. } if email == "carol@example.com")
            })
        }
    })
    .await;
}

#[tokio::test]
async fn transfer_to_nonexistent_recipient_is_rejected_and_refunded() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (sender, org) = app.open_account("alice").await;
    app.deposit(sender, org, usd(400_00)).await;
    // registered, but no such aggregate exists
    let recipient_id = register_within_org_recipient(&app, sender, org, AccountId::new()).await;

    let transfer = app.command(sender, org, AccountCommandData::InternalTransferWithinOrg {
        amount: usd(100_00),
        recipient_id,
    });
    app.engine.accounts.send_command(transfer).await.expect("transfer failed");

    let rejected = await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(sender, |data| {
            matches!(data, AccountEventData::InternalTransferWithinOrgRejected { .. })
        }),
    )
    .await;
    match rejected {
        EngineSignal::AccountEvent { event, .. } => match event.data {
            AccountEventData::InternalTransferWithinOrgRejected { reason, .. } => {
                assert_eq!(reason, TransferRejectionReason::InvalidAccountInfo);
            },
            other => panic!("unexpected event: {other:?}"),
        },
        other => panic!("unexpected signal: {other:?}"),
    }
    assert_eq!(app.balance(sender).await, usd(400_00));
}

#[tokio::test]
async fn domestic_transfer_completes_through_the_gateway() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "status": "complete",
            "transactionId": "gw-1",
        })))
        .mount(&app.gateway)
        .await;

    let (sender, org) = app.open_account("alice").await;
    app.deposit(sender, org, usd(900_00)).await;
    let register = app.command(sender, org, AccountCommandData::RegisterDomesticRecipient {
        recipient: domestic_recipient(),
    });
    app.engine.accounts.send_command(register).await.expect("recipient registration failed");

    let transfer = app.command(sender, org, AccountCommandData::DomesticTransfer {
        amount: usd(250_00),
        recipient_id: domestic_recipient().recipient_id(),
    });
    app.engine.accounts.send_command(transfer).await.expect("transfer failed");

    await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(sender, |data| {
            matches!(data, AccountEventData::DomesticTransferApproved { .. })
        }),
    )
    .await;
    assert_eq!(app.balance(sender).await, usd(650_00));
}

#[tokio::test]
async fn recipient_edit_reissues_failed_domestic_transfers() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    // first attempt fails on bad account info; everything after succeeds
    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "status": "failed",
            "reason": "invalid_account_info",
        })))
        .up_to_n_times(1)
        .mount(&app.gateway)
        .await;

    let (sender, org) = app.open_account("alice").await;
    app.deposit(sender, org, usd(800_00)).await;
    let register = app.command(sender, org, AccountCommandData::RegisterDomesticRecipient {
        recipient: domestic_recipient(),
    });
    app.engine.accounts.send_command(register).await.expect("recipient registration failed");

    let transfer = app.command(sender, org, AccountCommandData::DomesticTransfer {
        amount: usd(300_00),
        recipient_id: domestic_recipient().recipient_id(),
    });
    app.engine.accounts.send_command(transfer).await.expect("transfer failed");

    let rejected = await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(sender, |data| {
            matches!(data, AccountEventData::DomesticTransferRejected { .. })
        }),
    )
    .await;
    match rejected {
        EngineSignal::AccountEvent { event, .. } => match event.data {
            AccountEventData::DomesticTransferRejected { reason, .. } => {
                assert_eq!(reason, TransferRejectionReason::InvalidAccountInfo);
            },
            other => panic!("unexpected event: {other:?}"),
        },
        other => panic!("unexpected signal: {other:?}"),
    }
    assert_eq!(app.balance(sender).await, usd(800_00));

    Mock::given(method("POST"))
        .and(path("/transfers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "status": "complete",
            "transactionId": "gw-2",
        })))
        .mount(&app.gateway)
        .await;

    // fixing the recipient re-issues the failed transfer automatically; the
    // edit keys on account+routing number so it replaces the same entry
    let mut fixed = domestic_recipient();
    fixed.name = "Tony Hoare Jr".to_string();
    let edit = app.command(sender, org, AccountCommandData::EditDomesticRecipient {
        recipient: fixed,
    });
    app.engine.accounts.send_command(edit).await.expect("recipient edit failed");

    await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(sender, |data| {
            matches!(data, AccountEventData::DomesticTransferPending { .. })
        }),
    )
    .await;
    await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(sender, |data| {
            matches!(data, AccountEventData::DomesticTransferApproved { .. })
        }),
    )
    .await;
    assert_eq!(app.balance(sender).await, usd(500_00));
}

#[tokio::test]
async fn per_transaction_auto_transfer_sweeps_atomically() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (savings, org) = app.open_account("alice").await;
    let (ops, _) = {
        let ops = AccountId::new();
        let command = app.command(ops, org, AccountCommandData::CreateAccount {
            owner_name: "ops".to_string(),
            email: "ops@example.com".to_string(),
            currency: money2::Currency::Usd,
        });
        app.engine.accounts.send_command(command).await.expect("ops create failed");
        (ops, org)
    };

    let configure = app.command(savings, org, AccountCommandData::ConfigureAutoTransferRule {
        config: AutoTransferConfig {
            id: bancs::model::RuleId::new(),
            frequency: AutoTransferFrequency::PerTransaction,
            rule: AutoTransferRule::ZeroBalanceSweep {
                target: InternalTarget {
                    name: "ops".to_string(),
                    account_id: ops,
                    org_id: org,
                },
            },
        },
    });
    app.engine.accounts.send_command(configure).await.expect("rule configure failed");

    app.deposit(savings, org, usd(500_00)).await;

    await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(savings, |data| {
            matches!(data, AccountEventData::InternalAutomatedTransferPending { .. })
        }),
    )
    .await;
    await_signal(
        &mut signals,
        Duration::from_secs(3),
        account_event_matcher(ops, |data| {
            matches!(data, AccountEventData::InternalAutomatedTransferDeposited { .. })
        }),
    )
    .await;

    assert_eq!(app.balance(savings).await, usd(0));
    assert_eq!(app.balance(ops).await, usd(500_00));
}

#[tokio::test]
async fn overdrafting_auto_transfer_batch_is_rejected_whole() {
    let app = spawn_engine().await;
    let mut signals = app.engine.bus.subscribe();

    let (account, org) = app.open_account("alice").await;
    let destinations = vec![
        DistributionDestination {
            target: InternalTarget {
                name: "rent".to_string(),
                account_id: AccountId::new(),
                org_id: org,
            },
            amount: usd(90_00),
        },
        DistributionDestination {
            target: InternalTarget {
                name: "tax".to_string(),
                account_id: AccountId::new(),
                org_id: org,
            },
            amount: usd(60_00),
        },
    ];
    let configure = app.command(account, org, AccountCommandData::ConfigureAutoTransferRule {
        config: AutoTransferConfig {
            id: bancs::model::RuleId::new(),
            frequency: AutoTransferFrequency::PerTransaction,
            rule: AutoTransferRule::FixedDistribution { destinations },
        },
    });
    app.engine.accounts.send_command(configure).await.expect("rule configure failed");

    // 100.00 cannot cover the 150.00 distribution: the whole batch fails
    app.deposit(account, org, usd(100_00)).await;

    await_signal(&mut signals, Duration::from_secs(3), |signal| {
        matches!(
            signal,
            EngineSignal::ValidationRejected { account_id: id, command, .. }
                if *id == account && command == "internal_auto_transfer"
        )
    })
    .await;

    // no partial transfer was persisted
    assert_eq!(app.balance(account).await, usd(100_00));
}
