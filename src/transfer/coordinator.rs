use crate::actor::account::AccountRoute;
use crate::model::{
    AccountCommand, AccountCommandData, AccountEnvelope, AccountEvent, AccountEventData,
    AccountId, AccountStatus, OrgId, RuleId, TransferKind, TransferRejectionReason,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    pub max_attempts: u32,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub base_backoff: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub max_backoff: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        }
    }
}

#[derive(Debug)]
struct TransferRequest {
    pending: AccountEvent,
    sender_name: String,
}

/// Extracted view of an internal pending event the coordinator can act on.
struct TransferDetails {
    kind: TransferKind,
    amount: money2::Money,
    recipient_account_id: AccountId,
    recipient_org_id: Option<OrgId>,
    rule_id: Option<RuleId>,
}

impl TransferDetails {
    fn from_event(event: &AccountEvent) -> Option<Self> {
        match &event.data {
            AccountEventData::InternalTransferWithinOrgPending {
                amount,
                recipient_account_id,
                ..
            } => Some(Self {
                kind: TransferKind::InternalWithinOrg,
                amount: *amount,
                recipient_account_id: *recipient_account_id,
                recipient_org_id: None,
                rule_id: None,
            }),
            AccountEventData::InternalTransferBetweenOrgsPending {
                amount,
                recipient_account_id,
                recipient_org_id,
                ..
            } => Some(Self {
                kind: TransferKind::InternalBetweenOrgs,
                amount: *amount,
                recipient_account_id: *recipient_account_id,
                recipient_org_id: Some(*recipient_org_id),
                rule_id: None,
            }),
            AccountEventData::InternalAutomatedTransferPending {
                amount,
                recipient_account_id,
                rule_id,
                ..
            } => Some(Self {
                kind: TransferKind::Automated,
                amount: *amount,
                recipient_account_id: *recipient_account_id,
                recipient_org_id: None,
                rule_id: Some(*rule_id),
            }),
            _ => None,
        }
    }
}

/// Child coordinator driving the multi-step internal transfer workflow for
/// one sender account. Spawned on the first pending transfer and dropped
/// with the sender entity; requests are handled strictly in order.
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    tx: mpsc::Sender<TransferRequest>,
}

impl TransferCoordinator {
    pub fn spawn(accounts: AccountRoute, settings: CoordinatorSettings) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run(accounts, settings, rx));
        Self { tx }
    }

    pub async fn submit(&self, pending: AccountEvent, sender_name: String) {
        if self.tx.send(TransferRequest { pending, sender_name }).await.is_err() {
            tracing::error!("transfer coordinator stopped; pending transfer request dropped");
        }
    }
}

async fn run(
    accounts: AccountRoute, settings: CoordinatorSettings, mut rx: mpsc::Receiver<TransferRequest>,
) {
    while let Some(request) = rx.recv().await {
        handle(&accounts, &settings, request).await;
    }
}

#[tracing::instrument(level = "debug", skip(accounts, settings, request), fields(correlation_id = %request.pending.base.correlation_id))]
async fn handle(accounts: &AccountRoute, settings: &CoordinatorSettings, request: TransferRequest) {
    let pending = &request.pending;
    let Some(details) = TransferDetails::from_event(pending) else {
        tracing::warn!(event = %pending.event_type(), "coordinator received a non-pending event");
        return;
    };

    // recipient lookup with bounded retries; an ask timeout means the
    // recipient shard is unavailable, not that the account is missing
    let mut lookup = None;
    let mut backoff = settings.base_backoff;
    for attempt in 1..=settings.max_attempts.max(1) {
        match accounts.get(details.recipient_account_id).await {
            Ok(snapshot) => {
                lookup = Some(snapshot);
                break;
            },
            Err(err) => {
                tracing::warn!(
                    attempt,
                    recipient = %details.recipient_account_id,
                    error = %err,
                    "recipient lookup failed"
                );
                if attempt < settings.max_attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(settings.max_backoff);
                }
            },
        }
    }

    let reject = |reason: TransferRejectionReason| {
        AccountCommand::new(
            AccountEnvelope::new(pending.base.entity_id, pending.base.org_id, pending.base.initiated_by)
                .with_correlation(pending.base.correlation_id),
            AccountCommandData::RejectInternalTransfer { reason },
        )
    };

    let snapshot = match lookup {
        None => {
            send(accounts, reject(TransferRejectionReason::Unknown)).await;
            return;
        },
        Some(None) => {
            send(accounts, reject(TransferRejectionReason::InvalidAccountInfo)).await;
            return;
        },
        Some(Some(snapshot)) => snapshot,
    };

    if snapshot.status != AccountStatus::Active {
        send(accounts, reject(TransferRejectionReason::AccountClosed)).await;
        return;
    }

    // between-orgs deposits require the sender registered on the recipient
    if details.kind == TransferKind::InternalBetweenOrgs
        && !snapshot.has_registered_sender(pending.base.entity_id)
    {
        let register = AccountCommand::new(
            AccountEnvelope::new(snapshot.account_id, snapshot.org_id, pending.base.initiated_by),
            AccountCommandData::RegisterInternalSender {
                sender_id: pending.base.entity_id,
                sender_org_id: pending.base.org_id,
                sender_name: request.sender_name.clone(),
            },
        );
        send(accounts, register).await;
    }

    let approve = AccountCommand::new(
        AccountEnvelope::new(pending.base.entity_id, pending.base.org_id, pending.base.initiated_by)
            .with_correlation(pending.base.correlation_id),
        AccountCommandData::ApproveInternalTransfer,
    );
    send(accounts, approve).await;

    let deposit_data = match details.kind {
        TransferKind::InternalWithinOrg => AccountCommandData::DepositTransferWithinOrg {
            amount: details.amount,
            sender_id: pending.base.entity_id,
            sender_name: request.sender_name.clone(),
        },
        TransferKind::InternalBetweenOrgs => AccountCommandData::DepositTransferBetweenOrgs {
            amount: details.amount,
            sender_id: pending.base.entity_id,
            sender_org_id: pending.base.org_id,
            sender_name: request.sender_name.clone(),
        },
        TransferKind::Automated => AccountCommandData::DepositAutomatedTransfer {
            amount: details.amount,
            sender_id: pending.base.entity_id,
            sender_name: request.sender_name.clone(),
            rule_id: details.rule_id.unwrap_or_default(),
        },
        TransferKind::Domestic => return,
    };
    let deposit = AccountCommand::new(
        AccountEnvelope::new(
            snapshot.account_id,
            details.recipient_org_id.unwrap_or(snapshot.org_id),
            pending.base.initiated_by,
        )
        .with_correlation(pending.base.correlation_id),
        deposit_data,
    );
    send(accounts, deposit).await;
}

async fn send(accounts: &AccountRoute, command: AccountCommand) {
    if let Err(err) = accounts.send_command(command.clone()).await {
        tracing::error!(
            command = %command.name(),
            account_id = %command.account_id(),
            error = %err,
            "coordinator command delivery failed"
        );
    }
}
