use crate::model::{AccountId, BillingPeriod, InviteToken, OrgId, RecipientId, TransferKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use money2::Money;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("downstream service unavailable: {0}")]
    Unavailable(String),
}

/// Tagged outbound notifications; rendering and delivery live outside the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailMessage {
    BillingStatement {
        email: String,
        account_id: AccountId,
        period: BillingPeriod,
    },
    AccountOpen {
        email: String,
        owner_name: String,
    },
    AccountClose {
        email: String,
        owner_name: String,
    },
    TransferDeposited {
        email: String,
        amount: Money,
        sender_name: String,
    },
    PurchaseDeclined {
        email: String,
        reason: String,
    },
    EmployeeInvite {
        email: String,
        token: InviteToken,
    },
}

#[async_trait]
pub trait EmailApi: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), ServiceError>;
}

/// Data handed to the external scheduler; it is expected to eventually
/// deliver the matching command back through the command ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTransfer {
    pub account_id: AccountId,
    pub org_id: OrgId,
    pub kind: TransferKind,
    pub amount: Money,
    pub recipient_id: RecipientId,
    pub scheduled_date: DateTime<Utc>,
}

#[async_trait]
pub trait SchedulerApi: Send + Sync {
    async fn schedule_internal_transfer_between_orgs(
        &self, transfer: ScheduledTransfer,
    ) -> Result<(), ServiceError>;

    async fn schedule_domestic_transfer(
        &self, transfer: ScheduledTransfer,
    ) -> Result<(), ServiceError>;

    /// Drops every recurring obligation (maintenance fee, scheduled
    /// transfers) for a closing account.
    async fn remove_account_obligations(&self, account_id: AccountId) -> Result<(), ServiceError>;

    async fn schedule_billing_fanout(&self, cron: &str) -> Result<(), ServiceError>;
}

/// Account identity as projected into the read model.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_id: AccountId,
    pub org_id: OrgId,
}

/// The active-account query the billing fan-out runs against the read model.
#[async_trait]
pub trait AccountReadModelApi: Send + Sync {
    /// Active accounts whose last billing cycle is absent or older than the
    /// cutoff.
    async fn active_account_ids(
        &self, last_cycle_before: DateTime<Utc>,
    ) -> Result<Vec<AccountRef>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingStatement {
    pub account_id: AccountId,
    pub org_id: OrgId,
    pub period: BillingPeriod,
    pub balance: Money,
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait BillingStatementApi: Send + Sync {
    async fn append(&self, statement: BillingStatement) -> Result<(), ServiceError>;
}

/// Default no-op collaborators for local nodes without wired integrations.
#[derive(Debug, Copy, Clone, Default)]
pub struct HappyPathServices;

#[async_trait]
impl EmailApi for HappyPathServices {
    async fn send(&self, message: EmailMessage) -> Result<(), ServiceError> {
        tracing::info!(?message, "email queued");
        Ok(())
    }
}

#[async_trait]
impl SchedulerApi for HappyPathServices {
    async fn schedule_internal_transfer_between_orgs(
        &self, transfer: ScheduledTransfer,
    ) -> Result<(), ServiceError> {
        tracing::info!(?transfer, "internal transfer scheduled");
        Ok(())
    }

    async fn schedule_domestic_transfer(
        &self, transfer: ScheduledTransfer,
    ) -> Result<(), ServiceError> {
        tracing::info!(?transfer, "domestic transfer scheduled");
        Ok(())
    }

    async fn remove_account_obligations(&self, account_id: AccountId) -> Result<(), ServiceError> {
        tracing::info!(%account_id, "scheduled obligations removed");
        Ok(())
    }

    async fn schedule_billing_fanout(&self, cron: &str) -> Result<(), ServiceError> {
        tracing::info!(%cron, "billing fan-out scheduled");
        Ok(())
    }
}

#[async_trait]
impl BillingStatementApi for HappyPathServices {
    async fn append(&self, statement: BillingStatement) -> Result<(), ServiceError> {
        tracing::info!(?statement, "billing statement appended");
        Ok(())
    }
}

/// Recording collaborators: every call is captured for assertions. Used by
/// the integration harness and usable as an audit tap on local nodes.
#[derive(Debug, Default)]
pub struct RecordingServices {
    pub emails: Mutex<Vec<EmailMessage>>,
    pub scheduled_transfers: Mutex<Vec<ScheduledTransfer>>,
    pub removed_obligations: Mutex<Vec<AccountId>>,
    pub statements: Mutex<Vec<BillingStatement>>,
}

impl RecordingServices {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmailApi for RecordingServices {
    async fn send(&self, message: EmailMessage) -> Result<(), ServiceError> {
        self.emails.lock().await.push(message);
        Ok(())
    }
}

#[async_trait]
impl SchedulerApi for RecordingServices {
    async fn schedule_internal_transfer_between_orgs(
        &self, transfer: ScheduledTransfer,
    ) -> Result<(), ServiceError> {
        self.scheduled_transfers.lock().await.push(transfer);
        Ok(())
    }

    async fn schedule_domestic_transfer(
        &self, transfer: ScheduledTransfer,
    ) -> Result<(), ServiceError> {
        self.scheduled_transfers.lock().await.push(transfer);
        Ok(())
    }

    async fn remove_account_obligations(&self, account_id: AccountId) -> Result<(), ServiceError> {
        self.removed_obligations.lock().await.push(account_id);
        Ok(())
    }

    async fn schedule_billing_fanout(&self, _cron: &str) -> Result<(), ServiceError> {
        Ok(())
    }
}

#[async_trait]
impl BillingStatementApi for RecordingServices {
    async fn append(&self, statement: BillingStatement) -> Result<(), ServiceError> {
        self.statements.lock().await.push(statement);
        Ok(())
    }
}

/// In-memory stand-in for the SQL read model consumed by the billing
/// fan-out. Populated by whatever projection the deployment runs.
#[derive(Debug, Default)]
pub struct InMemoryReadModel {
    entries: Mutex<HashMap<AccountRef, Option<DateTime<Utc>>>>,
}

impl InMemoryReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, account: AccountRef, last_billing_cycle: Option<DateTime<Utc>>) {
        self.entries.lock().await.insert(account, last_billing_cycle);
    }

    pub async fn remove(&self, account: AccountRef) {
        self.entries.lock().await.remove(&account);
    }
}

#[async_trait]
impl AccountReadModelApi for InMemoryReadModel {
    async fn active_account_ids(
        &self, last_cycle_before: DateTime<Utc>,
    ) -> Result<Vec<AccountRef>, ServiceError> {
        let entries = self.entries.lock().await;
        let accounts = entries
            .iter()
            .filter(|(_, last)| match last {
                None => true,
                Some(date) => *date < last_cycle_before,
            })
            .map(|(account, _)| *account)
            .sorted()
            .collect();
        Ok(accounts)
    }
}
