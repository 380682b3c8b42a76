use crate::model::{AccountId, CorrelationId, OrgId, RuleId};
use chrono::{DateTime, Utc};
use money2::Money;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;

/// Key of a registered transfer recipient on the owning account.
///
/// Internal recipients key by destination account id; domestic recipients by
/// account and routing number so an edit replaces the registration in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    pub fn internal(account_id: AccountId) -> Self {
        Self(account_id.to_string())
    }

    pub fn domestic(account_number: &str, routing_number: &str) -> Self {
        Self(format!("{routing_number}_{account_number}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum RecipientRegistrationStatus {
    Confirmed,
    InvalidAccount,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum DepositoryType {
    Checking,
    Savings,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum PaymentNetwork {
    Ach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomesticRecipient {
    pub name: String,
    pub account_number: String,
    pub routing_number: String,
    pub depository: DepositoryType,
    pub payment_network: PaymentNetwork,
}

impl DomesticRecipient {
    pub fn recipient_id(&self) -> RecipientId {
        RecipientId::domestic(&self.account_number, &self.routing_number)
    }
}

/// A registered counterparty for outbound transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRecipient {
    InternalWithinOrg {
        name: String,
        account_id: AccountId,
        status: RecipientRegistrationStatus,
    },
    InternalBetweenOrgs {
        name: String,
        account_id: AccountId,
        org_id: OrgId,
        status: RecipientRegistrationStatus,
    },
    Domestic {
        recipient: DomesticRecipient,
        status: RecipientRegistrationStatus,
    },
}

impl TransferRecipient {
    pub fn recipient_id(&self) -> RecipientId {
        match self {
            Self::InternalWithinOrg { account_id, .. }
            | Self::InternalBetweenOrgs { account_id, .. } => RecipientId::internal(*account_id),
            Self::Domestic { recipient, .. } => recipient.recipient_id(),
        }
    }

    pub fn status(&self) -> RecipientRegistrationStatus {
        match self {
            Self::InternalWithinOrg { status, .. }
            | Self::InternalBetweenOrgs { status, .. }
            | Self::Domestic { status, .. } => *status,
        }
    }

    pub fn with_status(mut self, new_status: RecipientRegistrationStatus) -> Self {
        match &mut self {
            Self::InternalWithinOrg { status, .. }
            | Self::InternalBetweenOrgs { status, .. }
            | Self::Domestic { status, .. } => *status = new_status,
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Self::InternalWithinOrg { name, .. } | Self::InternalBetweenOrgs { name, .. } => name,
            Self::Domestic { recipient, .. } => &recipient.name,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum TransferKind {
    InternalWithinOrg,
    InternalBetweenOrgs,
    Domestic,
    Automated,
}

/// Why a transfer did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum TransferRejectionReason {
    InvalidAccountInfo,
    AccountClosed,
    InsufficientRecipientInfo,
    Unknown,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum DomesticTransferProgress {
    Outgoing,
    InProgress,
    Complete,
    Failed,
}

impl DomesticTransferProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// A transfer debited from the sender that has not yet reached a terminal
/// approved/rejected state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightTransfer {
    pub correlation_id: CorrelationId,
    pub kind: TransferKind,
    pub recipient_id: RecipientId,
    pub amount: Money,
    pub initiated_at: DateTime<Utc>,
    pub progress: Option<DomesticTransferProgress>,
    /// Set only for rule-driven automated transfers.
    pub rule_id: Option<RuleId>,
}

impl InFlightTransfer {
    pub fn rule_id(&self) -> Option<RuleId> {
        self.rule_id
    }
}

/// A domestic transfer terminally rejected for bad recipient info, retained so
/// an `EditDomesticRecipient` can re-issue it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDomesticTransfer {
    pub correlation_id: CorrelationId,
    pub recipient_id: RecipientId,
    pub amount: Money,
    pub reason: TransferRejectionReason,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_recipient_id_for_domestic_recipient_keys_by_account_and_routing() {
        let recipient = DomesticRecipient {
            name: "Alonzo Church".to_string(),
            account_number: "123456789".to_string(),
            routing_number: "021000021".to_string(),
            depository: DepositoryType::Checking,
            payment_network: PaymentNetwork::Ach,
        };
        assert_eq!(recipient.recipient_id().as_str(), "021000021_123456789");
    }

    #[test]
    fn test_with_status_replaces_registration_status() {
        let recipient = TransferRecipient::InternalWithinOrg {
            name: "payroll".to_string(),
            account_id: AccountId::new(),
            status: RecipientRegistrationStatus::Confirmed,
        };
        let closed = recipient.with_status(RecipientRegistrationStatus::Closed);
        assert_eq!(closed.status(), RecipientRegistrationStatus::Closed);
    }
}
