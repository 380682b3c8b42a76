use chrono::{DateTime, Utc};
use money2::{Currency, Money};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod account;
pub mod employee;
pub mod transfer;

pub use account::{
    Account, AccountCommand, AccountCommandData, AccountEnvelope, AccountError, AccountEvent,
    AccountEventData, AccountPolicy, AccountSnapshot, AccountStatus, AutoTransferConfig,
    AutoTransferFrequency, AutoTransferRule, CardPurchaseInfo, ComputedTransfer,
    DistributionDestination, InternalTarget, MaintenanceFeeCriteria, MaintenanceFeePolicy,
};
pub use employee::{
    Card, Employee, EmployeeCommand, EmployeeCommandData, EmployeeEnvelope, EmployeeError,
    EmployeeEvent, EmployeeEventData, EmployeeRole, EmployeeStatus, InviteToken, Purchase,
};
pub use transfer::{
    DomesticRecipient, DomesticTransferProgress, FailedDomesticTransfer, InFlightTransfer,
    RecipientId, RecipientRegistrationStatus, TransferKind, TransferRecipient,
    TransferRejectionReason,
};

pub static ZERO_MONEY: Lazy<Money> = Lazy::new(|| Money::new(0, 2, Currency::Usd));

/// Zero in the given currency, for balance-bound checks outside USD accounts.
pub fn zero_money(currency: Currency) -> Money {
    Money::new(0, 2, currency)
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.as_simple())
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id! {
    /// Stable identifier of an account aggregate.
    AccountId
}

uuid_id! {
    /// Organization owning a set of accounts and employees.
    OrgId
}

uuid_id! {
    /// Stable identifier of an employee aggregate.
    EmployeeId
}

uuid_id! {
    /// Threads a multi-step workflow: a transfer's pending event and its
    /// terminal approved/rejected/deposited counterparts share one id.
    CorrelationId
}

uuid_id! {
    CardId
}

uuid_id! {
    /// Identifies a configured auto-transfer rule on an account.
    RuleId
}

uuid_id! {
    /// Who initiated a command: an account owner, an employee, or the system.
    InitiatorId
}

impl InitiatorId {
    /// Commands the engine originates itself (billing, auto-transfer, retry).
    pub const fn system() -> Self {
        Self::from_uuid(Uuid::nil())
    }
}

/// Base metadata carried by every command and event of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeBase<Id> {
    pub entity_id: Id,
    pub org_id: OrgId,
    pub correlation_id: CorrelationId,
    pub initiated_by: InitiatorId,
    pub timestamp: DateTime<Utc>,
}

impl<Id: Copy> EnvelopeBase<Id> {
    pub fn new(entity_id: Id, org_id: OrgId, initiated_by: InitiatorId) -> Self {
        Self {
            entity_id,
            org_id,
            correlation_id: CorrelationId::new(),
            initiated_by,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// One billing cycle per (month, year) per account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub month: u32,
    pub year: i32,
}

impl BillingPeriod {
    pub fn from_date(date: DateTime<Utc>) -> Self {
        use chrono::Datelike;
        Self { month: date.month(), year: date.year() }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_billing_period_from_date() {
        let date = Utc.with_ymd_and_hms(2023, 11, 5, 10, 30, 0).unwrap();
        assert_eq!(BillingPeriod::from_date(date), BillingPeriod { month: 11, year: 2023 });
    }

    #[test]
    fn test_account_id_serde_transparent() {
        let id = AccountId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let back: AccountId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
