use money2::Money;
use thiserror::Error;

/// Business-rule rejections produced by `decide`. None of these mutate state
/// or reach the journal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("account is not active")]
    AccountNotActive,

    #[error("account card is locked")]
    AccountCardLocked,

    #[error("insufficient balance: {balance} available, {requested} requested")]
    InsufficientBalance { balance: Money, requested: Money },

    #[error("daily debit limit {limit} exceeded with {accrued} already accrued")]
    ExceededDailyDebit { limit: Money, accrued: Money },

    #[error("monthly debit limit {limit} exceeded with {accrued} already accrued")]
    ExceededMonthlyDebit { limit: Money, accrued: Money },

    #[error("transfer recipient is not registered")]
    RecipientNotRegistered,

    #[error("transfer recipient registration is deactivated")]
    RecipientDeactivated,

    #[error("transfer already progressed to approved or rejected")]
    TransferAlreadyProgressedToApprovedOrRejected,

    #[error("transfer progress unchanged")]
    TransferProgressNoChange,

    #[error("account is not ready to activate")]
    AccountNotReadyToActivate,

    #[error("deposit amount too small")]
    DepositTooSmall,

    #[error("debit amount must be positive")]
    DebitAmountNotPositive,

    #[error("date must be a non-default future date")]
    DateNotDefault,

    #[error("transfer sender must be registered with the recipient account")]
    SenderRegistrationRequired,

    #[error("validation failure on {field}: {reason}")]
    ValidationFailure { field: String, reason: String },
}

impl AccountError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailure { field: field.into(), reason: reason.into() }
    }

    /// Idempotent-duplicate rejections: logged at debug, no broadcast, no
    /// compensating command.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            Self::TransferProgressNoChange
                | Self::TransferAlreadyProgressedToApprovedOrRejected
                | Self::AccountNotReadyToActivate
        )
    }
}
