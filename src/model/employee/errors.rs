use money2::Money;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmployeeError {
    #[error("employee is not active")]
    EmployeeNotActive,

    #[error("card is not configured for this employee")]
    CardNotFound,

    #[error("card daily limit {limit} exceeded with {accrued} already spent")]
    ExceededDailyDebit { limit: Money, accrued: Money },

    #[error("card monthly limit {limit} exceeded with {accrued} already spent")]
    ExceededMonthlyDebit { limit: Money, accrued: Money },

    #[error("invitation token does not match")]
    InvalidInviteToken,

    #[error("debit amount must be positive")]
    DebitAmountNotPositive,

    #[error("purchase already progressed to approved or declined")]
    PurchaseAlreadyProgressed,

    #[error("validation failure on {field}: {reason}")]
    ValidationFailure { field: String, reason: String },
}

impl EmployeeError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailure { field: field.into(), reason: reason.into() }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::PurchaseAlreadyProgressed)
    }
}
