use crate::journal::JournalError;
use crate::runtime::{AskError, DeliveryError};
use crate::services::ServiceError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("{0}")]
    Journal(#[from] JournalError),

    #[error("{0}")]
    Delivery(#[from] DeliveryError),

    #[error("{0}")]
    Ask(#[from] AskError),

    #[error("{0}")]
    Service(#[from] ServiceError),

    #[error("failed to load engine settings: {0}")]
    Settings(#[from] config::ConfigError),
}
