use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Identifies one delivery attempt for logging and duplicate tracing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ConfirmationId(Uuid);

impl ConfirmationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConfirmationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfirmationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// Settled by the entity runtime once the message outcome is durable: either
/// the resulting events were journaled, or the message validly produced none.
/// A persist failure leaves the confirmation unsettled so the sender
/// redelivers.
pub struct Confirmation {
    id: ConfirmationId,
    ack: oneshot::Sender<ConfirmationId>,
}

impl Confirmation {
    pub fn id(&self) -> ConfirmationId {
        self.id
    }

    pub(crate) fn settle(self) {
        // a dropped receiver means the sender gave up waiting; at-least-once
        // redelivery takes over from there
        let _ = self.ack.send(self.id);
    }
}

impl fmt::Debug for Confirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confirmation").field("id", &self.id).finish()
    }
}

/// At-least-once delivery wrapper around every mailbox message.
#[derive(Debug)]
pub struct Envelope<M> {
    pub payload: M,
    pub confirmation: Option<Confirmation>,
    pub delivery_attempt: u32,
}

impl<M> Envelope<M> {
    /// Fire-and-forget: no confirmation, single attempt.
    pub fn tell(payload: M) -> Self {
        Self { payload, confirmation: None, delivery_attempt: 1 }
    }

    /// Confirmable: the returned receiver resolves when the entity settles.
    pub fn confirmable(payload: M, attempt: u32) -> (Self, oneshot::Receiver<ConfirmationId>) {
        let (ack, rx) = oneshot::channel();
        let envelope = Self {
            payload,
            confirmation: Some(Confirmation { id: ConfirmationId::new(), ack }),
            delivery_attempt: attempt,
        };
        (envelope, rx)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("entity mailbox closed and could not be reopened")]
    MailboxClosed,

    #[error("delivery unconfirmed after {attempts} attempts")]
    Unconfirmed { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum AskError {
    #[error("no response within the ask timeout")]
    NoResponse,

    #[error("entity mailbox closed")]
    MailboxClosed,
}
