use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

mod memory;

pub use memory::{MemoryJournal, MemorySnapshotStore};

/// Per-entity sequence numbers are gap-free and start at 1.
pub type SequenceNumber = u64;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("sequence conflict on {entity_id}: expected {expected}, journal at {actual}")]
    Conflict { entity_id: String, expected: SequenceNumber, actual: SequenceNumber },

    #[error("journal backend failure: {0}")]
    Backend(String),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JournalError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// An event as stored: payload plus the journal-assigned metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct JournaledEvent<E> {
    pub entity_id: String,
    pub sequence: SequenceNumber,
    pub payload: E,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only per-entity event log with optimistic concurrency.
///
/// Implementations must commit durably before returning from `append`: the
/// entity runtime acknowledges confirmable envelopes on the strength of that
/// return. Readers see events in sequence order with no gaps.
#[async_trait]
pub trait EventJournal: Send + Sync + 'static {
    type Event: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Appends at `expected_seq` (the highest sequence the writer has seen;
    /// 0 for a fresh entity) and returns the new highest sequence.
    async fn append(
        &self, entity_id: &str, expected_seq: SequenceNumber, events: Vec<Self::Event>,
    ) -> Result<SequenceNumber, JournalError>;

    /// Streams `[from_seq, to_seq]` inclusive for one entity.
    async fn read(
        &self, entity_id: &str, from_seq: SequenceNumber, to_seq: SequenceNumber,
    ) -> Result<BoxStream<'static, Result<JournaledEvent<Self::Event>, JournalError>>, JournalError>;

    async fn highest_sequence(&self, entity_id: &str) -> Result<SequenceNumber, JournalError>;

    /// Soft-deletes history up to and including `seq`. Sequence numbering is
    /// not reset; later appends continue from the old high-water mark.
    async fn delete_up_to(&self, entity_id: &str, seq: SequenceNumber)
        -> Result<(), JournalError>;

    /// Current (non-live) cross-entity stream of all events carrying `tag`,
    /// ordered by record time. Used for read-model rebuild and closure
    /// reconciliation.
    async fn current_events_by_tag(
        &self, tag: &str,
    ) -> Result<Vec<JournaledEvent<Self::Event>>, JournalError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn write(
        &self, entity_id: &str, sequence: SequenceNumber, state: &Self::State,
    ) -> Result<(), JournalError>;

    async fn latest(
        &self, entity_id: &str,
    ) -> Result<Option<(SequenceNumber, Self::State)>, JournalError>;

    async fn delete(&self, entity_id: &str) -> Result<(), JournalError>;
}
