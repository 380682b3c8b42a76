use super::{EventJournal, JournalError, JournaledEvent, SequenceNumber, SnapshotStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

type Tagger<E> = Box<dyn Fn(&E) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredRow {
    sequence: SequenceNumber,
    payload: serde_json::Value,
    recorded_at: DateTime<Utc>,
    tags: Vec<String>,
}

#[derive(Debug, Default)]
struct EntityLog {
    rows: Vec<StoredRow>,
    /// High-water mark survives `delete_up_to` so sequences never reset.
    highest: SequenceNumber,
}

/// In-memory journal backing local nodes and tests. Rows hold serialized JSON
/// so every append/read exercises the same serde path a durable store would.
pub struct MemoryJournal<E> {
    logs: RwLock<HashMap<String, EntityLog>>,
    tagger: Option<Tagger<E>>,
    fail_appends: AtomicBool,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Default for MemoryJournal<E> {
    fn default() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            tagger: None,
            fail_appends: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }
}

impl<E> MemoryJournal<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tagger(tagger: impl Fn(&E) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self { tagger: Some(Box::new(tagger)), ..Self::default() }
    }

    /// Failure injection for persist-failure paths.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<E> EventJournal for MemoryJournal<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Event = E;

    async fn append(
        &self, entity_id: &str, expected_seq: SequenceNumber, events: Vec<E>,
    ) -> Result<SequenceNumber, JournalError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(JournalError::Backend("append failure injected".to_string()));
        }

        let mut logs = self.logs.write().await;
        let log = logs.entry(entity_id.to_string()).or_default();
        if log.highest != expected_seq {
            return Err(JournalError::Conflict {
                entity_id: entity_id.to_string(),
                expected: expected_seq,
                actual: log.highest,
            });
        }

        for event in &events {
            let tags = self.tagger.as_ref().map(|tag| tag(event)).unwrap_or_default();
            log.highest += 1;
            log.rows.push(StoredRow {
                sequence: log.highest,
                payload: serde_json::to_value(event)?,
                recorded_at: Utc::now(),
                tags,
            });
        }
        Ok(log.highest)
    }

    async fn read(
        &self, entity_id: &str, from_seq: SequenceNumber, to_seq: SequenceNumber,
    ) -> Result<BoxStream<'static, Result<JournaledEvent<E>, JournalError>>, JournalError> {
        let logs = self.logs.read().await;
        let rows: Vec<_> = logs
            .get(entity_id)
            .map(|log| {
                log.rows
                    .iter()
                    .filter(|row| from_seq <= row.sequence && row.sequence <= to_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let entity_id = entity_id.to_string();

        Ok(futures::stream::iter(rows.into_iter().map(move |row| {
            let payload = serde_json::from_value(row.payload)?;
            Ok(JournaledEvent {
                entity_id: entity_id.clone(),
                sequence: row.sequence,
                payload,
                recorded_at: row.recorded_at,
            })
        }))
        .boxed())
    }

    async fn highest_sequence(&self, entity_id: &str) -> Result<SequenceNumber, JournalError> {
        let logs = self.logs.read().await;
        Ok(logs.get(entity_id).map(|log| log.highest).unwrap_or(0))
    }

    async fn delete_up_to(
        &self, entity_id: &str, seq: SequenceNumber,
    ) -> Result<(), JournalError> {
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get_mut(entity_id) {
            log.rows.retain(|row| seq < row.sequence);
        }
        Ok(())
    }

    async fn current_events_by_tag(
        &self, tag: &str,
    ) -> Result<Vec<JournaledEvent<E>>, JournalError> {
        let logs = self.logs.read().await;
        let mut matched = Vec::new();
        for (entity_id, log) in logs.iter() {
            for row in &log.rows {
                if row.tags.iter().any(|t| t == tag) {
                    matched.push((entity_id.clone(), row.clone()));
                }
            }
        }
        matched.sort_by_key(|(_, row)| row.recorded_at);

        matched
            .into_iter()
            .map(|(entity_id, row)| {
                let payload = serde_json::from_value(row.payload)?;
                Ok(JournaledEvent {
                    entity_id,
                    sequence: row.sequence,
                    payload,
                    recorded_at: row.recorded_at,
                })
            })
            .collect()
    }
}

/// In-memory snapshot store keyed by entity id; keeps only the latest.
pub struct MemorySnapshotStore<S> {
    snapshots: RwLock<HashMap<String, (SequenceNumber, serde_json::Value)>>,
    _marker: PhantomData<fn() -> S>,
}

impl<S> Default for MemorySnapshotStore<S> {
    fn default() -> Self {
        Self { snapshots: RwLock::new(HashMap::new()), _marker: PhantomData }
    }
}

impl<S> MemorySnapshotStore<S> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S> SnapshotStore for MemorySnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type State = S;

    async fn write(
        &self, entity_id: &str, sequence: SequenceNumber, state: &S,
    ) -> Result<(), JournalError> {
        let value = serde_json::to_value(state)?;
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(entity_id.to_string(), (sequence, value));
        Ok(())
    }

    async fn latest(
        &self, entity_id: &str,
    ) -> Result<Option<(SequenceNumber, S)>, JournalError> {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(entity_id) {
            None => Ok(None),
            Some((sequence, value)) => {
                let state = serde_json::from_value(value.clone())?;
                Ok(Some((*sequence, state)))
            },
        }
    }

    async fn delete(&self, entity_id: &str) -> Result<(), JournalError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(entity_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    #[tokio::test]
    async fn test_append_assigns_gap_free_sequences() {
        let journal = MemoryJournal::<Tick>::new();
        let seq = journal
            .append("e1", 0, vec![Tick { n: 1 }, Tick { n: 2 }])
            .await
            .unwrap();
        assert_eq!(seq, 2);
        let seq = journal.append("e1", 2, vec![Tick { n: 3 }]).await.unwrap();
        assert_eq!(seq, 3);

        let events: Vec<_> = journal
            .read("e1", 1, SequenceNumber::MAX)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(events.iter().map(|e| e.payload.n).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_append_with_stale_sequence_conflicts() {
        let journal = MemoryJournal::<Tick>::new();
        journal.append("e1", 0, vec![Tick { n: 1 }]).await.unwrap();

        let err = journal.append("e1", 0, vec![Tick { n: 2 }]).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_up_to_preserves_high_water_mark() {
        let journal = MemoryJournal::<Tick>::new();
        journal
            .append("e1", 0, vec![Tick { n: 1 }, Tick { n: 2 }])
            .await
            .unwrap();
        journal.delete_up_to("e1", 2).await.unwrap();

        let events: Vec<_> = journal
            .read("e1", 1, SequenceNumber::MAX)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(events.is_empty());

        // appends continue above the deleted range
        let seq = journal.append("e1", 2, vec![Tick { n: 3 }]).await.unwrap();
        assert_eq!(seq, 3);
    }

    #[tokio::test]
    async fn test_events_by_tag_span_entities() {
        let journal = MemoryJournal::<Tick>::with_tagger(|tick| {
            if tick.n % 2 == 0 {
                vec!["even".to_string()]
            } else {
                vec![]
            }
        });
        journal.append("a", 0, vec![Tick { n: 1 }, Tick { n: 2 }]).await.unwrap();
        journal.append("b", 0, vec![Tick { n: 4 }]).await.unwrap();

        let tagged = journal.current_events_by_tag("even").await.unwrap();
        assert_eq!(tagged.len(), 2);
        assert_eq!(tagged.iter().map(|e| e.payload.n).collect::<Vec<_>>(), vec![2, 4]);
    }

    #[tokio::test]
    async fn test_snapshot_store_keeps_latest_only() {
        let store = MemorySnapshotStore::<Tick>::new();
        store.write("e1", 3, &Tick { n: 3 }).await.unwrap();
        store.write("e1", 7, &Tick { n: 7 }).await.unwrap();

        let (seq, state) = store.latest("e1").await.unwrap().unwrap();
        assert_eq!(seq, 7);
        assert_eq!(state, Tick { n: 7 });

        store.delete("e1").await.unwrap();
        assert!(store.latest("e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_append_failure_surfaces_as_backend_error() {
        let journal = MemoryJournal::<Tick>::new();
        journal.set_fail_appends(true);
        let err = journal.append("e1", 0, vec![Tick { n: 1 }]).await.unwrap_err();
        assert!(matches!(err, JournalError::Backend(_)));

        journal.set_fail_appends(false);
        assert_eq!(journal.append("e1", 0, vec![Tick { n: 1 }]).await.unwrap(), 1);
    }
}
