use super::envelope::{Confirmation, Envelope};
use super::{EntityBehavior, EventApplier, RuntimeInner, ShardIndexEvent};
use crate::journal::{EventJournal, JournalError, SequenceNumber, SnapshotStore};
use futures::TryStreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-activation state handed to the behavior with every message. Owns the
/// recovered aggregate state and the journal cursor; all persistence flows
/// through `persist` so confirmation and sequence bookkeeping stay in one
/// place.
pub struct EntityContext<S, E> {
    entity_id: String,
    state: S,
    sequence: SequenceNumber,
    journal: Arc<dyn EventJournal<Event = E>>,
    snapshots: Arc<dyn SnapshotStore<State = S>>,
    applier: EventApplier<S, E>,
    pending_confirmation: Option<Confirmation>,
    delivery_attempt: u32,
    persist_failed: bool,
    stopping: bool,
    deleted: bool,
}

impl<S, E> EntityContext<S, E>
where
    E: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    S: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Non-evented state mutation, reserved for the journal-deletion path
    /// where history no longer exists to carry an event.
    pub(crate) fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// 1 on first delivery; higher numbers mark at-least-once redeliveries.
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// Journals the events, applies them to the in-memory state and settles
    /// the current envelope's confirmation. On failure nothing is applied and
    /// the envelope stays unconfirmed so the sender redelivers.
    pub async fn persist(&mut self, events: Vec<E>) -> Result<&S, JournalError> {
        match self.journal.append(&self.entity_id, self.sequence, events.clone()).await {
            Ok(new_sequence) => {
                for event in &events {
                    (self.applier)(&mut self.state, event);
                }
                self.sequence = new_sequence;
                if let Some(confirmation) = self.pending_confirmation.take() {
                    confirmation.settle();
                }
                Ok(&self.state)
            },
            Err(err) => {
                self.persist_failed = true;
                Err(err)
            },
        }
    }

    pub async fn persist_one(&mut self, event: E) -> Result<&S, JournalError> {
        self.persist(vec![event]).await
    }

    /// Stop after the current message; a final snapshot is written.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    /// Soft-deletes the entity's journal and snapshot, then stops without
    /// writing a new snapshot. The next activation starts from a blank state.
    pub async fn soft_delete_and_stop(&mut self) -> Result<(), JournalError> {
        self.journal.delete_up_to(&self.entity_id, self.sequence).await?;
        self.snapshots.delete(&self.entity_id).await?;
        self.deleted = true;
        self.stopping = true;
        Ok(())
    }

    fn begin_message(&mut self, confirmation: Option<Confirmation>, delivery_attempt: u32) {
        self.pending_confirmation = confirmation;
        self.delivery_attempt = delivery_attempt;
        self.persist_failed = false;
    }

    /// A message that validly produced no event still confirms; only a failed
    /// persist leaves the envelope unsettled.
    fn finish_message(&mut self) {
        if let Some(confirmation) = self.pending_confirmation.take() {
            if !self.persist_failed {
                confirmation.settle();
            }
        }
    }
}

async fn recover<B: EntityBehavior>(
    inner: &RuntimeInner<B>, entity_id: &str, initial: B::State,
    applier: &EventApplier<B::State, B::Event>,
) -> Result<(B::State, SequenceNumber), JournalError> {
    let (mut state, mut sequence) = match inner.snapshots.latest(entity_id).await? {
        Some((sequence, snapshot)) => (snapshot, sequence),
        None => (initial, 0),
    };

    let mut stream = inner.journal.read(entity_id, sequence + 1, u64::MAX).await?;
    while let Some(event) = stream.try_next().await? {
        (applier)(&mut state, &event.payload);
        sequence = event.sequence;
    }
    // deletions keep the high-water mark above the last surviving row
    let highest = inner.journal.highest_sequence(entity_id).await?;
    if sequence < highest {
        sequence = highest;
    }
    Ok((state, sequence))
}

enum IdleOutcome<M> {
    Passivated,
    Resumed(Vec<Envelope<M>>, mpsc::Receiver<Envelope<M>>),
}

/// Passivation swaps the shard slot under the shard lock so no message is
/// lost: anything already buffered is drained and processed by this same
/// task on a fresh mailbox.
async fn try_passivate<B: EntityBehavior>(
    inner: &RuntimeInner<B>, entity_id: &str, rx: &mut mpsc::Receiver<Envelope<B::Message>>,
) -> IdleOutcome<B::Message> {
    let mut shard = inner.shard_map(entity_id).lock().await;
    rx.close();
    let mut leftovers = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        leftovers.push(envelope);
    }

    if leftovers.is_empty() {
        shard.remove(entity_id);
        IdleOutcome::Passivated
    } else {
        let (tx, new_rx) = mpsc::channel(inner.settings.mailbox_capacity);
        shard.insert(entity_id.to_string(), tx);
        IdleOutcome::Resumed(leftovers, new_rx)
    }
}

pub(crate) async fn run_entity<B: EntityBehavior>(
    inner: Arc<RuntimeInner<B>>, entity_id: String, mut rx: mpsc::Receiver<Envelope<B::Message>>,
) {
    let mut behavior = (inner.factory)(&entity_id);
    let applier = behavior.applier();

    let (state, sequence) =
        match recover::<B>(&inner, &entity_id, behavior.initial_state(), &applier).await {
            Ok(recovered) => recovered,
            Err(err) => {
                tracing::error!(
                    entity_type = B::entity_type(),
                    %entity_id,
                    error = %err,
                    "replay failed; entity will not start"
                );
                inner.raise_alert(&entity_id, format!("replay failed: {err}"));
                let mut shard = inner.shard_map(&entity_id).lock().await;
                shard.remove(&entity_id);
                return;
            },
        };

    tracing::debug!(entity_type = B::entity_type(), %entity_id, sequence, "entity activated");
    inner
        .append_index(&entity_id, ShardIndexEvent::Registered { entity_id: entity_id.clone() })
        .await;

    let mut ctx = EntityContext {
        entity_id: entity_id.clone(),
        state,
        sequence,
        journal: Arc::clone(&inner.journal),
        snapshots: Arc::clone(&inner.snapshots),
        applier,
        pending_confirmation: None,
        delivery_attempt: 1,
        persist_failed: false,
        stopping: false,
        deleted: false,
    };

    let mut pending: VecDeque<Envelope<B::Message>> = VecDeque::new();
    loop {
        let envelope = match pending.pop_front() {
            Some(envelope) => envelope,
            None => {
                match tokio::time::timeout(inner.settings.passivate_after, rx.recv()).await {
                    Ok(Some(envelope)) => envelope,
                    // runtime dropped the sender side; nothing left to do
                    Ok(None) => return,
                    Err(_) => match try_passivate(&inner, &entity_id, &mut rx).await {
                        IdleOutcome::Passivated => {
                            passivate(&inner, &entity_id, &mut behavior, &mut ctx, false).await;
                            return;
                        },
                        IdleOutcome::Resumed(leftovers, new_rx) => {
                            rx = new_rx;
                            pending.extend(leftovers);
                            continue;
                        },
                    },
                }
            },
        };

        ctx.begin_message(envelope.confirmation, envelope.delivery_attempt);
        behavior.on_message(&mut ctx, envelope.payload).await;
        ctx.finish_message();

        if ctx.stopping {
            let mut shard = inner.shard_map(&entity_id).lock().await;
            rx.close();
            let mut dead_letters = 0;
            while rx.try_recv().is_ok() {
                dead_letters += 1;
            }
            dead_letters += pending.len();
            shard.remove(&entity_id);
            drop(shard);
            if dead_letters > 0 {
                tracing::warn!(
                    entity_type = B::entity_type(),
                    %entity_id,
                    dead_letters,
                    "messages dead-lettered during entity stop"
                );
            }
            let deleted = ctx.deleted;
            passivate(&inner, &entity_id, &mut behavior, &mut ctx, deleted).await;
            return;
        }
    }
}

async fn passivate<B: EntityBehavior>(
    inner: &RuntimeInner<B>, entity_id: &str, behavior: &mut B,
    ctx: &mut EntityContext<B::State, B::Event>, deleted: bool,
) {
    behavior.on_passivate(ctx).await;
    if !deleted {
        if let Err(err) = inner.snapshots.write(entity_id, ctx.sequence, &ctx.state).await {
            tracing::warn!(
                entity_type = B::entity_type(),
                %entity_id,
                error = %err,
                "final snapshot failed; next activation replays the journal"
            );
        }
    }
    inner
        .append_index(entity_id, ShardIndexEvent::Passivated { entity_id: entity_id.to_string() })
        .await;
    tracing::debug!(entity_type = B::entity_type(), %entity_id, "entity passivated");
}
