use crate::journal::{EventJournal, JournalError, SnapshotStore};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

mod entity;
mod envelope;
pub mod registry;

pub use entity::EntityContext;
pub use envelope::{AskError, Confirmation, ConfirmationId, DeliveryError, Envelope};

/// How an entity type plugs into the sharded runtime. One instance exists per
/// active entity; `apply` runs for both live persists and journal replay, so
/// it must stay side-effect free.
#[async_trait]
pub trait EntityBehavior: Send + Sized + 'static {
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Event: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Message: Send + 'static;

    fn entity_type() -> &'static str;

    fn initial_state(&self) -> Self::State;

    /// The pure event fold shared by live transitions and replay. Captures
    /// whatever policy the fold needs so the runtime can apply events without
    /// holding the behavior.
    fn applier(&self) -> EventApplier<Self::State, Self::Event>;

    async fn on_message(
        &mut self, ctx: &mut EntityContext<Self::State, Self::Event>, message: Self::Message,
    );

    /// Runs right before the entity leaves memory.
    async fn on_passivate(&mut self, _ctx: &mut EntityContext<Self::State, Self::Event>) {}
}

pub type EventApplier<S, E> = Arc<dyn Fn(&mut S, &E) + Send + Sync>;

/// Raised when an entity cannot start because replay failed. Fatal for the
/// entity; the node keeps running.
#[derive(Debug, Clone)]
pub struct EntityAlert {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub message: String,
}

pub type AlertHook = Box<dyn Fn(EntityAlert) + Send + Sync>;

/// The shard index is itself event-sourced so entities known to a shard are
/// reactivated after a node restart (remember-entities).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardIndexEvent {
    Registered { entity_id: String },
    Passivated { entity_id: String },
}

/// Durations are whole milliseconds in settings files.
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub shard_count: usize,
    pub mailbox_capacity: usize,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub passivate_after: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub ask_timeout: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub confirm_timeout: Duration,
    pub delivery_attempts: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            shard_count: 16,
            mailbox_capacity: 64,
            passivate_after: Duration::from_secs(120),
            ask_timeout: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(5),
            delivery_attempts: 3,
        }
    }
}

type Mailbox<M> = mpsc::Sender<Envelope<M>>;

pub(crate) struct RuntimeInner<B: EntityBehavior> {
    pub(crate) settings: RuntimeSettings,
    pub(crate) journal: Arc<dyn EventJournal<Event = B::Event>>,
    pub(crate) snapshots: Arc<dyn SnapshotStore<State = B::State>>,
    pub(crate) index_journal: Arc<dyn EventJournal<Event = ShardIndexEvent>>,
    pub(crate) factory: Box<dyn Fn(&str) -> B + Send + Sync>,
    pub(crate) shards: Vec<Mutex<HashMap<String, Mailbox<B::Message>>>>,
    pub(crate) alert: Option<AlertHook>,
}

impl<B: EntityBehavior> RuntimeInner<B> {
    pub(crate) fn shard_of(&self, entity_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub(crate) fn shard_map(&self, entity_id: &str) -> &Mutex<HashMap<String, Mailbox<B::Message>>> {
        &self.shards[self.shard_of(entity_id)]
    }

    fn index_entity_id(&self, shard: usize) -> String {
        format!("index-{}-{shard}", B::entity_type())
    }

    pub(crate) fn raise_alert(&self, entity_id: &str, message: String) {
        if let Some(alert) = &self.alert {
            alert(EntityAlert {
                entity_type: B::entity_type(),
                entity_id: entity_id.to_string(),
                message,
            });
        }
    }

    /// Index appends race across entities of one shard; retry on conflict.
    pub(crate) async fn append_index(&self, entity_id: &str, event: ShardIndexEvent) {
        let index_id = self.index_entity_id(self.shard_of(entity_id));
        for _ in 0..8 {
            let current = match self.index_journal.highest_sequence(&index_id).await {
                Ok(seq) => seq,
                Err(err) => {
                    tracing::warn!(%index_id, error = %err, "shard index read failed");
                    return;
                },
            };
            match self.index_journal.append(&index_id, current, vec![event.clone()]).await {
                Ok(_) => return,
                Err(err) if err.is_conflict() => continue,
                Err(err) => {
                    tracing::warn!(%index_id, error = %err, "shard index append failed");
                    return;
                },
            }
        }
        tracing::warn!(%index_id, "shard index append gave up after repeated conflicts");
    }
}

/// Sharded entity runtime: one cooperative task and FIFO mailbox per active
/// entity, partitioned across shards by consistent hash of the entity id.
pub struct EntityRuntime<B: EntityBehavior> {
    inner: Arc<RuntimeInner<B>>,
}

impl<B: EntityBehavior> Clone for EntityRuntime<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: EntityBehavior> EntityRuntime<B> {
    pub fn new(
        journal: Arc<dyn EventJournal<Event = B::Event>>,
        snapshots: Arc<dyn SnapshotStore<State = B::State>>,
        index_journal: Arc<dyn EventJournal<Event = ShardIndexEvent>>,
        settings: RuntimeSettings, factory: impl Fn(&str) -> B + Send + Sync + 'static,
    ) -> Self {
        let shards = (0..settings.shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(RuntimeInner {
                settings,
                journal,
                snapshots,
                index_journal,
                factory: Box::new(factory),
                shards,
                alert: None,
            }),
        }
    }

    pub fn with_alert(mut self, hook: AlertHook) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.alert = Some(hook),
            None => tracing::warn!("alert hook ignored: runtime already shared"),
        }
        self
    }

    /// Resolves the entity mailbox, activating the entity if necessary.
    async fn route(&self, entity_id: &str) -> Mailbox<B::Message> {
        let mut shard = self.inner.shard_map(entity_id).lock().await;
        if let Some(tx) = shard.get(entity_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
            shard.remove(entity_id);
        }

        let (tx, rx) = mpsc::channel(self.inner.settings.mailbox_capacity);
        shard.insert(entity_id.to_string(), tx.clone());
        drop(shard);
        tokio::spawn(entity::run_entity(Arc::clone(&self.inner), entity_id.to_string(), rx));
        tx
    }

    /// Fire-and-forget send. Reroutes once if the mailbox closed underneath.
    pub async fn tell(&self, entity_id: &str, message: B::Message) {
        let mut envelope = Envelope::tell(message);
        for _ in 0..2 {
            let tx = self.route(entity_id).await;
            match tx.send(envelope).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => envelope = returned,
            }
        }
        tracing::error!(entity_type = B::entity_type(), %entity_id, "dropping message: mailbox closed twice");
    }

    /// At-least-once delivery: resends until the entity confirms the durable
    /// outcome or attempts are exhausted. Receivers absorb duplicates through
    /// idempotent decide rules. Takes a factory because redelivery needs a
    /// fresh message per attempt.
    pub async fn deliver(
        &self, entity_id: &str, make: impl Fn() -> B::Message,
    ) -> Result<(), DeliveryError> {
        let attempts = self.inner.settings.delivery_attempts.max(1);
        for attempt in 1..=attempts {
            let (mut envelope, confirmed) = Envelope::confirmable(make(), attempt);

            let mut sent = false;
            for _ in 0..2 {
                let tx = self.route(entity_id).await;
                match tx.send(envelope).await {
                    Ok(()) => {
                        sent = true;
                        break;
                    },
                    Err(mpsc::error::SendError(returned)) => envelope = returned,
                }
            }
            if !sent {
                return Err(DeliveryError::MailboxClosed);
            }

            match tokio::time::timeout(self.inner.settings.confirm_timeout, confirmed).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(_)) | Err(_) => {
                    tracing::debug!(
                        entity_type = B::entity_type(),
                        %entity_id,
                        attempt,
                        "delivery unconfirmed; retrying"
                    );
                },
            }
        }
        Err(DeliveryError::Unconfirmed { attempts })
    }

    /// Request-response with the default ask timeout.
    pub async fn ask<R>(
        &self, entity_id: &str, make: impl FnOnce(oneshot::Sender<R>) -> B::Message,
    ) -> Result<R, AskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let tx = self.route(entity_id).await;
        tx.send(Envelope::tell(make(reply_tx)))
            .await
            .map_err(|_| AskError::MailboxClosed)?;

        match tokio::time::timeout(self.inner.settings.ask_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AskError::NoResponse),
            Err(_) => Err(AskError::NoResponse),
        }
    }

    /// Replays the shard indexes and reactivates every remembered entity.
    pub async fn recover_remembered(&self) -> Result<usize, JournalError> {
        let mut remembered = HashSet::new();
        for shard in 0..self.inner.shards.len() {
            let index_id = self.inner.index_entity_id(shard);
            let mut stream = self.inner.index_journal.read(&index_id, 1, u64::MAX).await?;
            while let Some(event) = stream.try_next().await? {
                match event.payload {
                    ShardIndexEvent::Registered { entity_id } => {
                        remembered.insert(entity_id);
                    },
                    ShardIndexEvent::Passivated { entity_id } => {
                        remembered.remove(&entity_id);
                    },
                }
            }
        }

        let count = remembered.len();
        for entity_id in remembered {
            let _ = self.route(&entity_id).await;
        }
        Ok(count)
    }

    /// How many entities are currently live in memory.
    pub async fn active_entities(&self) -> usize {
        let mut count = 0;
        for shard in &self.inner.shards {
            let map = shard.lock().await;
            count += map.values().filter(|tx| !tx.is_closed()).count();
        }
        count
    }
}
