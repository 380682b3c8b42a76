use crate::actor::{AccountRoute, DeleteOutcome};
use crate::journal::{EventJournal, SequenceNumber};
use crate::model::{AccountEvent, AccountEventData, AccountId, OrgId};
use crate::services::SchedulerApi;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tag the account journal puts on `AccountClosed` events; startup
/// reconciliation re-registers closures a crash may have dropped.
pub const CLOSED_ACCOUNTS_TAG: &str = "account_closed";

const REGISTRY_ENTITY_ID: &str = "closure-registry";

#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureSettings {
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ClosureSettings {
    fn default() -> Self {
        Self { retry_interval: Duration::from_secs(5), max_attempts: 60 }
    }
}

/// Short-lived closure records, journaled so a restart resumes unfinished
/// finalizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureEvent {
    Registered { account_id: AccountId, org_id: OrgId },
    Completed { account_id: AccountId },
}

#[derive(Debug)]
enum ClosureMessage {
    Register { account_id: AccountId, org_id: OrgId },
    Finalized { account_id: AccountId },
}

/// Serializes account deletion after closure: deregisters scheduled
/// obligations, then drives the `Delete` intent until the drained entity
/// soft-deletes its journal and passivates.
#[derive(Debug, Clone)]
pub struct ClosureFinalizer {
    tx: mpsc::Sender<ClosureMessage>,
}

impl ClosureFinalizer {
    pub fn spawn(
        accounts: AccountRoute, scheduler: Arc<dyn SchedulerApi>,
        registry_journal: Arc<dyn EventJournal<Event = ClosureEvent>>,
        account_events: Arc<dyn EventJournal<Event = AccountEvent>>, settings: ClosureSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let worker = Worker {
            accounts,
            scheduler,
            registry_journal,
            account_events,
            settings,
            sequence: 0,
            self_tx: tx.clone(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    pub async fn register(&self, account_id: AccountId, org_id: OrgId) {
        if self.tx.send(ClosureMessage::Register { account_id, org_id }).await.is_err() {
            tracing::error!(%account_id, "closure finalizer stopped; registration dropped");
        }
    }
}

struct Worker {
    accounts: AccountRoute,
    scheduler: Arc<dyn SchedulerApi>,
    registry_journal: Arc<dyn EventJournal<Event = ClosureEvent>>,
    account_events: Arc<dyn EventJournal<Event = AccountEvent>>,
    settings: ClosureSettings,
    sequence: SequenceNumber,
    self_tx: mpsc::Sender<ClosureMessage>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<ClosureMessage>) {
        let unfinished = match self.recover().await {
            Ok(unfinished) => unfinished,
            Err(err) => {
                tracing::error!(error = %err, "closure registry replay failed");
                Vec::new()
            },
        };
        for (account_id, org_id) in unfinished {
            tracing::info!(%account_id, "resuming account closure after restart");
            self.finalize(account_id, org_id);
        }

        while let Some(message) = rx.recv().await {
            match message {
                ClosureMessage::Register { account_id, org_id } => {
                    if let Err(err) = self
                        .append(ClosureEvent::Registered { account_id, org_id })
                        .await
                    {
                        tracing::error!(%account_id, error = %err, "closure registration append failed");
                    }
                    self.finalize(account_id, org_id);
                },
                ClosureMessage::Finalized { account_id } => {
                    if let Err(err) = self.append(ClosureEvent::Completed { account_id }).await {
                        tracing::error!(%account_id, error = %err, "closure completion append failed");
                    }
                },
            }
        }
    }

    async fn append(&mut self, event: ClosureEvent) -> Result<(), crate::journal::JournalError> {
        self.sequence = self
            .registry_journal
            .append(REGISTRY_ENTITY_ID, self.sequence, vec![event])
            .await?;
        Ok(())
    }

    /// Replays the registry, then reconciles against the tagged account
    /// stream: closures whose `AccountClosed` event was journaled but never
    /// registered (crash between persist and side effect) are recovered here.
    async fn recover(&mut self) -> Result<Vec<(AccountId, OrgId)>, crate::journal::JournalError> {
        use futures::TryStreamExt;

        self.sequence = self.registry_journal.highest_sequence(REGISTRY_ENTITY_ID).await?;
        let mut stream = self.registry_journal.read(REGISTRY_ENTITY_ID, 1, u64::MAX).await?;
        let mut open: Vec<(AccountId, OrgId)> = Vec::new();
        let mut completed: HashSet<AccountId> = HashSet::new();
        while let Some(event) = stream.try_next().await? {
            match event.payload {
                ClosureEvent::Registered { account_id, org_id } => {
                    open.push((account_id, org_id));
                },
                ClosureEvent::Completed { account_id } => {
                    completed.insert(account_id);
                },
            }
        }
        let mut known: HashSet<AccountId> =
            open.iter().map(|(account_id, _)| *account_id).collect();
        known.extend(completed.iter().copied());

        for closed in self.account_events.current_events_by_tag(CLOSED_ACCOUNTS_TAG).await? {
            if let AccountEventData::AccountClosed { .. } = closed.payload.data {
                let account_id = closed.payload.base.entity_id;
                if !known.contains(&account_id) {
                    open.push((account_id, closed.payload.base.org_id));
                    known.insert(account_id);
                }
            }
        }

        open.retain(|(account_id, _)| !completed.contains(account_id));
        Ok(open)
    }

    fn finalize(&self, account_id: AccountId, _org_id: OrgId) {
        let accounts = self.accounts.clone();
        let scheduler = Arc::clone(&self.scheduler);
        let settings = self.settings.clone();
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            // deregister recurring obligations first so the scheduler cannot
            // reanimate the account mid-deletion
            let mut deregistered = false;
            for _ in 0..settings.max_attempts.max(1) {
                match scheduler.remove_account_obligations(account_id).await {
                    Ok(()) => {
                        deregistered = true;
                        break;
                    },
                    Err(err) => {
                        tracing::warn!(%account_id, error = %err, "obligation deregistration failed; retrying");
                        tokio::time::sleep(settings.retry_interval).await;
                    },
                }
            }
            if !deregistered {
                tracing::error!(%account_id, "giving up on obligation deregistration");
                return;
            }

            for attempt in 1..=settings.max_attempts.max(1) {
                match accounts.request_delete(account_id).await {
                    Ok(DeleteOutcome::Deleted) => {
                        tracing::info!(%account_id, "account journal deleted; entity passivated");
                        let _ = self_tx.send(ClosureMessage::Finalized { account_id }).await;
                        return;
                    },
                    Ok(DeleteOutcome::NotQuiescent) => {
                        tracing::debug!(%account_id, attempt, "in-flight transfers still draining");
                    },
                    Ok(DeleteOutcome::NotClosed) => {
                        tracing::warn!(%account_id, "delete refused: account is not closed");
                        let _ = self_tx.send(ClosureMessage::Finalized { account_id }).await;
                        return;
                    },
                    Ok(DeleteOutcome::Failed) => {
                        tracing::warn!(%account_id, attempt, "journal deletion failed; retrying");
                    },
                    Err(err) => {
                        tracing::warn!(%account_id, attempt, error = %err, "delete ask failed; retrying");
                    },
                }
                tokio::time::sleep(settings.retry_interval).await;
            }
            tracing::error!(%account_id, "account closure did not finish within the retry budget");
        });
    }
}
