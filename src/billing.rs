use crate::actor::AccountRoute;
use crate::broadcast::{EngineBus, EngineSignal};
use crate::model::{
    AccountCommand, AccountCommandData, AccountEnvelope, BillingPeriod, InitiatorId,
};
use crate::services::AccountReadModelApi;
use chrono::{Duration as ChronoDuration, Utc};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    /// Token bucket: `count` commands per `period`, bursting to `burst`.
    pub burst: u32,
    pub count: u32,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub period: Duration,
    /// Accounts whose last cycle is younger than this are skipped.
    pub lookback_days: i64,
    /// Cron expression registered with the external scheduler at node start;
    /// the scheduler delivers `BillingCycleFanout` on this cadence.
    pub cron: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            burst: 5,
            count: 50,
            period: Duration::from_secs(1),
            lookback_days: 25,
            cron: "0 0 1 * *".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum BillingMessage {
    /// Delivered monthly by the external scheduler.
    BillingCycleFanout,
    BillingCycleFinished { accounts: usize },
}

/// Cluster-singleton billing fan-out: streams active account ids from the
/// read model and emits one throttled `StartBillingCycle` per account.
#[derive(Debug, Clone)]
pub struct BillingFanout {
    tx: mpsc::Sender<BillingMessage>,
}

impl BillingFanout {
    pub fn spawn(
        accounts: AccountRoute, read_model: Arc<dyn AccountReadModelApi>,
        settings: BillingSettings, bus: EngineBus,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run(accounts, read_model, settings, bus, tx.clone(), rx));
        Self { tx }
    }

    pub async fn start_cycle(&self) {
        if self.tx.send(BillingMessage::BillingCycleFanout).await.is_err() {
            tracing::error!("billing fan-out stopped; cycle request dropped");
        }
    }
}

async fn run(
    accounts: AccountRoute, read_model: Arc<dyn AccountReadModelApi>, settings: BillingSettings,
    bus: EngineBus, self_tx: mpsc::Sender<BillingMessage>, mut rx: mpsc::Receiver<BillingMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            BillingMessage::BillingCycleFanout => {
                let processed = fan_out(&accounts, read_model.as_ref(), &settings).await;
                let _ = self_tx.send(BillingMessage::BillingCycleFinished { accounts: processed }).await;
            },
            BillingMessage::BillingCycleFinished { accounts } => {
                tracing::info!(accounts, "billing cycle fan-out finished");
                bus.publish(EngineSignal::BillingCycleFinished { accounts });
            },
        }
    }
}

#[tracing::instrument(level = "info", skip(accounts, read_model, settings))]
async fn fan_out(
    accounts: &AccountRoute, read_model: &dyn AccountReadModelApi, settings: &BillingSettings,
) -> usize {
    let now = Utc::now();
    let period = BillingPeriod::from_date(now);
    let cutoff = now - ChronoDuration::days(settings.lookback_days);

    let targets = match read_model.active_account_ids(cutoff).await {
        Ok(targets) => targets,
        Err(err) => {
            tracing::error!(error = %err, "billing fan-out read model query failed");
            return 0;
        },
    };

    let count = NonZeroU32::new(settings.count.max(1)).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(settings.burst.max(1)).unwrap_or(NonZeroU32::MIN);
    let replenish = settings.period / count.get();
    let limiter = Quota::with_period(replenish)
        .map(|quota| RateLimiter::direct(quota.allow_burst(burst)));

    let mut processed = 0;
    for target in targets {
        if let Some(limiter) = &limiter {
            limiter.until_ready().await;
        }
        let command = AccountCommand::new(
            AccountEnvelope::new(target.account_id, target.org_id, InitiatorId::system()),
            AccountCommandData::StartBillingCycle { period, billing_date: now },
        );
        if let Err(err) = accounts.send_command(command).await {
            tracing::warn!(
                account_id = %target.account_id,
                error = %err,
                "billing cycle command delivery failed"
            );
            continue;
        }
        processed += 1;
    }
    processed
}
