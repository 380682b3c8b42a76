use crate::model::account::protocol::{AccountEvent, AccountEventData};
use chrono::{DateTime, Duration, Utc};
use money2::Money;
use serde::{Deserialize, Serialize};

/// Policy knobs for the monthly maintenance fee, sourced from settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceFeePolicy {
    pub fee: Money,
    pub qualifying_deposit: Money,
    pub daily_balance_threshold: Money,
    pub lookback_days: i64,
}

/// The two fee-waiver criteria tracked across a billing cycle. The fee is
/// skipped iff either criterion holds at cycle start.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceFeeCriteria {
    /// A single deposit at or above the qualifying threshold was seen.
    pub qualifying_deposit_found: bool,
    /// The observed balance never dipped below the daily threshold.
    pub daily_balance_threshold_met: bool,
}

impl MaintenanceFeeCriteria {
    pub fn reset(balance: Money, policy: &MaintenanceFeePolicy) -> Self {
        Self {
            qualifying_deposit_found: false,
            daily_balance_threshold_met: policy.daily_balance_threshold <= balance,
        }
    }

    pub fn fee_waived(&self) -> bool {
        self.qualifying_deposit_found || self.daily_balance_threshold_met
    }

    /// Observes a post-apply balance and any deposit amount. One dip below the
    /// threshold clears the balance criterion for the rest of the cycle.
    pub fn observe(&mut self, balance: Money, deposit: Option<Money>, policy: &MaintenanceFeePolicy) {
        if let Some(amount) = deposit {
            if policy.qualifying_deposit <= amount {
                self.qualifying_deposit_found = true;
            }
        }
        if balance < policy.daily_balance_threshold {
            self.daily_balance_threshold_met = false;
        }
    }

    /// Pure fold over a lookback window of events, re-deriving the criteria a
    /// live account tracks incrementally. Short-circuits once the deposit
    /// criterion flips true, since no later event can unset it.
    pub fn fold_events<'a, I>(
        events: I, opening_balance: Money, as_of: DateTime<Utc>, policy: &MaintenanceFeePolicy,
    ) -> Self
    where
        I: IntoIterator<Item = &'a AccountEvent>,
    {
        let window_start = as_of - Duration::days(policy.lookback_days);
        let mut criteria = Self::reset(opening_balance, policy);
        let mut balance = opening_balance;

        for event in events {
            if event.base.timestamp < window_start {
                continue;
            }
            if criteria.qualifying_deposit_found {
                break;
            }
            let deposit = match &event.data {
                AccountEventData::Deposited { amount } => Some(*amount),
                _ => None,
            };
            if let Some(amount) = event.money_transaction() {
                match &event.data {
                    AccountEventData::Deposited { .. }
                    | AccountEventData::InternalTransferWithinOrgDeposited { .. }
                    | AccountEventData::InternalTransferBetweenOrgsDeposited { .. }
                    | AccountEventData::InternalAutomatedTransferDeposited { .. }
                    | AccountEventData::PlatformPaymentDeposited { .. }
                    | AccountEventData::InternalTransferWithinOrgRejected { .. }
                    | AccountEventData::InternalTransferBetweenOrgsRejected { .. }
                    | AccountEventData::InternalAutomatedTransferRejected { .. }
                    | AccountEventData::DomesticTransferRejected { .. } => balance += amount,
                    _ => balance -= amount,
                }
            }
            criteria.observe(balance, deposit, policy);
        }
        criteria
    }
}
