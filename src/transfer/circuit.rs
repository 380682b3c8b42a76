use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;

/// Observable breaker states, broadcast so front-end health widgets can show
/// gateway availability.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

/// Pure breaker state machine. The owner drives the cooldown timer and
/// broadcasts the transitions this returns.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: BreakerState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self { settings, state: BreakerState::Closed, consecutive_failures: 0 }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn cooldown(&self) -> Duration {
        self.settings.cooldown
    }

    /// Closed admits traffic freely; HalfOpen admits the single probe the
    /// caller gates; Open admits nothing.
    pub fn admits(&self) -> bool {
        self.state != BreakerState::Open
    }

    pub fn on_success(&mut self) -> Option<BreakerState> {
        self.consecutive_failures = 0;
        match self.state {
            BreakerState::Closed => None,
            BreakerState::HalfOpen | BreakerState::Open => {
                self.state = BreakerState::Closed;
                Some(BreakerState::Closed)
            },
        }
    }

    pub fn on_failure(&mut self) -> Option<BreakerState> {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                Some(BreakerState::Open)
            },
            BreakerState::Open => None,
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.settings.failure_threshold <= self.consecutive_failures {
                    self.state = BreakerState::Open;
                    Some(BreakerState::Open)
                } else {
                    None
                }
            },
        }
    }

    /// Cooldown elapsed: gate traffic down to one probe.
    pub fn on_cooldown_elapsed(&mut self) -> Option<BreakerState> {
        match self.state {
            BreakerState::Open => {
                self.state = BreakerState::HalfOpen;
                Some(BreakerState::HalfOpen)
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let mut breaker = breaker(3);
        assert_eq!(breaker.on_failure(), None);
        assert_eq!(breaker.on_failure(), None);
        assert_eq!(breaker.on_failure(), Some(BreakerState::Open));
        assert!(!breaker.admits());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut breaker = breaker(2);
        assert_eq!(breaker.on_failure(), None);
        assert_eq!(breaker.on_success(), None);
        assert_eq!(breaker.on_failure(), None);
        assert_eq!(breaker.on_failure(), Some(BreakerState::Open));
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let mut breaker = breaker(1);
        assert_eq!(breaker.on_failure(), Some(BreakerState::Open));
        assert_eq!(breaker.on_cooldown_elapsed(), Some(BreakerState::HalfOpen));
        assert!(breaker.admits());
        assert_eq!(breaker.on_success(), Some(BreakerState::Closed));
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let mut breaker = breaker(1);
        breaker.on_failure();
        breaker.on_cooldown_elapsed();
        assert_eq!(breaker.on_failure(), Some(BreakerState::Open));
    }

    #[test]
    fn test_cooldown_elapsed_is_ignored_outside_open() {
        let mut breaker = breaker(1);
        assert_eq!(breaker.on_cooldown_elapsed(), None);
    }
}
