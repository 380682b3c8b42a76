use crate::model::{AccountEvent, AccountId, AccountSnapshot, EmployeeEvent, EmployeeId, OrgId};
use crate::transfer::BreakerState;
use tokio::sync::broadcast;

/// Everything the engine publishes to the outside: committed events paired
/// with the new state, validation rejections keyed by account, persistence
/// alerts and circuit-breaker transitions. Consumers are read-model writers
/// and the real-time broadcast service.
#[derive(Debug, Clone)]
pub enum EngineSignal {
    AccountEvent {
        account_id: AccountId,
        event: AccountEvent,
        snapshot: Option<AccountSnapshot>,
    },
    EmployeeEvent {
        employee_id: EmployeeId,
        event: EmployeeEvent,
    },
    ValidationRejected {
        account_id: AccountId,
        org_id: OrgId,
        command: String,
        error: String,
    },
    PersistFailed {
        entity_type: &'static str,
        entity_id: String,
        error: String,
    },
    ReplayFailed {
        entity_type: &'static str,
        entity_id: String,
        error: String,
    },
    CircuitBreaker {
        service: &'static str,
        state: BreakerState,
    },
    BillingCycleFinished {
        accounts: usize,
    },
}

#[derive(Clone)]
pub struct EngineBus {
    tx: broadcast::Sender<EngineSignal>,
}

impl EngineBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineSignal> {
        self.tx.subscribe()
    }

    /// Lossy by design: a bus with no subscribers drops signals silently.
    pub fn publish(&self, signal: EngineSignal) {
        let _ = self.tx.send(signal);
    }
}

impl std::fmt::Debug for EngineBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBus").field("receivers", &self.tx.receiver_count()).finish()
    }
}
