use crate::actor::{
    AccountBehavior, AccountRoute, EmployeeBehavior, EmployeeRoute, EngineServices,
};
use crate::billing::BillingFanout;
use crate::broadcast::{EngineBus, EngineSignal};
use crate::closure::{ClosureFinalizer, CLOSED_ACCOUNTS_TAG};
use crate::journal::{
    EventJournal, JournalError, MemoryJournal, MemorySnapshotStore, SnapshotStore,
};
use crate::model::{Account, AccountEvent, AccountEventData, Employee, EmployeeEvent};
use crate::runtime::registry::Registry;
use crate::runtime::{AlertHook, EntityRuntime};
use crate::services::AccountReadModelApi;
use crate::settings::Settings;
use crate::transfer::{DomesticTransferWorker, TransferGatewayApi};
use std::sync::Arc;

/// One engine node: sharded entity runtimes for both aggregate types, the
/// cluster singletons, and the registry wiring them together.
pub struct Engine {
    pub bus: EngineBus,
    pub registry: Arc<Registry>,
    pub accounts: AccountRoute,
    pub employees: EmployeeRoute,
    pub domestic_worker: DomesticTransferWorker,
    pub billing: BillingFanout,
    pub closure: ClosureFinalizer,
    /// Journal handles stay reachable for replay verification and tooling.
    pub account_journal: Arc<MemoryJournal<AccountEvent>>,
    pub employee_journal: Arc<MemoryJournal<EmployeeEvent>>,
}

impl Engine {
    pub fn build(
        settings: &Settings, services: EngineServices, gateway: Arc<dyn TransferGatewayApi>,
        read_model: Arc<dyn AccountReadModelApi>,
    ) -> Self {
        let bus = EngineBus::new(settings.bus_capacity);
        let registry = Arc::new(Registry::new());

        let account_journal = Arc::new(MemoryJournal::with_tagger(|event: &AccountEvent| {
            match event.data {
                AccountEventData::AccountClosed { .. } => vec![CLOSED_ACCOUNTS_TAG.to_string()],
                _ => Vec::new(),
            }
        }));
        let account_events: Arc<dyn EventJournal<Event = AccountEvent>> =
            Arc::clone(&account_journal) as _;
        let account_snapshots: Arc<dyn SnapshotStore<State = Account>> =
            Arc::new(MemorySnapshotStore::new());
        let account_index: Arc<dyn EventJournal<Event = crate::runtime::ShardIndexEvent>> =
            Arc::new(MemoryJournal::new());

        let account_factory = {
            let policy = Arc::new(settings.policy.clone());
            let registry = Arc::clone(&registry);
            let services = services.clone();
            let bus = bus.clone();
            let coordinator = settings.coordinator.clone();
            move |_entity_id: &str| {
                AccountBehavior::new(
                    Arc::clone(&policy),
                    Arc::clone(&registry),
                    services.clone(),
                    bus.clone(),
                    coordinator.clone(),
                )
            }
        };
        let account_runtime = EntityRuntime::new(
            Arc::clone(&account_events),
            account_snapshots,
            account_index,
            settings.runtime.clone(),
            account_factory,
        )
        .with_alert(replay_alert_hook(&bus));
        let accounts = AccountRoute::new(account_runtime);
        registry.set_accounts(accounts.clone());

        let employee_journal = Arc::new(MemoryJournal::<EmployeeEvent>::new());
        let employee_events: Arc<dyn EventJournal<Event = EmployeeEvent>> =
            Arc::clone(&employee_journal) as _;
        let employee_snapshots: Arc<dyn SnapshotStore<State = Employee>> =
            Arc::new(MemorySnapshotStore::new());
        let employee_index: Arc<dyn EventJournal<Event = crate::runtime::ShardIndexEvent>> =
            Arc::new(MemoryJournal::new());

        let employee_factory = {
            let registry = Arc::clone(&registry);
            let email = Arc::clone(&services.email);
            let bus = bus.clone();
            move |_entity_id: &str| {
                EmployeeBehavior::new(Arc::clone(&registry), Arc::clone(&email), bus.clone())
            }
        };
        let employee_runtime = EntityRuntime::new(
            employee_events,
            employee_snapshots,
            employee_index,
            settings.runtime.clone(),
            employee_factory,
        )
        .with_alert(replay_alert_hook(&bus));
        let employees = EmployeeRoute::new(employee_runtime);
        registry.set_employees(employees.clone());

        let domestic_worker = DomesticTransferWorker::spawn(
            accounts.clone(),
            gateway,
            settings.domestic.clone(),
            bus.clone(),
        );
        registry.set_domestic_worker(domestic_worker.clone());

        let closure_registry: Arc<dyn EventJournal<Event = crate::closure::ClosureEvent>> =
            Arc::new(MemoryJournal::new());
        let closure = ClosureFinalizer::spawn(
            accounts.clone(),
            Arc::clone(&services.scheduler),
            closure_registry,
            account_events,
            settings.closure.clone(),
        );
        registry.set_closure(closure.clone());

        let billing = BillingFanout::spawn(
            accounts.clone(),
            read_model,
            settings.billing.clone(),
            bus.clone(),
        );
        registry.set_billing(billing.clone());

        // the external scheduler delivers BillingCycleFanout on this cadence
        {
            let scheduler = Arc::clone(&services.scheduler);
            let cron = settings.billing.cron.clone();
            tokio::spawn(async move {
                if let Err(err) = scheduler.schedule_billing_fanout(&cron).await {
                    tracing::warn!(error = %err, "billing fan-out cron registration failed");
                }
            });
        }

        Self {
            bus,
            registry,
            accounts,
            employees,
            domestic_worker,
            billing,
            closure,
            account_journal,
            employee_journal,
        }
    }

    /// Reactivates every entity the shard indexes remember from before the
    /// last shutdown.
    pub async fn recover_remembered(&self) -> Result<usize, JournalError> {
        let accounts = self.accounts.recover_remembered().await?;
        let employees = self.employees.recover_remembered().await?;
        Ok(accounts + employees)
    }
}

fn replay_alert_hook(bus: &EngineBus) -> AlertHook {
    let bus = bus.clone();
    Box::new(move |alert| {
        bus.publish(EngineSignal::ReplayFailed {
            entity_type: alert.entity_type,
            entity_id: alert.entity_id,
            error: alert.message,
        });
    })
}
