use crate::actor::{AccountRoute, EmployeeRoute};
use crate::billing::BillingFanout;
use crate::closure::ClosureFinalizer;
use crate::transfer::DomesticTransferWorker;
use once_cell::sync::OnceCell;

/// Service registry: the explicit mapping from component tag to endpoint
/// handle, initialized once at node start. Components hold `Arc<Registry>`
/// and entity ids; addressed handles are resolved at use time, which breaks
/// the reference cycles between sender accounts, recipient accounts and the
/// coordinators.
#[derive(Default)]
pub struct Registry {
    accounts: OnceCell<AccountRoute>,
    employees: OnceCell<EmployeeRoute>,
    domestic_worker: OnceCell<DomesticTransferWorker>,
    billing: OnceCell<BillingFanout>,
    closure: OnceCell<ClosureFinalizer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_accounts(&self, route: AccountRoute) {
        if self.accounts.set(route).is_err() {
            tracing::warn!("account route registered twice; keeping the first");
        }
    }

    pub fn accounts(&self) -> Option<AccountRoute> {
        self.accounts.get().cloned()
    }

    pub fn set_employees(&self, route: EmployeeRoute) {
        if self.employees.set(route).is_err() {
            tracing::warn!("employee route registered twice; keeping the first");
        }
    }

    pub fn employees(&self) -> Option<EmployeeRoute> {
        self.employees.get().cloned()
    }

    pub fn set_domestic_worker(&self, worker: DomesticTransferWorker) {
        if self.domestic_worker.set(worker).is_err() {
            tracing::warn!("domestic transfer worker registered twice; keeping the first");
        }
    }

    pub fn domestic_worker(&self) -> Option<DomesticTransferWorker> {
        self.domestic_worker.get().cloned()
    }

    pub fn set_billing(&self, billing: BillingFanout) {
        if self.billing.set(billing).is_err() {
            tracing::warn!("billing fan-out registered twice; keeping the first");
        }
    }

    pub fn billing(&self) -> Option<BillingFanout> {
        self.billing.get().cloned()
    }

    pub fn set_closure(&self, closure: ClosureFinalizer) {
        if self.closure.set(closure).is_err() {
            tracing::warn!("closure finalizer registered twice; keeping the first");
        }
    }

    pub fn closure(&self) -> Option<ClosureFinalizer> {
        self.closure.get().cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("accounts", &self.accounts.get().is_some())
            .field("employees", &self.employees.get().is_some())
            .field("domestic_worker", &self.domestic_worker.get().is_some())
            .field("billing", &self.billing.get().is_some())
            .field("closure", &self.closure.get().is_some())
            .finish()
    }
}
