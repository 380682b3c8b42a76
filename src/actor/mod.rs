use crate::services::{BillingStatementApi, EmailApi, SchedulerApi};
use std::sync::Arc;

pub mod account;
pub mod employee;

pub use account::{AccountBehavior, AccountMessage, AccountRoute, DeleteOutcome};
pub use employee::{EmployeeBehavior, EmployeeMessage, EmployeeRoute};

/// External collaborators shared by every behavior on a node.
#[derive(Clone)]
pub struct EngineServices {
    pub email: Arc<dyn EmailApi>,
    pub scheduler: Arc<dyn SchedulerApi>,
    pub statements: Arc<dyn BillingStatementApi>,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices").finish()
    }
}
