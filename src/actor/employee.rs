use crate::broadcast::{EngineBus, EngineSignal};
use crate::model::employee::AGGREGATE_TYPE;
use crate::model::{
    AccountCommand, AccountCommandData, AccountEnvelope, CardPurchaseInfo, Employee,
    EmployeeCommand, EmployeeError, EmployeeEvent, EmployeeEventData, EmployeeId, EmployeeStatus,
};
use crate::runtime::registry::Registry;
use crate::runtime::{AskError, DeliveryError, EntityBehavior, EntityContext, EntityRuntime, EventApplier};
use crate::services::{EmailApi, EmailMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum EmployeeMessage {
    StateChange(EmployeeCommand),
    Get(oneshot::Sender<Option<EmployeeStatus>>),
}

#[derive(Clone)]
pub struct EmployeeRoute {
    runtime: EntityRuntime<EmployeeBehavior>,
}

impl EmployeeRoute {
    pub fn new(runtime: EntityRuntime<EmployeeBehavior>) -> Self {
        Self { runtime }
    }

    pub async fn send_command(&self, command: EmployeeCommand) -> Result<(), DeliveryError> {
        let entity_id = command.base.entity_id.to_string();
        self.runtime
            .deliver(&entity_id, || EmployeeMessage::StateChange(command.clone()))
            .await
    }

    pub async fn tell_command(&self, command: EmployeeCommand) {
        let entity_id = command.base.entity_id.to_string();
        self.runtime.tell(&entity_id, EmployeeMessage::StateChange(command)).await;
    }

    pub async fn status(&self, employee_id: EmployeeId) -> Result<Option<EmployeeStatus>, AskError> {
        self.runtime.ask(&employee_id.to_string(), EmployeeMessage::Get).await
    }

    pub async fn recover_remembered(&self) -> Result<usize, crate::journal::JournalError> {
        self.runtime.recover_remembered().await
    }
}

impl std::fmt::Debug for EmployeeRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmployeeRoute").finish()
    }
}

/// Employee aggregate actor. Card purchases flow: `PurchaseIntent` persists
/// `DebitRequested`, which fires a `Debit` command at the backing account;
/// the account answers with `ApproveDebit` or a compensating `DeclineDebit`.
pub struct EmployeeBehavior {
    registry: Arc<Registry>,
    email: Arc<dyn EmailApi>,
    bus: EngineBus,
}

impl EmployeeBehavior {
    pub fn new(registry: Arc<Registry>, email: Arc<dyn EmailApi>, bus: EngineBus) -> Self {
        Self { registry, email, bus }
    }

    #[tracing::instrument(level = "debug", skip(self, ctx, command), fields(employee_id = %command.base.entity_id, command = %command.name()))]
    async fn handle_command(
        &mut self, ctx: &mut EntityContext<Employee, EmployeeEvent>, command: EmployeeCommand,
    ) {
        let event = match ctx.state().decide(&command) {
            Ok(event) => event,
            Err(err) => {
                self.handle_validation_error(&command, err);
                return;
            },
        };

        if let Err(err) = ctx.persist_one(event.clone()).await {
            tracing::warn!(
                employee_id = %command.base.entity_id,
                error = %err,
                "event persist failed; envelope left unconfirmed"
            );
            self.bus.publish(EngineSignal::PersistFailed {
                entity_type: AGGREGATE_TYPE,
                entity_id: ctx.entity_id().to_string(),
                error: err.to_string(),
            });
            return;
        }

        self.bus.publish(EngineSignal::EmployeeEvent {
            employee_id: event.base.entity_id,
            event: event.clone(),
        });
        self.dispatch_side_effects(ctx, &event);
    }

    fn dispatch_side_effects(
        &self, ctx: &EntityContext<Employee, EmployeeEvent>, event: &EmployeeEvent,
    ) {
        use EmployeeEventData as E;
        match &event.data {
            E::EmployeeCreated { email, invite_token, .. } => {
                self.send_email(EmailMessage::EmployeeInvite {
                    email: email.clone(),
                    token: *invite_token,
                });
            },

            E::DebitRequested { purchase } => {
                let debit = AccountCommand::new(
                    AccountEnvelope::new(
                        purchase.account_id,
                        event.base.org_id,
                        event.base.initiated_by,
                    )
                    .with_correlation(event.base.correlation_id),
                    AccountCommandData::Debit {
                        amount: purchase.amount,
                        purchase: CardPurchaseInfo {
                            employee_id: event.base.entity_id,
                            card_id: purchase.card_id,
                            merchant: purchase.merchant.clone(),
                        },
                    },
                );
                let Some(accounts) = self.registry.accounts() else {
                    tracing::error!("account route not registered; debit dropped");
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = accounts.send_command(debit).await {
                        tracing::error!(error = %err, "card debit delivery failed");
                    }
                });
            },

            E::DebitDeclined { reason, .. } => {
                if let Some(email) = ctx.state().email() {
                    self.send_email(EmailMessage::PurchaseDeclined {
                        email: email.to_string(),
                        reason: reason.clone(),
                    });
                }
            },

            _ => {},
        }
    }

    fn handle_validation_error(&self, command: &EmployeeCommand, err: EmployeeError) {
        if err.is_noop() {
            tracing::debug!(
                employee_id = %command.base.entity_id,
                command = %command.name(),
                error = %err,
                "idempotent command rejection"
            );
        } else {
            tracing::warn!(
                employee_id = %command.base.entity_id,
                command = %command.name(),
                error = %err,
                "command validation failed"
            );
        }
    }

    fn send_email(&self, message: EmailMessage) {
        let email = Arc::clone(&self.email);
        tokio::spawn(async move {
            if let Err(err) = email.send(message).await {
                tracing::error!(error = %err, "email notification failed");
            }
        });
    }
}

#[async_trait]
impl EntityBehavior for EmployeeBehavior {
    type State = Employee;
    type Event = EmployeeEvent;
    type Message = EmployeeMessage;

    fn entity_type() -> &'static str {
        AGGREGATE_TYPE
    }

    fn initial_state(&self) -> Employee {
        Employee::default()
    }

    fn applier(&self) -> EventApplier<Employee, EmployeeEvent> {
        Arc::new(|employee: &mut Employee, event: &EmployeeEvent| employee.apply(event))
    }

    async fn on_message(
        &mut self, ctx: &mut EntityContext<Employee, EmployeeEvent>, message: EmployeeMessage,
    ) {
        match message {
            EmployeeMessage::StateChange(command) => self.handle_command(ctx, command).await,
            EmployeeMessage::Get(reply) => {
                let _ = reply.send(ctx.state().status());
            },
        }
    }
}
