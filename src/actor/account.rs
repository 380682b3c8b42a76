use super::EngineServices;
use crate::broadcast::{EngineBus, EngineSignal};
use crate::journal::JournalError;
use crate::model::account::{AccountPolicy, AGGREGATE_TYPE};
use crate::model::{
    Account, AccountCommand, AccountCommandData, AccountEnvelope, AccountError, AccountEvent,
    AccountEventData, AccountId, AccountSnapshot, AccountStatus, AutoTransferFrequency,
    EmployeeCommand, EmployeeCommandData, EmployeeEnvelope, FailedDomesticTransfer, InitiatorId,
    RecipientId,
};
use crate::runtime::registry::Registry;
use crate::runtime::{AskError, DeliveryError, EntityBehavior, EntityContext, EntityRuntime, EventApplier};
use crate::services::{BillingStatement, EmailMessage, ScheduledTransfer};
use crate::transfer::{CoordinatorSettings, DomesticTransferTxn, TransferCoordinator};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Mailbox protocol of the account entity.
#[derive(Debug)]
pub enum AccountMessage {
    StateChange(AccountCommand),
    Get(oneshot::Sender<Option<AccountSnapshot>>),
    Delete(oneshot::Sender<DeleteOutcome>),
    AutoTransferCompute(AutoTransferFrequency),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Journal soft-deleted; the entity passivates into ReadyForDelete.
    Deleted,
    /// In-flight transfers must drain first; retry later.
    NotQuiescent,
    NotClosed,
    Failed,
}

/// Addressed handle for the sharded account region. Holds no entity state;
/// components keep this instead of references to each other.
#[derive(Clone)]
pub struct AccountRoute {
    runtime: EntityRuntime<AccountBehavior>,
}

impl AccountRoute {
    pub fn new(runtime: EntityRuntime<AccountBehavior>) -> Self {
        Self { runtime }
    }

    /// Confirmable command submission: resolves once the resulting event is
    /// durably journaled (or the command was validly rejected).
    pub async fn send_command(&self, command: AccountCommand) -> Result<(), DeliveryError> {
        let entity_id = command.account_id().to_string();
        self.runtime
            .deliver(&entity_id, || AccountMessage::StateChange(command.clone()))
            .await
    }

    pub async fn tell_command(&self, command: AccountCommand) {
        let entity_id = command.account_id().to_string();
        self.runtime.tell(&entity_id, AccountMessage::StateChange(command)).await;
    }

    pub async fn get(&self, account_id: AccountId) -> Result<Option<AccountSnapshot>, AskError> {
        self.runtime.ask(&account_id.to_string(), AccountMessage::Get).await
    }

    pub async fn request_delete(&self, account_id: AccountId) -> Result<DeleteOutcome, AskError> {
        self.runtime.ask(&account_id.to_string(), AccountMessage::Delete).await
    }

    pub async fn compute_auto_transfers(
        &self, account_id: AccountId, frequency: AutoTransferFrequency,
    ) {
        self.runtime
            .tell(&account_id.to_string(), AccountMessage::AutoTransferCompute(frequency))
            .await;
    }

    pub async fn recover_remembered(&self) -> Result<usize, JournalError> {
        self.runtime.recover_remembered().await
    }

    pub async fn active_entities(&self) -> usize {
        self.runtime.active_entities().await
    }
}

impl std::fmt::Debug for AccountRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRoute").finish()
    }
}

/// The account aggregate actor: validates commands against the pure state
/// machine, persists through the journal, then fans out post-persist side
/// effects.
pub struct AccountBehavior {
    policy: Arc<AccountPolicy>,
    registry: Arc<Registry>,
    services: EngineServices,
    bus: EngineBus,
    coordinator_settings: CoordinatorSettings,
    coordinator: Option<TransferCoordinator>,
}

impl AccountBehavior {
    pub fn new(
        policy: Arc<AccountPolicy>, registry: Arc<Registry>, services: EngineServices,
        bus: EngineBus, coordinator_settings: CoordinatorSettings,
    ) -> Self {
        Self { policy, registry, services, bus, coordinator_settings, coordinator: None }
    }

    /// One coordinator per sender account, spawned on the first pending
    /// internal transfer and dropped with this behavior.
    fn coordinator(&mut self) -> Option<&TransferCoordinator> {
        if self.coordinator.is_none() {
            let Some(accounts) = self.registry.accounts() else {
                tracing::error!("account route not registered; cannot spawn transfer coordinator");
                return None;
            };
            self.coordinator =
                Some(TransferCoordinator::spawn(accounts, self.coordinator_settings.clone()));
        }
        self.coordinator.as_ref()
    }

    #[tracing::instrument(level = "debug", skip(self, ctx, command), fields(account_id = %command.account_id(), command = %command.name()))]
    async fn handle_command(
        &mut self, ctx: &mut EntityContext<Account, AccountEvent>, command: AccountCommand,
    ) {
        // captured before persist: the edit's apply clears these entries
        let retry_candidates = self.failed_transfers_for_edit(ctx.state(), &command);

        let event = match ctx.state().decide(&command, &self.policy) {
            Ok(event) => event,
            Err(err) => {
                self.handle_validation_error(ctx.state(), &command, err).await;
                return;
            },
        };

        if let Err(err) = ctx.persist_one(event.clone()).await {
            tracing::warn!(
                account_id = %command.account_id(),
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

        self.publish_event(ctx.state(), &event);
        self.dispatch_side_effects(ctx, &event, retry_candidates).await;
    }

    fn failed_transfers_for_edit(
        &self, account: &Account, command: &AccountCommand,
    ) -> Vec<FailedDomesticTransfer> {
        let AccountCommandData::EditDomesticRecipient { recipient } = &command.data else {
            return Vec::new();
        };
        let recipient_id = recipient.recipient_id();
        account
            .failed_domestic_transfers()
            .map(|failed| {
                failed
                    .values()
                    .filter(|transfer| transfer.recipient_id == recipient_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn publish_event(&self, account: &Account, event: &AccountEvent) {
        self.bus.publish(EngineSignal::AccountEvent {
            account_id: event.account_id(),
            event: event.clone(),
            snapshot: account.snapshot(),
        });
    }

    async fn dispatch_side_effects(
        &mut self, ctx: &mut EntityContext<Account, AccountEvent>, event: &AccountEvent,
        retry_candidates: Vec<FailedDomesticTransfer>,
    ) {
        use AccountEventData as E;
        match &event.data {
            E::Created { owner_name, email, .. } => {
                self.send_email(EmailMessage::AccountOpen {
                    email: email.clone(),
                    owner_name: owner_name.clone(),
                });
            },

            E::Debited { purchase, .. } => {
                // finalize the card transaction on the originating employee
                let approve = EmployeeCommand::new(
                    EmployeeEnvelope::new(
                        purchase.employee_id,
                        event.base.org_id,
                        event.base.initiated_by,
                    )
                    .with_correlation(event.base.correlation_id),
                    EmployeeCommandData::ApproveDebit,
                );
                self.send_employee_command(approve);
            },

            E::DomesticRecipientEdited { recipient } => {
                for failed in retry_candidates {
                    tracing::info!(
                        account_id = %event.account_id(),
                        correlation_id = %failed.correlation_id,
                        "re-issuing domestic transfer after recipient edit"
                    );
                    let retry = AccountCommand::new(
                        AccountEnvelope::new(
                            event.base.entity_id,
                            event.base.org_id,
                            event.base.initiated_by,
                        ),
                        AccountCommandData::DomesticTransfer {
                            amount: failed.amount,
                            recipient_id: recipient.recipient_id(),
                        },
                    );
                    self.send_account_command(retry);
                }
            },

            E::InternalTransferWithinOrgPending { .. }
            | E::InternalTransferBetweenOrgsPending { .. }
            | E::InternalAutomatedTransferPending { .. } => {
                let sender_name = ctx
                    .state()
                    .snapshot()
                    .map(|snapshot| snapshot.owner_name)
                    .unwrap_or_default();
                if let Some(coordinator) = self.coordinator() {
                    coordinator.submit(event.clone(), sender_name).await;
                }
            },

            E::InternalTransferBetweenOrgsScheduled { amount, recipient_id, scheduled_date } => {
                let scheduler = Arc::clone(&self.services.scheduler);
                let transfer = ScheduledTransfer {
                    account_id: event.base.entity_id,
                    org_id: event.base.org_id,
                    kind: crate::model::TransferKind::InternalBetweenOrgs,
                    amount: *amount,
                    recipient_id: recipient_id.clone(),
                    scheduled_date: *scheduled_date,
                };
                tokio::spawn(async move {
                    if let Err(err) =
                        scheduler.schedule_internal_transfer_between_orgs(transfer).await
                    {
                        tracing::error!(error = %err, "failed to enqueue scheduled internal transfer");
                    }
                });
            },

            E::DomesticTransferScheduled { amount, recipient_id, scheduled_date } => {
                let scheduler = Arc::clone(&self.services.scheduler);
                let transfer = ScheduledTransfer {
                    account_id: event.base.entity_id,
                    org_id: event.base.org_id,
                    kind: crate::model::TransferKind::Domestic,
                    amount: *amount,
                    recipient_id: recipient_id.clone(),
                    scheduled_date: *scheduled_date,
                };
                tokio::spawn(async move {
                    if let Err(err) = scheduler.schedule_domestic_transfer(transfer).await {
                        tracing::error!(error = %err, "failed to enqueue scheduled domestic transfer");
                    }
                });
            },

            E::DomesticTransferPending { .. } => {
                match (self.registry.domestic_worker(), DomesticTransferTxn::from_pending(event)) {
                    (Some(worker), Some(txn)) => worker.submit(txn).await,
                    (None, _) => {
                        tracing::error!("domestic transfer worker not registered; transfer stalled")
                    },
                    (_, None) => {},
                }
            },

            E::InternalTransferBetweenOrgsDeposited { amount, sender_name, .. } => {
                if let Some(email) = ctx.state().owner_email() {
                    self.send_email(EmailMessage::TransferDeposited {
                        email: email.to_string(),
                        amount: *amount,
                        sender_name: sender_name.clone(),
                    });
                }
            },

            E::AccountClosed { .. } => {
                if let Some(email) = ctx.state().owner_email() {
                    let owner_name = ctx
                        .state()
                        .snapshot()
                        .map(|snapshot| snapshot.owner_name)
                        .unwrap_or_default();
                    self.send_email(EmailMessage::AccountClose {
                        email: email.to_string(),
                        owner_name,
                    });
                }
                match self.registry.closure() {
                    Some(closure) => {
                        closure.register(event.base.entity_id, event.base.org_id).await
                    },
                    None => tracing::error!("closure finalizer not registered"),
                }
            },

            E::BillingCycleStarted { period, criteria } => {
                self.handle_billing_cycle(ctx, event, *period, *criteria).await;
            },

            E::PlatformPaymentPaid { amount, payee_account_id, payee_org_id, memo } => {
                let deposit = AccountCommand::new(
                    AccountEnvelope::new(*payee_account_id, *payee_org_id, event.base.initiated_by)
                        .with_correlation(event.base.correlation_id),
                    AccountCommandData::DepositPlatformPayment {
                        amount: *amount,
                        payer_account_id: event.base.entity_id,
                        payer_org_id: event.base.org_id,
                        memo: memo.clone(),
                    },
                );
                self.send_account_command(deposit);
            },

            _ => {},
        }

        if event.money_transaction().is_some() && !event.is_automated_transfer() {
            let has_per_transaction_rules = ctx
                .state()
                .auto_transfer_rules()
                .iter()
                .any(|config| config.frequency == AutoTransferFrequency::PerTransaction);
            if has_per_transaction_rules {
                if let Some(accounts) = self.registry.accounts() {
                    let account_id = event.base.entity_id;
                    tokio::spawn(async move {
                        accounts
                            .compute_auto_transfers(
                                account_id,
                                AutoTransferFrequency::PerTransaction,
                            )
                            .await;
                    });
                }
            }
        }
    }

    async fn handle_billing_cycle(
        &mut self, ctx: &mut EntityContext<Account, AccountEvent>, event: &AccountEvent,
        period: crate::model::BillingPeriod, criteria: crate::model::MaintenanceFeeCriteria,
    ) {
        let Some(snapshot) = ctx.state().snapshot() else { return };

        let statement = BillingStatement {
            account_id: snapshot.account_id,
            org_id: snapshot.org_id,
            period,
            balance: snapshot.balance,
            generated_at: Utc::now(),
        };
        if let Err(err) = self.services.statements.append(statement).await {
            tracing::error!(account_id = %snapshot.account_id, error = %err, "billing statement append failed");
        }

        let fee_data = if criteria.fee_waived() {
            AccountCommandData::SkipMaintenanceFee { criteria }
        } else {
            AccountCommandData::MaintenanceFee { amount: self.policy.maintenance_fee.fee }
        };
        let fee_command = AccountCommand::new(
            AccountEnvelope::new(event.base.entity_id, event.base.org_id, event.base.initiated_by),
            fee_data,
        );
        self.send_account_command(fee_command);

        if let Some(email) = ctx.state().owner_email() {
            self.send_email(EmailMessage::BillingStatement {
                email: email.to_string(),
                account_id: snapshot.account_id,
                period,
            });
        }
    }

    async fn handle_auto_transfer_compute(
        &mut self, ctx: &mut EntityContext<Account, AccountEvent>,
        frequency: AutoTransferFrequency,
    ) {
        let computed = ctx.state().computed_auto_transfers(frequency);
        if computed.is_empty() {
            return;
        }
        let Some(snapshot) = ctx.state().snapshot() else { return };
        let owner = snapshot.account_id;

        let (outbound, inbound): (Vec<_>, Vec<_>) =
            computed.into_iter().partition(|transfer| transfer.is_outbound_from(owner));

        // transfers-in: one command per managing-partner sender
        for transfer in inbound {
            let command = AccountCommand::new(
                AccountEnvelope::new(transfer.sender, transfer.sender_org_id, InitiatorId::system()),
                AccountCommandData::InternalAutoTransfer {
                    amount: transfer.amount,
                    recipient_id: RecipientId::internal(owner),
                    recipient_account_id: owner,
                    rule_id: transfer.rule_id,
                },
            );
            self.send_account_command(command);
        }

        if outbound.is_empty() {
            return;
        }

        // transfers-out validate and persist as one atomic batch; interleaving
        // them with unrelated debits could reject rules that would have passed
        let commands: Vec<_> = outbound
            .into_iter()
            .map(|transfer| {
                AccountCommand::new(
                    AccountEnvelope::new(owner, snapshot.org_id, InitiatorId::system()),
                    AccountCommandData::InternalAutoTransfer {
                        amount: transfer.amount,
                        recipient_id: RecipientId::internal(transfer.recipient.account_id),
                        recipient_account_id: transfer.recipient.account_id,
                        rule_id: transfer.rule_id,
                    },
                )
            })
            .collect();

        let events = match ctx.state().decide_many(&commands, &self.policy) {
            Ok(events) => events,
            Err((offending, err)) => {
                tracing::warn!(
                    account_id = %owner,
                    batch = commands.len(),
                    "auto-transfer batch rejected"
                );
                self.handle_validation_error(ctx.state(), &offending, err).await;
                return;
            },
        };

        if let Err(err) = ctx.persist(events.clone()).await {
            tracing::warn!(account_id = %owner, error = %err, "auto-transfer batch persist failed");
            self.bus.publish(EngineSignal::PersistFailed {
                entity_type: AGGREGATE_TYPE,
                entity_id: ctx.entity_id().to_string(),
                error: err.to_string(),
            });
            return;
        }

        for event in &events {
            self.publish_event(ctx.state(), event);
            self.dispatch_side_effects(ctx, event, Vec::new()).await;
        }
    }

    async fn handle_delete(
        &self, ctx: &mut EntityContext<Account, AccountEvent>,
        reply: oneshot::Sender<DeleteOutcome>,
    ) {
        let outcome = match ctx.state().status() {
            Some(AccountStatus::Closed) | Some(AccountStatus::ReadyForDelete) => {
                if ctx.state().has_in_flight_transfers() {
                    DeleteOutcome::NotQuiescent
                } else {
                    match ctx.soft_delete_and_stop().await {
                        Ok(()) => {
                            ctx.state_mut().mark_ready_for_delete();
                            DeleteOutcome::Deleted
                        },
                        Err(err) => {
                            tracing::error!(
                                entity_id = %ctx.entity_id(),
                                error = %err,
                                "journal soft-delete failed"
                            );
                            DeleteOutcome::Failed
                        },
                    }
                }
            },
            _ => DeleteOutcome::NotClosed,
        };
        let _ = reply.send(outcome);
    }

    async fn handle_validation_error(
        &self, account: &Account, command: &AccountCommand, err: AccountError,
    ) {
        if err.is_noop() {
            tracing::debug!(
                account_id = %command.account_id(),
                command = %command.name(),
                error = %err,
                "idempotent command rejection"
            );
            return;
        }

        tracing::warn!(
            account_id = %command.account_id(),
            command = %command.name(),
            error = %err,
            "command validation failed"
        );
        self.bus.publish(EngineSignal::ValidationRejected {
            account_id: command.account_id(),
            org_id: command.base.org_id,
            command: command.name(),
            error: err.to_string(),
        });

        // card purchases get a compensating decline so the employee side can
        // settle the pending transaction
        if let (
            AccountError::InsufficientBalance { balance, .. },
            AccountCommandData::Debit { purchase, .. },
        ) = (&err, &command.data)
        {
            let owner_name =
                account.snapshot().map(|snapshot| snapshot.owner_name).unwrap_or_default();
            let decline = EmployeeCommand::new(
                EmployeeEnvelope::new(
                    purchase.employee_id,
                    command.base.org_id,
                    command.base.initiated_by,
                )
                .with_correlation(command.base.correlation_id),
                EmployeeCommandData::DeclineDebit {
                    reason: format!("insufficient account funds: {balance} held by {owner_name}"),
                },
            );
            self.send_employee_command(decline);
        }
    }

    /// All cross-entity and self sends are spawned: awaiting another entity's
    /// confirmation from inside this one invites mailbox deadlock.
    fn send_account_command(&self, command: AccountCommand) {
        let Some(accounts) = self.registry.accounts() else {
            tracing::error!("account route not registered; command dropped");
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = accounts.send_command(command.clone()).await {
                tracing::error!(
                    command = %command.name(),
                    account_id = %command.account_id(),
                    error = %err,
                    "account command delivery failed"
                );
            }
        });
    }

    fn send_employee_command(&self, command: EmployeeCommand) {
        let Some(employees) = self.registry.employees() else {
            tracing::error!("employee route not registered; command dropped");
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = employees.send_command(command.clone()).await {
                tracing::error!(
                    command = %command.name(),
                    error = %err,
                    "employee command delivery failed"
                );
            }
        });
    }

    fn send_email(&self, message: EmailMessage) {
        let email = Arc::clone(&self.services.email);
        tokio::spawn(async move {
            if let Err(err) = email.send(message).await {
                tracing::error!(error = %err, "email notification failed");
            }
        });
    }
}

#[async_trait]
impl EntityBehavior for AccountBehavior {
    type State = Account;
    type Event = AccountEvent;
    type Message = AccountMessage;

    fn entity_type() -> &'static str {
        AGGREGATE_TYPE
    }

    fn initial_state(&self) -> Account {
        Account::default()
    }

    fn applier(&self) -> EventApplier<Account, AccountEvent> {
        let policy = Arc::clone(&self.policy);
        Arc::new(move |account: &mut Account, event: &AccountEvent| account.apply(event, &policy))
    }

    async fn on_message(
        &mut self, ctx: &mut EntityContext<Account, AccountEvent>, message: AccountMessage,
    ) {
        match message {
            AccountMessage::StateChange(command) => self.handle_command(ctx, command).await,
            AccountMessage::Get(reply) => {
                let _ = reply.send(ctx.state().snapshot());
            },
            AccountMessage::Delete(reply) => self.handle_delete(ctx, reply).await,
            AccountMessage::AutoTransferCompute(frequency) => {
                self.handle_auto_transfer_compute(ctx, frequency).await;
            },
        }
    }
}
