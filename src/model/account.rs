use crate::model::transfer::{
    FailedDomesticTransfer, InFlightTransfer, RecipientId, RecipientRegistrationStatus,
    TransferKind, TransferRecipient, TransferRejectionReason,
};
use crate::model::{zero_money, AccountId, BillingPeriod, CorrelationId, OrgId};
use chrono::NaiveDate;
use money2::{Currency, Money};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use strum_macros::Display;

pub mod auto_transfer;
pub mod billing;
mod errors;
mod protocol;

pub use auto_transfer::{
    compute_auto_transfers, AutoTransferConfig, AutoTransferFrequency, AutoTransferRule,
    ComputedTransfer, DistributionDestination, InternalTarget,
};
pub use billing::{MaintenanceFeeCriteria, MaintenanceFeePolicy};
pub use errors::AccountError;
pub use protocol::{
    AccountCommand, AccountCommandData, AccountEnvelope, AccountEvent, AccountEventData,
    CardPurchaseInfo,
};

pub const AGGREGATE_TYPE: &str = "account";

/// Business-policy knobs threaded through `decide`/`apply` so both stay pure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPolicy {
    /// How far below zero a debit may take the balance. Must be configured in
    /// the deployment currency; a mismatch falls back to a zero floor.
    pub overdraft_allowance: Money,
    pub maintenance_fee: MaintenanceFeePolicy,
}

impl Default for AccountPolicy {
    fn default() -> Self {
        Self {
            overdraft_allowance: Money::new(0, 2, Currency::Usd),
            maintenance_fee: MaintenanceFeePolicy {
                fee: Money::new(5_00, 2, Currency::Usd),
                qualifying_deposit: Money::new(250_00, 2, Currency::Usd),
                daily_balance_threshold: Money::new(1500_00, 2, Currency::Usd),
                lookback_days: 27,
            },
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Closed,
    ReadyForDelete,
}

/// Read-only view served on `Get` asks; what the transfer coordinator and the
/// closure finalizer see of a foreign account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub org_id: OrgId,
    pub status: AccountStatus,
    pub owner_name: String,
    pub balance: Money,
    pub currency: Currency,
    pub registered_sender_ids: Vec<AccountId>,
    pub in_flight_transfers: usize,
    pub last_billing_cycle: Option<BillingPeriod>,
}

impl AccountSnapshot {
    pub fn has_registered_sender(&self, sender: AccountId) -> bool {
        self.registered_sender_ids.contains(&sender)
    }

    pub fn is_quiescent(&self) -> bool {
        self.in_flight_transfers == 0
    }
}

/// The account aggregate. All mutation flows through `apply`; `decide` only
/// validates and emits.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    state: AccountState,
}

impl Account {
    pub fn decide(
        &self, command: &AccountCommand, policy: &AccountPolicy,
    ) -> Result<AccountEvent, AccountError> {
        self.state.decide(command, policy)
    }

    /// Threads a shadow state through the batch so every command validates
    /// against the effects of its predecessors. The first failure rejects the
    /// whole batch with the offending command.
    pub fn decide_many(
        &self, commands: &[AccountCommand], policy: &AccountPolicy,
    ) -> Result<Vec<AccountEvent>, (AccountCommand, AccountError)> {
        let mut shadow = self.clone();
        let mut events = Vec::with_capacity(commands.len());
        for command in commands {
            match shadow.decide(command, policy) {
                Ok(event) => {
                    shadow.apply(&event, policy);
                    events.push(event);
                },
                Err(err) => return Err((command.clone(), err)),
            }
        }
        Ok(events)
    }

    pub fn apply(&mut self, event: &AccountEvent, policy: &AccountPolicy) {
        if let Some(next) = self.state.apply(event, policy) {
            self.state = next;
        }
    }

    pub fn status(&self) -> Option<AccountStatus> {
        match &self.state {
            AccountState::Quiescent(_) => None,
            AccountState::Active(_) => Some(AccountStatus::Active),
            AccountState::Closed(_) => Some(AccountStatus::Closed),
            AccountState::ReadyForDelete(_) => Some(AccountStatus::ReadyForDelete),
        }
    }

    pub fn snapshot(&self) -> Option<AccountSnapshot> {
        match &self.state {
            AccountState::Quiescent(_) => None,
            AccountState::Active(account) => Some(AccountSnapshot {
                account_id: account.account_id,
                org_id: account.org_id,
                status: AccountStatus::Active,
                owner_name: account.owner_name.clone(),
                balance: account.balance,
                currency: account.currency,
                registered_sender_ids: account.registered_senders.keys().copied().collect(),
                in_flight_transfers: account.in_flight.len(),
                last_billing_cycle: account.last_billing_cycle,
            }),
            AccountState::Closed(account) => Some(AccountSnapshot {
                account_id: account.account_id,
                org_id: account.org_id,
                status: AccountStatus::Closed,
                owner_name: account.owner_name.clone(),
                balance: account.balance,
                currency: account.currency,
                registered_sender_ids: Vec::new(),
                in_flight_transfers: account.in_flight.len(),
                last_billing_cycle: None,
            }),
            AccountState::ReadyForDelete(account_id) => Some(AccountSnapshot {
                account_id: *account_id,
                org_id: OrgId::from_uuid(uuid::Uuid::nil()),
                status: AccountStatus::ReadyForDelete,
                owner_name: String::new(),
                balance: *crate::model::ZERO_MONEY,
                currency: Currency::Usd,
                registered_sender_ids: Vec::new(),
                in_flight_transfers: 0,
                last_billing_cycle: None,
            }),
        }
    }

    pub fn balance(&self) -> Option<Money> {
        match &self.state {
            AccountState::Active(account) => Some(account.balance),
            AccountState::Closed(account) => Some(account.balance),
            _ => None,
        }
    }

    pub fn owner_email(&self) -> Option<&str> {
        match &self.state {
            AccountState::Active(account) => Some(account.email.as_str()),
            AccountState::Closed(account) => Some(account.email.as_str()),
            _ => None,
        }
    }

    pub fn auto_transfer_rules(&self) -> &[AutoTransferConfig] {
        match &self.state {
            AccountState::Active(account) => &account.auto_transfer_rules,
            _ => &[],
        }
    }

    /// Rule-driven transfers due at the given frequency for the current state.
    pub fn computed_auto_transfers(&self, frequency: AutoTransferFrequency) -> Vec<ComputedTransfer> {
        match &self.state {
            AccountState::Active(account) => compute_auto_transfers(
                &account.auto_transfer_rules,
                frequency,
                account.account_id,
                account.org_id,
                &account.owner_name,
                account.balance,
                zero_money(account.currency),
            ),
            _ => Vec::new(),
        }
    }

    pub fn failed_domestic_transfers(&self) -> Option<&HashMap<CorrelationId, FailedDomesticTransfer>> {
        match &self.state {
            AccountState::Active(account) => Some(&account.failed_domestic),
            _ => None,
        }
    }

    pub fn maintenance_fee_criteria(&self) -> Option<MaintenanceFeeCriteria> {
        match &self.state {
            AccountState::Active(account) => Some(account.criteria),
            _ => None,
        }
    }

    pub fn has_in_flight_transfers(&self) -> bool {
        match &self.state {
            AccountState::Active(account) => !account.in_flight.is_empty(),
            AccountState::Closed(account) => !account.in_flight.is_empty(),
            _ => false,
        }
    }

    pub fn domestic_recipient(&self, recipient_id: &RecipientId) -> Option<&TransferRecipient> {
        match &self.state {
            AccountState::Active(account) => account.recipients.get(recipient_id),
            _ => None,
        }
    }

    /// Journal deletion confirmed: the aggregate is drained and its history
    /// soft-deleted, so the status flip is not itself an event.
    pub fn mark_ready_for_delete(&mut self) {
        let account_id = match &self.state {
            AccountState::Closed(account) => account.account_id,
            AccountState::Active(account) => account.account_id,
            AccountState::ReadyForDelete(id) => *id,
            AccountState::Quiescent(_) => return,
        };
        self.state = AccountState::ReadyForDelete(account_id);
    }
}

trait AggregateState {
    type State;

    fn decide(
        &self, command: &AccountCommand, policy: &AccountPolicy,
    ) -> Result<AccountEvent, AccountError>;

    fn apply(&self, event: &AccountEvent, policy: &AccountPolicy) -> Option<Self::State>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum AccountState {
    Quiescent(QuiescentAccount),
    Active(ActiveAccount),
    Closed(ClosedAccount),
    ReadyForDelete(AccountId),
}

impl Default for AccountState {
    fn default() -> Self {
        Self::Quiescent(QuiescentAccount)
    }
}

impl AggregateState for AccountState {
    type State = Self;

    fn decide(
        &self, command: &AccountCommand, policy: &AccountPolicy,
    ) -> Result<AccountEvent, AccountError> {
        match self {
            Self::Quiescent(state) => state.decide(command, policy),
            Self::Active(state) => state.decide(command, policy),
            Self::Closed(state) => state.decide(command, policy),
            Self::ReadyForDelete(_) => Err(AccountError::AccountNotActive),
        }
    }

    fn apply(&self, event: &AccountEvent, policy: &AccountPolicy) -> Option<Self::State> {
        match self {
            Self::Quiescent(state) => state.apply(event, policy),
            Self::Active(state) => state.apply(event, policy),
            Self::Closed(state) => state.apply(event, policy),
            Self::ReadyForDelete(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct QuiescentAccount;

impl AggregateState for QuiescentAccount {
    type State = AccountState;

    fn decide(
        &self, command: &AccountCommand, _policy: &AccountPolicy,
    ) -> Result<AccountEvent, AccountError> {
        match &command.data {
            AccountCommandData::CreateAccount { owner_name, email, currency } => {
                Ok(AccountEvent::from_command(command, AccountEventData::Created {
                    owner_name: owner_name.clone(),
                    email: email.clone(),
                    currency: *currency,
                }))
            },
            _ => Err(AccountError::AccountNotActive),
        }
    }

    fn apply(&self, event: &AccountEvent, policy: &AccountPolicy) -> Option<Self::State> {
        match &event.data {
            AccountEventData::Created { owner_name, email, currency } => {
                let balance = zero_money(*currency);
                Some(AccountState::Active(ActiveAccount {
                    account_id: event.base.entity_id,
                    org_id: event.base.org_id,
                    owner_name: owner_name.clone(),
                    email: email.clone(),
                    currency: *currency,
                    balance,
                    daily_debit_limit: None,
                    daily_debit_accrued: balance,
                    last_debit_date: None,
                    card_locked: false,
                    recipients: HashMap::new(),
                    registered_senders: HashMap::new(),
                    in_flight: HashMap::new(),
                    failed_domestic: HashMap::new(),
                    deposit_history: HashSet::new(),
                    criteria: MaintenanceFeeCriteria::reset(balance, &policy.maintenance_fee),
                    auto_transfer_rules: Vec::new(),
                    last_billing_cycle: None,
                }))
            },
            _ => {
                tracing::warn!(event = %event.event_type(), "unrecognized event for unopened account -- ignored");
                None
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RegisteredSender {
    name: String,
    org_id: OrgId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ActiveAccount {
    account_id: AccountId,
    org_id: OrgId,
    owner_name: String,
    email: String,
    currency: Currency,
    balance: Money,
    daily_debit_limit: Option<Money>,
    daily_debit_accrued: Money,
    last_debit_date: Option<NaiveDate>,
    card_locked: bool,
    recipients: HashMap<RecipientId, TransferRecipient>,
    registered_senders: HashMap<AccountId, RegisteredSender>,
    in_flight: HashMap<CorrelationId, InFlightTransfer>,
    failed_domestic: HashMap<CorrelationId, FailedDomesticTransfer>,
    /// Correlation ids of inbound transfer deposits already applied; absorbs
    /// at-least-once redelivery without double-crediting.
    deposit_history: HashSet<CorrelationId>,
    criteria: MaintenanceFeeCriteria,
    auto_transfer_rules: Vec<AutoTransferConfig>,
    last_billing_cycle: Option<BillingPeriod>,
}

impl ActiveAccount {
    fn zero(&self) -> Money {
        zero_money(self.currency)
    }

    fn overdraft_floor(&self, policy: &AccountPolicy) -> Money {
        if policy.overdraft_allowance.currency == self.currency {
            self.zero() - policy.overdraft_allowance
        } else {
            self.zero()
        }
    }

    fn check_funds_available(
        &self, requested: Money, policy: &AccountPolicy,
    ) -> Result<Money, AccountError> {
        let remaining = self.balance - requested;
        if remaining < self.overdraft_floor(policy) {
            Err(AccountError::InsufficientBalance { balance: self.balance, requested })
        } else {
            Ok(remaining)
        }
    }

    fn accrued_on(&self, date: NaiveDate) -> Money {
        if self.last_debit_date == Some(date) {
            self.daily_debit_accrued
        } else {
            self.zero()
        }
    }

    fn check_daily_debit_limit(
        &self, amount: Money, date: NaiveDate,
    ) -> Result<(), AccountError> {
        if let Some(limit) = self.daily_debit_limit {
            let accrued = self.accrued_on(date);
            if limit < accrued + amount {
                return Err(AccountError::ExceededDailyDebit { limit, accrued });
            }
        }
        Ok(())
    }

    fn check_deposit_not_replayed(
        &self, correlation_id: CorrelationId,
    ) -> Result<(), AccountError> {
        if self.deposit_history.contains(&correlation_id) {
            Err(AccountError::TransferAlreadyProgressedToApprovedOrRejected)
        } else {
            Ok(())
        }
    }

    fn confirmed_recipient(
        &self, recipient_id: &RecipientId,
    ) -> Result<&TransferRecipient, AccountError> {
        let recipient = self
            .recipients
            .get(recipient_id)
            .ok_or(AccountError::RecipientNotRegistered)?;
        if recipient.status() != RecipientRegistrationStatus::Confirmed {
            return Err(AccountError::RecipientDeactivated);
        }
        Ok(recipient)
    }

    fn in_flight_internal(
        &self, correlation_id: CorrelationId,
    ) -> Result<&InFlightTransfer, AccountError> {
        let transfer = self
            .in_flight
            .get(&correlation_id)
            .ok_or(AccountError::TransferAlreadyProgressedToApprovedOrRejected)?;
        match transfer.kind {
            TransferKind::Domestic => Err(AccountError::validation(
                "correlation_id",
                "domestic transfer cannot resolve through the internal workflow",
            )),
            _ => Ok(transfer),
        }
    }

    fn in_flight_domestic(
        &self, correlation_id: CorrelationId,
    ) -> Result<&InFlightTransfer, AccountError> {
        let transfer = self
            .in_flight
            .get(&correlation_id)
            .ok_or(AccountError::TransferAlreadyProgressedToApprovedOrRejected)?;
        match transfer.kind {
            TransferKind::Domestic => Ok(transfer),
            _ => Err(AccountError::validation(
                "correlation_id",
                "internal transfer cannot resolve through the domestic workflow",
            )),
        }
    }

    fn decide_outbound_transfer(
        &self, command: &AccountCommand, amount: Money, recipient_id: &RecipientId,
        kind: TransferKind, policy: &AccountPolicy,
    ) -> Result<AccountEvent, AccountError> {
        if amount <= self.zero() {
            return Err(AccountError::validation("amount", "transfer amount must be positive"));
        }
        let recipient = self.confirmed_recipient(recipient_id)?;
        self.check_funds_available(amount, policy)?;

        let data = match (kind, recipient) {
            (
                TransferKind::InternalWithinOrg,
                TransferRecipient::InternalWithinOrg { account_id, .. },
            ) => AccountEventData::InternalTransferWithinOrgPending {
                amount,
                recipient_id: recipient_id.clone(),
                recipient_account_id: *account_id,
            },
            (
                TransferKind::InternalBetweenOrgs,
                TransferRecipient::InternalBetweenOrgs { account_id, org_id, .. },
            ) => AccountEventData::InternalTransferBetweenOrgsPending {
                amount,
                recipient_id: recipient_id.clone(),
                recipient_account_id: *account_id,
                recipient_org_id: *org_id,
            },
            (TransferKind::Domestic, TransferRecipient::Domestic { recipient, .. }) => {
                AccountEventData::DomesticTransferPending { amount, recipient: recipient.clone() }
            },
            _ => {
                return Err(AccountError::validation(
                    "recipient_id",
                    "registered recipient does not match the transfer kind",
                ))
            },
        };
        Ok(AccountEvent::from_command(command, data))
    }
}

impl AggregateState for ActiveAccount {
    type State = AccountState;

    fn decide(
        &self, command: &AccountCommand, policy: &AccountPolicy,
    ) -> Result<AccountEvent, AccountError> {
        use AccountCommandData as C;
        match &command.data {
            C::CreateAccount { .. } => Err(AccountError::AccountNotReadyToActivate),

            C::DepositCash { amount } => {
                if *amount <= self.zero() {
                    return Err(AccountError::DepositTooSmall);
                }
                Ok(AccountEvent::from_command(command, AccountEventData::Deposited {
                    amount: *amount,
                }))
            },

            C::Debit { amount, purchase } => {
                if self.card_locked {
                    return Err(AccountError::AccountCardLocked);
                }
                if *amount <= self.zero() {
                    return Err(AccountError::DebitAmountNotPositive);
                }
                self.check_funds_available(*amount, policy)?;
                self.check_daily_debit_limit(*amount, command.base.timestamp.date_naive())?;
                Ok(AccountEvent::from_command(command, AccountEventData::Debited {
                    amount: *amount,
                    purchase: purchase.clone(),
                }))
            },

            C::MaintenanceFee { amount } => Ok(AccountEvent::from_command(
                command,
                AccountEventData::MaintenanceFeeDebited { amount: *amount },
            )),

            C::SkipMaintenanceFee { criteria } => Ok(AccountEvent::from_command(
                command,
                AccountEventData::MaintenanceFeeSkipped { criteria: *criteria },
            )),

            C::UpdateDailyDebitLimit { limit } => {
                if *limit < self.zero() {
                    return Err(AccountError::validation("limit", "limit must not be negative"));
                }
                Ok(AccountEvent::from_command(command, AccountEventData::DailyDebitLimitUpdated {
                    limit: *limit,
                }))
            },

            C::LockCard => Ok(AccountEvent::from_command(command, AccountEventData::CardLocked)),
            C::UnlockCard => {
                Ok(AccountEvent::from_command(command, AccountEventData::CardUnlocked))
            },

            C::RegisterInternalRecipient { recipient } => {
                match recipient {
                    TransferRecipient::Domestic { .. } => {
                        return Err(AccountError::validation(
                            "recipient",
                            "domestic recipients register through the domestic workflow",
                        ))
                    },
                    TransferRecipient::InternalWithinOrg { account_id, .. }
                    | TransferRecipient::InternalBetweenOrgs { account_id, .. } => {
                        if *account_id == self.account_id {
                            return Err(AccountError::validation(
                                "recipient",
                                "cannot register the account itself as a recipient",
                            ));
                        }
                    },
                }
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::InternalRecipientRegistered { recipient: recipient.clone() },
                ))
            },

            C::RegisterInternalSender { sender_id, sender_org_id, sender_name } => {
                if self.registered_senders.contains_key(sender_id) {
                    return Err(AccountError::TransferProgressNoChange);
                }
                Ok(AccountEvent::from_command(command, AccountEventData::InternalSenderRegistered {
                    sender_id: *sender_id,
                    sender_org_id: *sender_org_id,
                    sender_name: sender_name.clone(),
                }))
            },

            C::RegisterDomesticRecipient { recipient } => {
                if recipient.routing_number.len() != 9
                    || recipient.routing_number.chars().any(|c| !c.is_ascii_digit())
                {
                    return Err(AccountError::validation(
                        "routing_number",
                        "routing number must be 9 digits",
                    ));
                }
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::DomesticRecipientRegistered { recipient: recipient.clone() },
                ))
            },

            C::EditDomesticRecipient { recipient } => {
                if !self.recipients.contains_key(&recipient.recipient_id()) {
                    return Err(AccountError::RecipientNotRegistered);
                }
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::DomesticRecipientEdited { recipient: recipient.clone() },
                ))
            },

            C::InternalTransferWithinOrg { amount, recipient_id } => self.decide_outbound_transfer(
                command,
                *amount,
                recipient_id,
                TransferKind::InternalWithinOrg,
                policy,
            ),

            C::InternalTransferBetweenOrgs { amount, recipient_id } => self
                .decide_outbound_transfer(
                    command,
                    *amount,
                    recipient_id,
                    TransferKind::InternalBetweenOrgs,
                    policy,
                ),

            C::ScheduleInternalTransferBetweenOrgs { amount, recipient_id, scheduled_date } => {
                if *scheduled_date <= command.base.timestamp {
                    return Err(AccountError::DateNotDefault);
                }
                self.confirmed_recipient(recipient_id)?;
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::InternalTransferBetweenOrgsScheduled {
                        amount: *amount,
                        recipient_id: recipient_id.clone(),
                        scheduled_date: *scheduled_date,
                    },
                ))
            },

            C::ScheduleDomesticTransfer { amount, recipient_id, scheduled_date } => {
                if *scheduled_date <= command.base.timestamp {
                    return Err(AccountError::DateNotDefault);
                }
                self.confirmed_recipient(recipient_id)?;
                Ok(AccountEvent::from_command(command, AccountEventData::DomesticTransferScheduled {
                    amount: *amount,
                    recipient_id: recipient_id.clone(),
                    scheduled_date: *scheduled_date,
                }))
            },

            C::DomesticTransfer { amount, recipient_id } => self.decide_outbound_transfer(
                command,
                *amount,
                recipient_id,
                TransferKind::Domestic,
                policy,
            ),

            C::ApproveInternalTransfer => {
                let transfer = self.in_flight_internal(command.base.correlation_id)?;
                let data = match transfer.kind {
                    TransferKind::InternalWithinOrg => {
                        AccountEventData::InternalTransferWithinOrgApproved {
                            amount: transfer.amount,
                            recipient_id: transfer.recipient_id.clone(),
                        }
                    },
                    TransferKind::InternalBetweenOrgs => {
                        AccountEventData::InternalTransferBetweenOrgsApproved {
                            amount: transfer.amount,
                            recipient_id: transfer.recipient_id.clone(),
                        }
                    },
                    TransferKind::Automated => AccountEventData::InternalAutomatedTransferApproved {
                        amount: transfer.amount,
                        recipient_id: transfer.recipient_id.clone(),
                        rule_id: transfer
                            .rule_id()
                            .ok_or_else(|| AccountError::validation("rule_id", "missing rule id"))?,
                    },
                    TransferKind::Domestic => unreachable!("filtered by in_flight_internal"),
                };
                Ok(AccountEvent::from_command(command, data))
            },

            C::RejectInternalTransfer { reason } => {
                let transfer = self.in_flight_internal(command.base.correlation_id)?;
                let data = match transfer.kind {
                    TransferKind::InternalWithinOrg => {
                        AccountEventData::InternalTransferWithinOrgRejected {
                            amount: transfer.amount,
                            recipient_id: transfer.recipient_id.clone(),
                            reason: reason.clone(),
                        }
                    },
                    TransferKind::InternalBetweenOrgs => {
                        AccountEventData::InternalTransferBetweenOrgsRejected {
                            amount: transfer.amount,
                            recipient_id: transfer.recipient_id.clone(),
                            reason: reason.clone(),
                        }
                    },
                    TransferKind::Automated => AccountEventData::InternalAutomatedTransferRejected {
                        amount: transfer.amount,
                        recipient_id: transfer.recipient_id.clone(),
                        reason: reason.clone(),
                        rule_id: transfer
                            .rule_id()
                            .ok_or_else(|| AccountError::validation("rule_id", "missing rule id"))?,
                    },
                    TransferKind::Domestic => unreachable!("filtered by in_flight_internal"),
                };
                Ok(AccountEvent::from_command(command, data))
            },

            C::DepositTransferWithinOrg { amount, sender_id, sender_name } => {
                self.check_deposit_not_replayed(command.base.correlation_id)?;
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::InternalTransferWithinOrgDeposited {
                        amount: *amount,
                        sender_id: *sender_id,
                        sender_name: sender_name.clone(),
                    },
                ))
            },

            C::DepositTransferBetweenOrgs { amount, sender_id, sender_org_id, sender_name } => {
                self.check_deposit_not_replayed(command.base.correlation_id)?;
                if !self.registered_senders.contains_key(sender_id) {
                    return Err(AccountError::SenderRegistrationRequired);
                }
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::InternalTransferBetweenOrgsDeposited {
                        amount: *amount,
                        sender_id: *sender_id,
                        sender_org_id: *sender_org_id,
                        sender_name: sender_name.clone(),
                    },
                ))
            },

            C::UpdateDomesticTransferProgress { progress } => {
                let transfer = self.in_flight_domestic(command.base.correlation_id)?;
                if progress.is_terminal() {
                    return Err(AccountError::validation(
                        "progress",
                        "terminal progress resolves through approve or reject",
                    ));
                }
                if transfer.progress == Some(*progress) {
                    return Err(AccountError::TransferProgressNoChange);
                }
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::DomesticTransferProgressUpdated { progress: *progress },
                ))
            },

            C::ApproveDomesticTransfer => {
                let transfer = self.in_flight_domestic(command.base.correlation_id)?;
                Ok(AccountEvent::from_command(command, AccountEventData::DomesticTransferApproved {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                }))
            },

            C::RejectDomesticTransfer { reason } => {
                let transfer = self.in_flight_domestic(command.base.correlation_id)?;
                Ok(AccountEvent::from_command(command, AccountEventData::DomesticTransferRejected {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                    reason: reason.clone(),
                }))
            },

            C::InternalAutoTransfer { amount, recipient_id, recipient_account_id, rule_id } => {
                if *amount <= self.zero() {
                    return Err(AccountError::validation("amount", "transfer amount must be positive"));
                }
                self.check_funds_available(*amount, policy)?;
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::InternalAutomatedTransferPending {
                        amount: *amount,
                        recipient_id: recipient_id.clone(),
                        recipient_account_id: *recipient_account_id,
                        rule_id: *rule_id,
                    },
                ))
            },

            C::DepositAutomatedTransfer { amount, sender_id, sender_name, rule_id } => {
                self.check_deposit_not_replayed(command.base.correlation_id)?;
                Ok(AccountEvent::from_command(
                    command,
                    AccountEventData::InternalAutomatedTransferDeposited {
                        amount: *amount,
                        sender_id: *sender_id,
                        sender_name: sender_name.clone(),
                        rule_id: *rule_id,
                    },
                ))
            },

            C::ConfigureAutoTransferRule { config } => {
                config
                    .validate(self.zero())
                    .map_err(|reason| AccountError::validation("rule", reason))?;
                Ok(AccountEvent::from_command(command, AccountEventData::AutoTransferRuleConfigured {
                    config: config.clone(),
                }))
            },

            C::DeleteAutoTransferRule { rule_id } => {
                if !self.auto_transfer_rules.iter().any(|c| c.id == *rule_id) {
                    return Err(AccountError::validation("rule_id", "rule is not configured"));
                }
                Ok(AccountEvent::from_command(command, AccountEventData::AutoTransferRuleDeleted {
                    rule_id: *rule_id,
                }))
            },

            C::PayPlatformPayment { amount, payee_account_id, payee_org_id, memo } => {
                if *amount <= self.zero() {
                    return Err(AccountError::validation("amount", "payment amount must be positive"));
                }
                self.check_funds_available(*amount, policy)?;
                Ok(AccountEvent::from_command(command, AccountEventData::PlatformPaymentPaid {
                    amount: *amount,
                    payee_account_id: *payee_account_id,
                    payee_org_id: *payee_org_id,
                    memo: memo.clone(),
                }))
            },

            C::DepositPlatformPayment { amount, payer_account_id, payer_org_id, memo } => {
                self.check_deposit_not_replayed(command.base.correlation_id)?;
                Ok(AccountEvent::from_command(command, AccountEventData::PlatformPaymentDeposited {
                    amount: *amount,
                    payer_account_id: *payer_account_id,
                    payer_org_id: *payer_org_id,
                    memo: memo.clone(),
                }))
            },

            C::StartBillingCycle { period, billing_date } => {
                if *billing_date == chrono::DateTime::<chrono::Utc>::default() {
                    return Err(AccountError::DateNotDefault);
                }
                if self.last_billing_cycle == Some(*period) {
                    return Err(AccountError::validation(
                        "billing_period",
                        "billing cycle already started for this period",
                    ));
                }
                Ok(AccountEvent::from_command(command, AccountEventData::BillingCycleStarted {
                    period: *period,
                    criteria: self.criteria,
                }))
            },

            C::CloseAccount { reference } => {
                Ok(AccountEvent::from_command(command, AccountEventData::AccountClosed {
                    reference: reference.clone(),
                }))
            },
        }
    }

    fn apply(&self, event: &AccountEvent, policy: &AccountPolicy) -> Option<Self::State> {
        use AccountEventData as E;
        let mut updated = self.clone();
        let fee_policy = &policy.maintenance_fee;
        match &event.data {
            E::Created { .. } => {
                tracing::warn!(event = %event.event_type(), "unrecognized event for active account -- ignored");
                return None;
            },

            E::Deposited { amount } => {
                updated.balance += *amount;
                updated.criteria.observe(updated.balance, Some(*amount), fee_policy);
            },

            E::Debited { amount, .. } => {
                updated.balance -= *amount;
                let date = event.base.timestamp.date_naive();
                updated.daily_debit_accrued = self.accrued_on(date) + *amount;
                updated.last_debit_date = Some(date);
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::MaintenanceFeeDebited { amount } => {
                updated.balance -= *amount;
                updated.criteria = MaintenanceFeeCriteria::reset(updated.balance, fee_policy);
            },

            E::MaintenanceFeeSkipped { .. } => {
                updated.criteria = MaintenanceFeeCriteria::reset(updated.balance, fee_policy);
            },

            E::DailyDebitLimitUpdated { limit } => updated.daily_debit_limit = Some(*limit),
            E::CardLocked => updated.card_locked = true,
            E::CardUnlocked => updated.card_locked = false,

            E::InternalRecipientRegistered { recipient } => {
                updated.recipients.insert(recipient.recipient_id(), recipient.clone());
            },

            E::InternalSenderRegistered { sender_id, sender_org_id, sender_name } => {
                updated.registered_senders.insert(*sender_id, RegisteredSender {
                    name: sender_name.clone(),
                    org_id: *sender_org_id,
                });
            },

            E::DomesticRecipientRegistered { recipient } => {
                updated.recipients.insert(
                    recipient.recipient_id(),
                    TransferRecipient::Domestic {
                        recipient: recipient.clone(),
                        status: RecipientRegistrationStatus::Confirmed,
                    },
                );
            },

            E::DomesticRecipientEdited { recipient } => {
                let recipient_id = recipient.recipient_id();
                updated.recipients.insert(
                    recipient_id.clone(),
                    TransferRecipient::Domestic {
                        recipient: recipient.clone(),
                        status: RecipientRegistrationStatus::Confirmed,
                    },
                );
                // retries for these are re-issued by the edit side effect
                updated.failed_domestic.retain(|_, failed| failed.recipient_id != recipient_id);
            },

            E::InternalTransferWithinOrgPending { amount, recipient_id, .. } => {
                updated.balance -= *amount;
                updated.in_flight.insert(
                    event.base.correlation_id,
                    InFlightTransfer {
                        correlation_id: event.base.correlation_id,
                        kind: TransferKind::InternalWithinOrg,
                        recipient_id: recipient_id.clone(),
                        amount: *amount,
                        initiated_at: event.base.timestamp,
                        progress: None,
                        rule_id: None,
                    },
                );
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::InternalTransferBetweenOrgsPending { amount, recipient_id, .. } => {
                updated.balance -= *amount;
                updated.in_flight.insert(
                    event.base.correlation_id,
                    InFlightTransfer {
                        correlation_id: event.base.correlation_id,
                        kind: TransferKind::InternalBetweenOrgs,
                        recipient_id: recipient_id.clone(),
                        amount: *amount,
                        initiated_at: event.base.timestamp,
                        progress: None,
                        rule_id: None,
                    },
                );
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::InternalAutomatedTransferPending { amount, recipient_id, rule_id, .. } => {
                updated.balance -= *amount;
                updated.in_flight.insert(
                    event.base.correlation_id,
                    InFlightTransfer {
                        correlation_id: event.base.correlation_id,
                        kind: TransferKind::Automated,
                        recipient_id: recipient_id.clone(),
                        amount: *amount,
                        initiated_at: event.base.timestamp,
                        progress: None,
                        rule_id: Some(*rule_id),
                    },
                );
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::DomesticTransferPending { amount, recipient } => {
                updated.balance -= *amount;
                updated.in_flight.insert(
                    event.base.correlation_id,
                    InFlightTransfer {
                        correlation_id: event.base.correlation_id,
                        kind: TransferKind::Domestic,
                        recipient_id: recipient.recipient_id(),
                        amount: *amount,
                        initiated_at: event.base.timestamp,
                        progress: Some(crate::model::DomesticTransferProgress::Outgoing),
                        rule_id: None,
                    },
                );
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::InternalTransferWithinOrgApproved { .. }
            | E::InternalTransferBetweenOrgsApproved { .. }
            | E::InternalAutomatedTransferApproved { .. }
            | E::DomesticTransferApproved { .. } => {
                updated.in_flight.remove(&event.base.correlation_id);
            },

            E::InternalTransferWithinOrgRejected { amount, .. }
            | E::InternalAutomatedTransferRejected { amount, .. } => {
                updated.balance += *amount;
                updated.in_flight.remove(&event.base.correlation_id);
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::InternalTransferBetweenOrgsRejected { amount, recipient_id, reason } => {
                updated.balance += *amount;
                updated.in_flight.remove(&event.base.correlation_id);
                let status = match reason {
                    TransferRejectionReason::InvalidAccountInfo => {
                        Some(RecipientRegistrationStatus::InvalidAccount)
                    },
                    TransferRejectionReason::AccountClosed => {
                        Some(RecipientRegistrationStatus::Closed)
                    },
                    _ => None,
                };
                if let Some(status) = status {
                    if let Some(recipient) = updated.recipients.remove(recipient_id) {
                        updated.recipients.insert(recipient_id.clone(), recipient.with_status(status));
                    }
                }
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::DomesticTransferRejected { amount, recipient_id, reason } => {
                updated.balance += *amount;
                updated.in_flight.remove(&event.base.correlation_id);
                if *reason == TransferRejectionReason::InvalidAccountInfo {
                    updated.failed_domestic.insert(
                        event.base.correlation_id,
                        FailedDomesticTransfer {
                            correlation_id: event.base.correlation_id,
                            recipient_id: recipient_id.clone(),
                            amount: *amount,
                            reason: reason.clone(),
                            failed_at: event.base.timestamp,
                        },
                    );
                    if let Some(recipient) = updated.recipients.remove(recipient_id) {
                        updated.recipients.insert(
                            recipient_id.clone(),
                            recipient.with_status(RecipientRegistrationStatus::InvalidAccount),
                        );
                    }
                }
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::InternalTransferWithinOrgDeposited { amount, .. }
            | E::InternalTransferBetweenOrgsDeposited { amount, .. }
            | E::InternalAutomatedTransferDeposited { amount, .. }
            | E::PlatformPaymentDeposited { amount, .. } => {
                updated.balance += *amount;
                updated.deposit_history.insert(event.base.correlation_id);
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::InternalTransferBetweenOrgsScheduled { .. } | E::DomesticTransferScheduled { .. } => {
                // the scheduler owns delivery; nothing to track until the
                // scheduled command arrives back
            },

            E::DomesticTransferProgressUpdated { progress } => {
                if let Some(transfer) = updated.in_flight.get_mut(&event.base.correlation_id) {
                    transfer.progress = Some(*progress);
                }
            },

            E::AutoTransferRuleConfigured { config } => {
                updated.auto_transfer_rules.retain(|c| c.id != config.id);
                updated.auto_transfer_rules.push(config.clone());
            },

            E::AutoTransferRuleDeleted { rule_id } => {
                updated.auto_transfer_rules.retain(|c| c.id != *rule_id);
            },

            E::PlatformPaymentPaid { amount, .. } => {
                updated.balance -= *amount;
                updated.criteria.observe(updated.balance, None, fee_policy);
            },

            E::BillingCycleStarted { period, .. } => {
                updated.last_billing_cycle = Some(*period);
                updated.criteria = MaintenanceFeeCriteria::reset(updated.balance, fee_policy);
            },

            E::AccountClosed { .. } => {
                return Some(AccountState::Closed(ClosedAccount {
                    account_id: self.account_id,
                    org_id: self.org_id,
                    owner_name: self.owner_name.clone(),
                    email: self.email.clone(),
                    currency: self.currency,
                    balance: self.balance,
                    in_flight: self.in_flight.clone(),
                }));
            },
        }
        Some(AccountState::Active(updated))
    }
}

/// Closed accounts keep draining terminal events for transfers that were in
/// flight when the account closed; everything else is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClosedAccount {
    account_id: AccountId,
    org_id: OrgId,
    owner_name: String,
    email: String,
    currency: Currency,
    balance: Money,
    in_flight: HashMap<CorrelationId, InFlightTransfer>,
}

impl AggregateState for ClosedAccount {
    type State = AccountState;

    fn decide(
        &self, command: &AccountCommand, _policy: &AccountPolicy,
    ) -> Result<AccountEvent, AccountError> {
        use AccountCommandData as C;
        let transfer = match &command.data {
            C::ApproveInternalTransfer
            | C::RejectInternalTransfer { .. }
            | C::ApproveDomesticTransfer
            | C::RejectDomesticTransfer { .. }
            | C::UpdateDomesticTransferProgress { .. } => self
                .in_flight
                .get(&command.base.correlation_id)
                .ok_or(AccountError::TransferAlreadyProgressedToApprovedOrRejected)?,
            _ => return Err(AccountError::AccountNotActive),
        };

        let data = match (&command.data, transfer.kind) {
            (C::ApproveInternalTransfer, TransferKind::InternalWithinOrg) => {
                AccountEventData::InternalTransferWithinOrgApproved {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                }
            },
            (C::ApproveInternalTransfer, TransferKind::InternalBetweenOrgs) => {
                AccountEventData::InternalTransferBetweenOrgsApproved {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                }
            },
            (C::ApproveInternalTransfer, TransferKind::Automated) => {
                AccountEventData::InternalAutomatedTransferApproved {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                    rule_id: transfer
                        .rule_id()
                        .ok_or_else(|| AccountError::validation("rule_id", "missing rule id"))?,
                }
            },
            (C::RejectInternalTransfer { reason }, TransferKind::InternalWithinOrg) => {
                AccountEventData::InternalTransferWithinOrgRejected {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                    reason: reason.clone(),
                }
            },
            (C::RejectInternalTransfer { reason }, TransferKind::InternalBetweenOrgs) => {
                AccountEventData::InternalTransferBetweenOrgsRejected {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                    reason: reason.clone(),
                }
            },
            (C::RejectInternalTransfer { reason }, TransferKind::Automated) => {
                AccountEventData::InternalAutomatedTransferRejected {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                    reason: reason.clone(),
                    rule_id: transfer
                        .rule_id()
                        .ok_or_else(|| AccountError::validation("rule_id", "missing rule id"))?,
                }
            },
            (C::ApproveDomesticTransfer, TransferKind::Domestic) => {
                AccountEventData::DomesticTransferApproved {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                }
            },
            (C::RejectDomesticTransfer { reason }, TransferKind::Domestic) => {
                AccountEventData::DomesticTransferRejected {
                    amount: transfer.amount,
                    recipient_id: transfer.recipient_id.clone(),
                    reason: reason.clone(),
                }
            },
            (C::UpdateDomesticTransferProgress { progress }, TransferKind::Domestic) => {
                if transfer.progress == Some(*progress) {
                    return Err(AccountError::TransferProgressNoChange);
                }
                AccountEventData::DomesticTransferProgressUpdated { progress: *progress }
            },
            _ => {
                return Err(AccountError::validation(
                    "correlation_id",
                    "transfer kind does not match the resolving command",
                ))
            },
        };
        Ok(AccountEvent::from_command(command, data))
    }

    fn apply(&self, event: &AccountEvent, _policy: &AccountPolicy) -> Option<Self::State> {
        use AccountEventData as E;
        let mut updated = self.clone();
        match &event.data {
            E::InternalTransferWithinOrgApproved { .. }
            | E::InternalTransferBetweenOrgsApproved { .. }
            | E::InternalAutomatedTransferApproved { .. }
            | E::DomesticTransferApproved { .. } => {
                updated.in_flight.remove(&event.base.correlation_id);
            },
            E::InternalTransferWithinOrgRejected { amount, .. }
            | E::InternalTransferBetweenOrgsRejected { amount, .. }
            | E::InternalAutomatedTransferRejected { amount, .. }
            | E::DomesticTransferRejected { amount, .. } => {
                updated.balance += *amount;
                updated.in_flight.remove(&event.base.correlation_id);
            },
            E::DomesticTransferProgressUpdated { progress } => {
                if let Some(transfer) = updated.in_flight.get_mut(&event.base.correlation_id) {
                    transfer.progress = Some(*progress);
                }
            },
            _ => {
                tracing::warn!(event = %event.event_type(), "unrecognized event for closed account -- ignored");
                return None;
            },
        }
        Some(AccountState::Closed(updated))
    }
}
