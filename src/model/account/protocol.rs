use crate::model::account::auto_transfer::AutoTransferConfig;
use crate::model::account::billing::MaintenanceFeeCriteria;
use crate::model::transfer::{
    DomesticRecipient, DomesticTransferProgress, RecipientId, TransferRecipient,
    TransferRejectionReason,
};
use crate::model::{AccountId, BillingPeriod, CardId, EmployeeId, EnvelopeBase, OrgId, RuleId};
use chrono::{DateTime, Utc};
use money2::{Currency, Money};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

pub type AccountEnvelope = EnvelopeBase<AccountId>;

/// Card purchase echo carried by debit commands and events so a decline can be
/// routed back to the originating employee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPurchaseInfo {
    pub employee_id: EmployeeId,
    pub card_id: CardId,
    pub merchant: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCommand {
    pub base: AccountEnvelope,
    pub data: AccountCommandData,
}

impl AccountCommand {
    pub fn new(base: AccountEnvelope, data: AccountCommandData) -> Self {
        Self { base, data }
    }

    pub fn account_id(&self) -> AccountId {
        self.base.entity_id
    }

    /// Name used in validation-rejection broadcasts and logs.
    pub fn name(&self) -> String {
        self.data.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum AccountCommandData {
    CreateAccount {
        owner_name: String,
        email: String,
        currency: Currency,
    },
    DepositCash {
        amount: Money,
    },
    Debit {
        amount: Money,
        purchase: CardPurchaseInfo,
    },
    MaintenanceFee {
        amount: Money,
    },
    SkipMaintenanceFee {
        criteria: MaintenanceFeeCriteria,
    },
    UpdateDailyDebitLimit {
        limit: Money,
    },
    LockCard,
    UnlockCard,
    RegisterInternalRecipient {
        recipient: TransferRecipient,
    },
    RegisterInternalSender {
        sender_id: AccountId,
        sender_org_id: OrgId,
        sender_name: String,
    },
    RegisterDomesticRecipient {
        recipient: DomesticRecipient,
    },
    EditDomesticRecipient {
        recipient: DomesticRecipient,
    },
    InternalTransferWithinOrg {
        amount: Money,
        recipient_id: RecipientId,
    },
    InternalTransferBetweenOrgs {
        amount: Money,
        recipient_id: RecipientId,
    },
    ScheduleInternalTransferBetweenOrgs {
        amount: Money,
        recipient_id: RecipientId,
        scheduled_date: DateTime<Utc>,
    },
    ScheduleDomesticTransfer {
        amount: Money,
        recipient_id: RecipientId,
        scheduled_date: DateTime<Utc>,
    },
    DomesticTransfer {
        amount: Money,
        recipient_id: RecipientId,
    },
    ApproveInternalTransfer,
    RejectInternalTransfer {
        reason: TransferRejectionReason,
    },
    DepositTransferWithinOrg {
        amount: Money,
        sender_id: AccountId,
        sender_name: String,
    },
    DepositTransferBetweenOrgs {
        amount: Money,
        sender_id: AccountId,
        sender_org_id: OrgId,
        sender_name: String,
    },
    UpdateDomesticTransferProgress {
        progress: DomesticTransferProgress,
    },
    ApproveDomesticTransfer,
    RejectDomesticTransfer {
        reason: TransferRejectionReason,
    },
    InternalAutoTransfer {
        amount: Money,
        recipient_id: RecipientId,
        recipient_account_id: AccountId,
        rule_id: RuleId,
    },
    DepositAutomatedTransfer {
        amount: Money,
        sender_id: AccountId,
        sender_name: String,
        rule_id: RuleId,
    },
    ConfigureAutoTransferRule {
        config: AutoTransferConfig,
    },
    DeleteAutoTransferRule {
        rule_id: RuleId,
    },
    PayPlatformPayment {
        amount: Money,
        payee_account_id: AccountId,
        payee_org_id: OrgId,
        memo: Option<String>,
    },
    DepositPlatformPayment {
        amount: Money,
        payer_account_id: AccountId,
        payer_org_id: OrgId,
        memo: Option<String>,
    },
    StartBillingCycle {
        period: BillingPeriod,
        billing_date: DateTime<Utc>,
    },
    CloseAccount {
        reference: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEvent {
    pub base: AccountEnvelope,
    pub data: AccountEventData,
}

impl AccountEvent {
    /// Events inherit the base info of the command that produced them, which
    /// keeps `decide` deterministic and threads the correlation id through
    /// multi-step workflows.
    pub fn from_command(command: &AccountCommand, data: AccountEventData) -> Self {
        Self { base: command.base.clone(), data }
    }

    pub fn account_id(&self) -> AccountId {
        self.base.entity_id
    }

    pub fn event_type(&self) -> String {
        self.data.to_string()
    }

    /// The signed money movement this event records against the balance, if
    /// any. Deposits are positive, debits negative.
    pub fn money_transaction(&self) -> Option<Money> {
        use AccountEventData as E;
        match &self.data {
            E::Deposited { amount }
            | E::InternalTransferWithinOrgDeposited { amount, .. }
            | E::InternalTransferBetweenOrgsDeposited { amount, .. }
            | E::InternalAutomatedTransferDeposited { amount, .. }
            | E::PlatformPaymentDeposited { amount, .. }
            | E::InternalTransferWithinOrgRejected { amount, .. }
            | E::InternalTransferBetweenOrgsRejected { amount, .. }
            | E::InternalAutomatedTransferRejected { amount, .. }
            | E::DomesticTransferRejected { amount, .. } => Some(*amount),
            E::Debited { amount, .. }
            | E::MaintenanceFeeDebited { amount, .. }
            | E::InternalTransferWithinOrgPending { amount, .. }
            | E::InternalTransferBetweenOrgsPending { amount, .. }
            | E::InternalAutomatedTransferPending { amount, .. }
            | E::DomesticTransferPending { amount, .. }
            | E::PlatformPaymentPaid { amount, .. } => Some(*amount),
            _ => None,
        }
    }

    /// Automated-transfer events never re-trigger per-transaction rules.
    pub fn is_automated_transfer(&self) -> bool {
        matches!(
            self.data,
            AccountEventData::InternalAutomatedTransferPending { .. }
                | AccountEventData::InternalAutomatedTransferApproved { .. }
                | AccountEventData::InternalAutomatedTransferRejected { .. }
                | AccountEventData::InternalAutomatedTransferDeposited { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum AccountEventData {
    Created {
        owner_name: String,
        email: String,
        currency: Currency,
    },
    Deposited {
        amount: Money,
    },
    Debited {
        amount: Money,
        purchase: CardPurchaseInfo,
    },
    MaintenanceFeeDebited {
        amount: Money,
    },
    MaintenanceFeeSkipped {
        criteria: MaintenanceFeeCriteria,
    },
    DailyDebitLimitUpdated {
        limit: Money,
    },
    CardLocked,
    CardUnlocked,
    InternalRecipientRegistered {
        recipient: TransferRecipient,
    },
    InternalSenderRegistered {
        sender_id: AccountId,
        sender_org_id: OrgId,
        sender_name: String,
    },
    DomesticRecipientRegistered {
        recipient: DomesticRecipient,
    },
    DomesticRecipientEdited {
        recipient: DomesticRecipient,
    },
    InternalTransferWithinOrgPending {
        amount: Money,
        recipient_id: RecipientId,
        recipient_account_id: AccountId,
    },
    InternalTransferWithinOrgApproved {
        amount: Money,
        recipient_id: RecipientId,
    },
    InternalTransferWithinOrgRejected {
        amount: Money,
        recipient_id: RecipientId,
        reason: TransferRejectionReason,
    },
    InternalTransferWithinOrgDeposited {
        amount: Money,
        sender_id: AccountId,
        sender_name: String,
    },
    InternalTransferBetweenOrgsPending {
        amount: Money,
        recipient_id: RecipientId,
        recipient_account_id: AccountId,
        recipient_org_id: OrgId,
    },
    InternalTransferBetweenOrgsApproved {
        amount: Money,
        recipient_id: RecipientId,
    },
    InternalTransferBetweenOrgsRejected {
        amount: Money,
        recipient_id: RecipientId,
        reason: TransferRejectionReason,
    },
    InternalTransferBetweenOrgsDeposited {
        amount: Money,
        sender_id: AccountId,
        sender_org_id: OrgId,
        sender_name: String,
    },
    InternalTransferBetweenOrgsScheduled {
        amount: Money,
        recipient_id: RecipientId,
        scheduled_date: DateTime<Utc>,
    },
    DomesticTransferScheduled {
        amount: Money,
        recipient_id: RecipientId,
        scheduled_date: DateTime<Utc>,
    },
    DomesticTransferPending {
        amount: Money,
        recipient: DomesticRecipient,
    },
    DomesticTransferProgressUpdated {
        progress: DomesticTransferProgress,
    },
    DomesticTransferApproved {
        amount: Money,
        recipient_id: RecipientId,
    },
    DomesticTransferRejected {
        amount: Money,
        recipient_id: RecipientId,
        reason: TransferRejectionReason,
    },
    InternalAutomatedTransferPending {
        amount: Money,
        recipient_id: RecipientId,
        recipient_account_id: AccountId,
        rule_id: RuleId,
    },
    InternalAutomatedTransferApproved {
        amount: Money,
        recipient_id: RecipientId,
        rule_id: RuleId,
    },
    InternalAutomatedTransferRejected {
        amount: Money,
        recipient_id: RecipientId,
        reason: TransferRejectionReason,
        rule_id: RuleId,
    },
    InternalAutomatedTransferDeposited {
        amount: Money,
        sender_id: AccountId,
        sender_name: String,
        rule_id: RuleId,
    },
    AutoTransferRuleConfigured {
        config: AutoTransferConfig,
    },
    AutoTransferRuleDeleted {
        rule_id: RuleId,
    },
    PlatformPaymentPaid {
        amount: Money,
        payee_account_id: AccountId,
        payee_org_id: OrgId,
        memo: Option<String>,
    },
    PlatformPaymentDeposited {
        amount: Money,
        payer_account_id: AccountId,
        payer_org_id: OrgId,
        memo: Option<String>,
    },
    BillingCycleStarted {
        period: BillingPeriod,
        /// Criteria as of cycle start, captured before `apply` reseeds them;
        /// the fee/skip decision reads this snapshot.
        criteria: MaintenanceFeeCriteria,
    },
    AccountClosed {
        reference: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InitiatorId;
    use money2::Currency;
    use pretty_assertions::assert_eq;

    fn base() -> AccountEnvelope {
        AccountEnvelope::new(AccountId::new(), OrgId::new(), InitiatorId::new())
    }

    #[test]
    fn test_event_type_uses_snake_case_variant_name() {
        let event = AccountEvent {
            base: base(),
            data: AccountEventData::Deposited { amount: Money::new(100_00, 2, Currency::Usd) },
        };
        assert_eq!(event.event_type(), "deposited");

        let event = AccountEvent {
            base: base(),
            data: AccountEventData::BillingCycleStarted {
                period: BillingPeriod { month: 1, year: 2024 },
                criteria: MaintenanceFeeCriteria {
                    qualifying_deposit_found: false,
                    daily_balance_threshold_met: true,
                },
            },
        };
        assert_eq!(event.event_type(), "billing_cycle_started");
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = AccountEvent {
            base: base(),
            data: AccountEventData::InternalTransferWithinOrgPending {
                amount: Money::new(200_00, 2, Currency::Usd),
                recipient_id: RecipientId::internal(AccountId::new()),
                recipient_account_id: AccountId::new(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AccountEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_money_transaction_excludes_non_monetary_events() {
        let event = AccountEvent { base: base(), data: AccountEventData::CardLocked };
        assert_eq!(event.money_transaction(), None);

        let event = AccountEvent {
            base: base(),
            data: AccountEventData::Deposited { amount: Money::new(50_00, 2, Currency::Usd) },
        };
        assert_eq!(event.money_transaction(), Some(Money::new(50_00, 2, Currency::Usd)));
    }

    #[test]
    fn test_events_from_command_share_correlation_id() {
        let command = AccountCommand::new(
            base(),
            AccountCommandData::DepositCash { amount: Money::new(10_00, 2, Currency::Usd) },
        );
        let event = AccountEvent::from_command(
            &command,
            AccountEventData::Deposited { amount: Money::new(10_00, 2, Currency::Usd) },
        );
        assert_eq!(event.base.correlation_id, command.base.correlation_id);
        assert_eq!(event.base.entity_id, command.base.entity_id);
    }
}
