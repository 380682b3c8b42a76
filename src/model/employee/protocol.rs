use crate::model::{AccountId, CardId, EmployeeId, EnvelopeBase};
use chrono::{DateTime, Utc};
use money2::Money;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

pub type EmployeeEnvelope = EnvelopeBase<EmployeeId>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum EmployeeRole {
    Admin,
    CardHolder,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct InviteToken(Uuid);

impl InviteToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InviteToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub card_id: CardId,
    pub last4: String,
    pub virtual_card: bool,
    pub daily_limit: Money,
    pub monthly_limit: Money,
}

/// A card purchase awaiting the account-side debit outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub account_id: AccountId,
    pub card_id: CardId,
    pub amount: Money,
    pub merchant: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeCommand {
    pub base: EmployeeEnvelope,
    pub data: EmployeeCommandData,
}

impl EmployeeCommand {
    pub fn new(base: EmployeeEnvelope, data: EmployeeCommandData) -> Self {
        Self { base, data }
    }

    pub fn name(&self) -> String {
        self.data.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum EmployeeCommandData {
    CreateEmployee {
        name: String,
        email: String,
        role: EmployeeRole,
        invite_token: InviteToken,
        card: Option<Card>,
    },
    ConfirmInvitation {
        token: InviteToken,
    },
    ConfigureCard {
        card: Card,
    },
    PurchaseIntent {
        account_id: AccountId,
        card_id: CardId,
        amount: Money,
        merchant: String,
    },
    ApproveDebit,
    DeclineDebit {
        reason: String,
    },
    UpdateCardDailyLimit {
        card_id: CardId,
        limit: Money,
    },
    UpdateCardMonthlyLimit {
        card_id: CardId,
        limit: Money,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeEvent {
    pub base: EmployeeEnvelope,
    pub data: EmployeeEventData,
}

impl EmployeeEvent {
    pub fn from_command(command: &EmployeeCommand, data: EmployeeEventData) -> Self {
        Self { base: command.base.clone(), data }
    }

    pub fn event_type(&self) -> String {
        self.data.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum EmployeeEventData {
    EmployeeCreated {
        name: String,
        email: String,
        role: EmployeeRole,
        invite_token: InviteToken,
        card: Option<Card>,
    },
    InvitationConfirmed,
    CardConfigured {
        card: Card,
    },
    DebitRequested {
        purchase: Purchase,
    },
    DebitApproved {
        purchase: Purchase,
    },
    DebitDeclined {
        purchase: Purchase,
        reason: String,
    },
    CardDailyLimitUpdated {
        card_id: CardId,
        limit: Money,
    },
    CardMonthlyLimitUpdated {
        card_id: CardId,
        limit: Money,
    },
}
