use crate::model::{zero_money, CardId, CorrelationId, EmployeeId};
use chrono::{Datelike, NaiveDate};
use money2::{Currency, Money};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::Display;

mod errors;
mod protocol;

pub use errors::EmployeeError;
pub use protocol::{
    Card, EmployeeCommand, EmployeeCommandData, EmployeeEnvelope, EmployeeEvent, EmployeeEventData,
    EmployeeRole, InviteToken, Purchase,
};

pub const AGGREGATE_TYPE: &str = "employee";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum EmployeeStatus {
    PendingInvite,
    Active,
}

/// Per-card spend accrual with stale-window reset, mirroring the account's
/// daily debit accrual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
struct SpendWindow {
    daily: Option<Money>,
    monthly: Option<Money>,
    last_purchase_date: Option<NaiveDate>,
}

impl SpendWindow {
    fn daily_on(&self, date: NaiveDate, currency: Currency) -> Money {
        match (self.last_purchase_date, self.daily) {
            (Some(last), Some(daily)) if last == date => daily,
            _ => zero_money(currency),
        }
    }

    fn monthly_on(&self, date: NaiveDate, currency: Currency) -> Money {
        match (self.last_purchase_date, self.monthly) {
            (Some(last), Some(monthly))
                if last.year() == date.year() && last.month() == date.month() =>
            {
                monthly
            },
            _ => zero_money(currency),
        }
    }

    fn accrue(&mut self, amount: Money, date: NaiveDate) {
        let currency = amount.currency;
        self.daily = Some(self.daily_on(date, currency) + amount);
        self.monthly = Some(self.monthly_on(date, currency) + amount);
        self.last_purchase_date = Some(date);
    }
}

/// The employee aggregate: invitation lifecycle plus card-backed purchases
/// that couple to account debits through the shared correlation id.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    state: Option<EmployeeBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EmployeeBody {
    employee_id: EmployeeId,
    name: String,
    email: String,
    role: EmployeeRole,
    status: EmployeeStatus,
    invite_token: InviteToken,
    cards: HashMap<CardId, Card>,
    spend: HashMap<CardId, SpendWindow>,
    pending_purchases: HashMap<CorrelationId, Purchase>,
}

impl Employee {
    pub fn decide(&self, command: &EmployeeCommand) -> Result<EmployeeEvent, EmployeeError> {
        use EmployeeCommandData as C;
        let Some(body) = &self.state else {
            return match &command.data {
                C::CreateEmployee { name, email, role, invite_token, card } => {
                    Ok(EmployeeEvent::from_command(command, EmployeeEventData::EmployeeCreated {
                        name: name.clone(),
                        email: email.clone(),
                        role: *role,
                        invite_token: *invite_token,
                        card: card.clone(),
                    }))
                },
                _ => Err(EmployeeError::EmployeeNotActive),
            };
        };

        match &command.data {
            C::CreateEmployee { .. } => {
                Err(EmployeeError::validation("employee", "employee already exists"))
            },

            C::ConfirmInvitation { token } => {
                if body.status == EmployeeStatus::Active {
                    return Err(EmployeeError::validation("invitation", "already confirmed"));
                }
                if *token != body.invite_token {
                    return Err(EmployeeError::InvalidInviteToken);
                }
                Ok(EmployeeEvent::from_command(command, EmployeeEventData::InvitationConfirmed))
            },

            C::ConfigureCard { card } => {
                body.require_active()?;
                Ok(EmployeeEvent::from_command(command, EmployeeEventData::CardConfigured {
                    card: card.clone(),
                }))
            },

            C::PurchaseIntent { account_id, card_id, amount, merchant } => {
                body.require_active()?;
                let card = body.cards.get(card_id).ok_or(EmployeeError::CardNotFound)?;
                if *amount <= zero_money(amount.currency) {
                    return Err(EmployeeError::DebitAmountNotPositive);
                }
                let date = command.base.timestamp.date_naive();
                let window = body.spend.get(card_id).cloned().unwrap_or_default();
                let daily = window.daily_on(date, amount.currency);
                if card.daily_limit < daily + *amount {
                    return Err(EmployeeError::ExceededDailyDebit {
                        limit: card.daily_limit,
                        accrued: daily,
                    });
                }
                let monthly = window.monthly_on(date, amount.currency);
                if card.monthly_limit < monthly + *amount {
                    return Err(EmployeeError::ExceededMonthlyDebit {
                        limit: card.monthly_limit,
                        accrued: monthly,
                    });
                }
                Ok(EmployeeEvent::from_command(command, EmployeeEventData::DebitRequested {
                    purchase: Purchase {
                        account_id: *account_id,
                        card_id: *card_id,
                        amount: *amount,
                        merchant: merchant.clone(),
                        date: command.base.timestamp,
                    },
                }))
            },

            C::ApproveDebit => {
                let purchase = body
                    .pending_purchases
                    .get(&command.base.correlation_id)
                    .ok_or(EmployeeError::PurchaseAlreadyProgressed)?;
                Ok(EmployeeEvent::from_command(command, EmployeeEventData::DebitApproved {
                    purchase: purchase.clone(),
                }))
            },

            C::DeclineDebit { reason } => {
                let purchase = body
                    .pending_purchases
                    .get(&command.base.correlation_id)
                    .ok_or(EmployeeError::PurchaseAlreadyProgressed)?;
                Ok(EmployeeEvent::from_command(command, EmployeeEventData::DebitDeclined {
                    purchase: purchase.clone(),
                    reason: reason.clone(),
                }))
            },

            C::UpdateCardDailyLimit { card_id, limit } => {
                body.require_active()?;
                if !body.cards.contains_key(card_id) {
                    return Err(EmployeeError::CardNotFound);
                }
                Ok(EmployeeEvent::from_command(command, EmployeeEventData::CardDailyLimitUpdated {
                    card_id: *card_id,
                    limit: *limit,
                }))
            },

            C::UpdateCardMonthlyLimit { card_id, limit } => {
                body.require_active()?;
                if !body.cards.contains_key(card_id) {
                    return Err(EmployeeError::CardNotFound);
                }
                Ok(EmployeeEvent::from_command(
                    command,
                    EmployeeEventData::CardMonthlyLimitUpdated { card_id: *card_id, limit: *limit },
                ))
            },
        }
    }

    pub fn apply(&mut self, event: &EmployeeEvent) {
        use EmployeeEventData as E;
        match (&mut self.state, &event.data) {
            (state @ None, E::EmployeeCreated { name, email, role, invite_token, card }) => {
                let mut cards = HashMap::new();
                if let Some(card) = card {
                    cards.insert(card.card_id, card.clone());
                }
                *state = Some(EmployeeBody {
                    employee_id: event.base.entity_id,
                    name: name.clone(),
                    email: email.clone(),
                    role: *role,
                    status: EmployeeStatus::PendingInvite,
                    invite_token: *invite_token,
                    cards,
                    spend: HashMap::new(),
                    pending_purchases: HashMap::new(),
                });
            },
            (Some(body), E::InvitationConfirmed) => body.status = EmployeeStatus::Active,
            (Some(body), E::CardConfigured { card }) => {
                body.cards.insert(card.card_id, card.clone());
            },
            (Some(body), E::DebitRequested { purchase }) => {
                body.pending_purchases.insert(event.base.correlation_id, purchase.clone());
            },
            (Some(body), E::DebitApproved { purchase }) => {
                body.pending_purchases.remove(&event.base.correlation_id);
                body.spend
                    .entry(purchase.card_id)
                    .or_default()
                    .accrue(purchase.amount, purchase.date.date_naive());
            },
            (Some(body), E::DebitDeclined { .. }) => {
                body.pending_purchases.remove(&event.base.correlation_id);
            },
            (Some(body), E::CardDailyLimitUpdated { card_id, limit }) => {
                if let Some(card) = body.cards.get_mut(card_id) {
                    card.daily_limit = *limit;
                }
            },
            (Some(body), E::CardMonthlyLimitUpdated { card_id, limit }) => {
                if let Some(card) = body.cards.get_mut(card_id) {
                    card.monthly_limit = *limit;
                }
            },
            (_, event_data) => {
                tracing::warn!(event = ?event_data, "unrecognized employee event -- ignored");
            },
        }
    }

    pub fn status(&self) -> Option<EmployeeStatus> {
        self.state.as_ref().map(|body| body.status)
    }

    pub fn email(&self) -> Option<&str> {
        self.state.as_ref().map(|body| body.email.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.state.as_ref().map(|body| body.name.as_str())
    }

    pub fn pending_purchase(&self, correlation_id: CorrelationId) -> Option<&Purchase> {
        self.state.as_ref().and_then(|body| body.pending_purchases.get(&correlation_id))
    }
}

impl EmployeeBody {
    fn require_active(&self) -> Result<(), EmployeeError> {
        if self.status == EmployeeStatus::Active {
            Ok(())
        } else {
            Err(EmployeeError::EmployeeNotActive)
        }
    }
}
