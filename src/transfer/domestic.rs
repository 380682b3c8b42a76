use super::circuit::{BreakerSettings, BreakerState, CircuitBreaker};
use super::gateway::{GatewayRequest, GatewayResponse, GatewayTransferStatus, TransferGatewayApi};
use crate::actor::account::AccountRoute;
use crate::broadcast::{EngineBus, EngineSignal};
use crate::model::{
    AccountCommand, AccountCommandData, AccountEnvelope, AccountEvent, AccountEventData,
    AccountId, CorrelationId, DomesticRecipient, InitiatorId, OrgId, TransferRejectionReason,
};
use money2::Money;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SERVICE_NAME: &str = "domestic-transfer-gateway";

#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomesticSettings {
    pub breaker: BreakerSettings,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub progress_check_interval: Duration,
    pub queue_limit: usize,
}

impl Default for DomesticSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerSettings::default(),
            progress_check_interval: Duration::from_secs(10),
            queue_limit: 256,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferAction {
    Initiate,
    ProgressCheck,
}

/// Everything the worker needs to drive one domestic transfer against the
/// gateway and route the outcome back to the sender account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomesticTransferTxn {
    pub sender_account_id: AccountId,
    pub sender_org_id: OrgId,
    pub initiated_by: InitiatorId,
    pub correlation_id: CorrelationId,
    pub amount: Money,
    pub recipient: DomesticRecipient,
}

impl DomesticTransferTxn {
    /// Message extractor from the sender's pending event.
    pub fn from_pending(event: &AccountEvent) -> Option<Self> {
        match &event.data {
            AccountEventData::DomesticTransferPending { amount, recipient } => Some(Self {
                sender_account_id: event.base.entity_id,
                sender_org_id: event.base.org_id,
                initiated_by: event.base.initiated_by,
                correlation_id: event.base.correlation_id,
                amount: *amount,
                recipient: recipient.clone(),
            }),
            _ => None,
        }
    }

    pub fn gateway_request(&self) -> GatewayRequest {
        GatewayRequest {
            account_number: self.recipient.account_number.clone(),
            routing_number: self.recipient.routing_number.clone(),
            amount: self.amount,
            reference: self.correlation_id.to_string(),
        }
    }

    fn command(&self, data: AccountCommandData) -> AccountCommand {
        AccountCommand::new(
            AccountEnvelope::new(self.sender_account_id, self.sender_org_id, self.initiated_by)
                .with_correlation(self.correlation_id),
            data,
        )
    }
}

#[derive(Debug)]
pub enum DomesticWorkerMessage {
    TransferRequest {
        action: TransferAction,
        txn: DomesticTransferTxn,
    },
    TransferResponse {
        outcome: Result<GatewayResponse, String>,
        action: TransferAction,
        txn: DomesticTransferTxn,
    },
    BreakerHalfOpen,
    BreakerClosed,
}

/// Cluster-singleton worker wrapping the external transfer gateway behind a
/// circuit breaker. While the breaker is open, requests queue and drain once
/// the half-open probe succeeds.
#[derive(Debug, Clone)]
pub struct DomesticTransferWorker {
    tx: mpsc::Sender<DomesticWorkerMessage>,
}

impl DomesticTransferWorker {
    pub fn spawn(
        accounts: AccountRoute, gateway: Arc<dyn TransferGatewayApi>, settings: DomesticSettings,
        bus: EngineBus,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_limit.max(16));
        let worker = Worker {
            accounts,
            gateway,
            bus,
            breaker: CircuitBreaker::new(settings.breaker.clone()),
            queue: VecDeque::new(),
            probe_in_flight: false,
            settings,
            self_tx: tx.clone(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    pub async fn submit(&self, txn: DomesticTransferTxn) {
        self.send(DomesticWorkerMessage::TransferRequest { action: TransferAction::Initiate, txn })
            .await;
    }

    pub async fn send(&self, message: DomesticWorkerMessage) {
        if self.tx.send(message).await.is_err() {
            tracing::error!("domestic transfer worker stopped; message dropped");
        }
    }
}

struct Worker {
    accounts: AccountRoute,
    gateway: Arc<dyn TransferGatewayApi>,
    settings: DomesticSettings,
    bus: EngineBus,
    breaker: CircuitBreaker,
    queue: VecDeque<(TransferAction, DomesticTransferTxn)>,
    probe_in_flight: bool,
    self_tx: mpsc::Sender<DomesticWorkerMessage>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<DomesticWorkerMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                DomesticWorkerMessage::TransferRequest { action, txn } => {
                    self.on_request(action, txn).await;
                },
                DomesticWorkerMessage::TransferResponse { outcome, action, txn } => {
                    self.on_response(outcome, action, txn).await;
                },
                DomesticWorkerMessage::BreakerHalfOpen => self.on_half_open().await,
                DomesticWorkerMessage::BreakerClosed => self.on_forced_close().await,
            }
        }
    }

    fn publish_transition(&self, state: BreakerState) {
        tracing::info!(service = SERVICE_NAME, %state, "circuit breaker transition");
        self.bus.publish(EngineSignal::CircuitBreaker { service: SERVICE_NAME, state });
    }

    async fn on_request(&mut self, action: TransferAction, txn: DomesticTransferTxn) {
        match self.breaker.state() {
            BreakerState::Closed => self.dispatch(action, txn, false),
            BreakerState::HalfOpen if !self.probe_in_flight => self.dispatch(action, txn, true),
            _ => self.enqueue(action, txn).await,
        }
    }

    async fn enqueue(&mut self, action: TransferAction, txn: DomesticTransferTxn) {
        if self.settings.queue_limit <= self.queue.len() {
            tracing::warn!(
                correlation_id = %txn.correlation_id,
                "breaker queue full; rejecting domestic transfer"
            );
            self.resolve(
                txn.command(AccountCommandData::RejectDomesticTransfer {
                    reason: TransferRejectionReason::Unknown,
                }),
            )
            .await;
            return;
        }
        self.queue.push_back((action, txn));
    }

    fn dispatch(&mut self, action: TransferAction, txn: DomesticTransferTxn, probe: bool) {
        self.probe_in_flight = probe;
        let gateway = Arc::clone(&self.gateway);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let request = txn.gateway_request();
            let outcome = match action {
                TransferAction::Initiate => gateway.initiate(request).await,
                TransferAction::ProgressCheck => gateway.check_progress(request).await,
            }
            .map_err(|err| err.to_string());
            let _ = self_tx
                .send(DomesticWorkerMessage::TransferResponse { outcome, action, txn })
                .await;
        });
    }

    async fn on_response(
        &mut self, outcome: Result<GatewayResponse, String>, action: TransferAction,
        txn: DomesticTransferTxn,
    ) {
        self.probe_in_flight = false;
        match outcome {
            Err(error) => {
                tracing::warn!(
                    correlation_id = %txn.correlation_id,
                    %error,
                    "transfer gateway call failed"
                );
                if let Some(state) = self.breaker.on_failure() {
                    self.publish_transition(state);
                    if state == BreakerState::Open {
                        self.schedule_half_open();
                    }
                }
                // retried once the breaker recovers
                self.queue.push_front((action, txn));
            },
            Ok(response) => {
                if let Some(state) = self.breaker.on_success() {
                    self.publish_transition(state);
                    self.drain_queue().await;
                }
                self.apply_response(response, txn).await;
            },
        }
    }

    async fn apply_response(&mut self, response: GatewayResponse, txn: DomesticTransferTxn) {
        if !response.ok || response.status == GatewayTransferStatus::Failed {
            let reason = response.rejection_reason();
            self.resolve(txn.command(AccountCommandData::RejectDomesticTransfer { reason })).await;
            return;
        }

        match response.status {
            GatewayTransferStatus::Complete => {
                self.resolve(txn.command(AccountCommandData::ApproveDomesticTransfer)).await;
            },
            GatewayTransferStatus::Outgoing | GatewayTransferStatus::InProgress => {
                self.resolve(txn.command(AccountCommandData::UpdateDomesticTransferProgress {
                    progress: response.status.into(),
                }))
                .await;
                self.schedule_progress_check(txn);
            },
            GatewayTransferStatus::Failed => unreachable!("handled above"),
        }
    }

    fn schedule_progress_check(&self, txn: DomesticTransferTxn) {
        let self_tx = self.self_tx.clone();
        let delay = self.settings.progress_check_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = self_tx
                .send(DomesticWorkerMessage::TransferRequest {
                    action: TransferAction::ProgressCheck,
                    txn,
                })
                .await;
        });
    }

    fn schedule_half_open(&self) {
        let self_tx = self.self_tx.clone();
        let cooldown = self.breaker.cooldown();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let _ = self_tx.send(DomesticWorkerMessage::BreakerHalfOpen).await;
        });
    }

    async fn on_half_open(&mut self) {
        if let Some(state) = self.breaker.on_cooldown_elapsed() {
            self.publish_transition(state);
            if let Some((action, txn)) = self.queue.pop_front() {
                self.dispatch(action, txn, true);
            }
        }
    }

    async fn on_forced_close(&mut self) {
        if self.breaker.state() != BreakerState::Closed {
            if let Some(state) = self.breaker.on_success() {
                self.publish_transition(state);
            }
        }
        self.drain_queue().await;
    }

    async fn drain_queue(&mut self) {
        while let Some((action, txn)) = self.queue.pop_front() {
            self.dispatch(action, txn, false);
        }
    }

    async fn resolve(&self, command: AccountCommand) {
        if let Err(err) = self.accounts.send_command(command.clone()).await {
            tracing::error!(
                command = %command.name(),
                account_id = %command.account_id(),
                error = %err,
                "domestic transfer outcome delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transfer::{DepositoryType, PaymentNetwork};
    use money2::Currency;
    use pretty_assertions::assert_eq;

    fn pending_event() -> AccountEvent {
        let base = AccountEnvelope::new(AccountId::new(), OrgId::new(), InitiatorId::new());
        AccountEvent {
            base,
            data: AccountEventData::DomesticTransferPending {
                amount: Money::new(300_00, 2, Currency::Usd),
                recipient: DomesticRecipient {
                    name: "Edsger Dijkstra".to_string(),
                    account_number: "111222333".to_string(),
                    routing_number: "021000021".to_string(),
                    depository: DepositoryType::Checking,
                    payment_network: PaymentNetwork::Ach,
                },
            },
        }
    }

    #[test]
    fn test_txn_extracted_from_pending_event() {
        let event = pending_event();
        let txn = DomesticTransferTxn::from_pending(&event).unwrap();
        assert_eq!(txn.sender_account_id, event.base.entity_id);
        assert_eq!(txn.correlation_id, event.base.correlation_id);
        assert_eq!(txn.amount, Money::new(300_00, 2, Currency::Usd));

        let request = txn.gateway_request();
        assert_eq!(request.account_number, "111222333");
        assert_eq!(request.reference, txn.correlation_id.to_string());
    }

    #[test]
    fn test_non_pending_events_extract_nothing() {
        let base = AccountEnvelope::new(AccountId::new(), OrgId::new(), InitiatorId::new());
        let event = AccountEvent { base, data: AccountEventData::CardLocked };
        assert!(DomesticTransferTxn::from_pending(&event).is_none());
    }
}
