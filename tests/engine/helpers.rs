use bancs::actor::EngineServices;
use bancs::broadcast::EngineSignal;
use bancs::model::{
    AccountCommand, AccountCommandData, AccountEnvelope, AccountId, InitiatorId, OrgId,
};
use bancs::services::{InMemoryReadModel, RecordingServices};
use bancs::telemetry::TEST_TRACING;
use bancs::transfer::{BreakerSettings, CoordinatorSettings, DomesticSettings, HttpTransferGateway};
use bancs::{Engine, Settings};
use money2::{Currency, Money};
use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;
use wiremock::MockServer;

pub struct TestApp {
    pub engine: Engine,
    pub services: Arc<RecordingServices>,
    pub read_model: Arc<InMemoryReadModel>,
    pub gateway: MockServer,
}

pub fn usd(amount: i64) -> Money {
    Money::new(amount, 2, Currency::Usd)
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.runtime.shard_count = 4;
    settings.runtime.mailbox_capacity = 32;
    settings.runtime.passivate_after = Duration::from_secs(60);
    settings.runtime.ask_timeout = Duration::from_secs(1);
    settings.runtime.confirm_timeout = Duration::from_secs(1);
    settings.runtime.delivery_attempts = 3;
    settings.coordinator = CoordinatorSettings {
        max_attempts: 2,
        base_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(100),
    };
    settings.domestic = DomesticSettings {
        breaker: BreakerSettings {
            failure_threshold: 2,
            cooldown: Duration::from_millis(200),
        },
        progress_check_interval: Duration::from_millis(100),
        queue_limit: 16,
    };
    settings.billing.period = Duration::from_millis(100);
    settings.billing.burst = 10;
    settings.billing.count = 100;
    settings.closure.retry_interval = Duration::from_millis(100);
    settings.closure.max_attempts = 30;
    settings
}

pub async fn spawn_engine() -> TestApp {
    Lazy::force(&TEST_TRACING);

    let gateway_server = MockServer::start().await;
    let services = Arc::new(RecordingServices::new());
    let read_model = Arc::new(InMemoryReadModel::new());

    let engine_services = EngineServices {
        email: services.clone(),
        scheduler: services.clone(),
        statements: services.clone(),
    };
    let base_url: Url = format!("{}/", gateway_server.uri())
        .parse()
        .expect("mock gateway uri is a valid url");
    let gateway = Arc::new(HttpTransferGateway::new(reqwest::Client::new(), base_url));

    let engine = Engine::build(&test_settings(), engine_services, gateway, read_model.clone());
    TestApp { engine, services, read_model, gateway: gateway_server }
}

impl TestApp {
    pub fn command(
        &self, account_id: AccountId, org_id: OrgId, data: AccountCommandData,
    ) -> AccountCommand {
        AccountCommand::new(
            AccountEnvelope::new(account_id, org_id, InitiatorId::new()),
            data,
        )
    }

    /// Opens an account and waits for the durable `Created` event.
    pub async fn open_account(&self, owner: &str) -> (AccountId, OrgId) {
        let account_id = AccountId::new();
        let org_id = OrgId::new();
        let command = self.command(account_id, org_id, AccountCommandData::CreateAccount {
            owner_name: owner.to_string(),
            email: format!("{owner}@example.com"),
            currency: Currency::Usd,
        });
        self.engine
            .accounts
            .send_command(command)
            .await
            .expect("account creation was not confirmed");
        (account_id, org_id)
    }

    pub async fn deposit(&self, account_id: AccountId, org_id: OrgId, amount: Money) {
        let command =
            self.command(account_id, org_id, AccountCommandData::DepositCash { amount });
        self.engine.accounts.send_command(command).await.expect("deposit was not confirmed");
    }

    pub async fn balance(&self, account_id: AccountId) -> Money {
        self.engine
            .accounts
            .get(account_id)
            .await
            .expect("account ask failed")
            .expect("account does not exist")
            .balance
    }
}

/// Waits for the first bus signal matching the predicate. Subscribe before
/// issuing the commands whose effects you assert on.
pub async fn await_signal<F>(
    rx: &mut broadcast::Receiver<EngineSignal>, timeout: Duration, mut matches: F,
) -> EngineSignal
where
    F: FnMut(&EngineSignal) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for engine signal");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(signal)) if matches(&signal) => return signal,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("engine bus closed"),
            Err(_) => panic!("timed out waiting for engine signal"),
        }
    }
}

/// Polls an async condition until it holds or the timeout elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if deadline <= tokio::time::Instant::now() {
            panic!("condition did not hold within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
