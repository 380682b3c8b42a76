use bancs::actor::EngineServices;
use bancs::services::{HappyPathServices, InMemoryReadModel};
use bancs::transfer::HttpTransferGateway;
use bancs::Engine;
use clap::Parser;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber =
        bancs::telemetry::get_subscriber("bancs".to_string(), "info".to_string(), std::io::stdout);
    bancs::telemetry::init_subscriber(subscriber);

    let options = bancs::CliOptions::parse();
    let settings = bancs::Settings::load(&options)?;
    tracing::info!(?options, "engine settings loaded");

    let collaborators = Arc::new(HappyPathServices);
    let services = EngineServices {
        email: collaborators.clone(),
        scheduler: collaborators.clone(),
        statements: collaborators,
    };
    let client = reqwest::Client::builder()
        .timeout(settings.gateway.request_timeout)
        .build()?;
    let gateway = Arc::new(HttpTransferGateway::new(client, settings.gateway.base_url.clone()));
    let read_model = Arc::new(InMemoryReadModel::new());

    let engine = Engine::build(&settings, services, gateway, read_model);
    let recovered = engine.recover_remembered().await?;
    tracing::info!(recovered, "remembered entities reactivated");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; draining");
    Ok(())
}
