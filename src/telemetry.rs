use once_cell::sync::Lazy;
use tracing::subscriber::set_global_default;
use tracing::Subscriber;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Composes the engine's subscriber: env-filter plus bunyan-formatted JSON
/// lines to the given sink.
pub fn get_subscriber<Sink>(
    name: String, env_filter: String, sink: Sink,
) -> impl Subscriber + Send + Sync
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));
    let formatting_layer = BunyanFormattingLayer::new(name, sink);
    Registry::default().with(env_filter).with(JsonStorageLayer).with(formatting_layer)
}

/// Registers the subscriber globally and bridges `log` records into it. Call
/// once per process.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    LogTracer::init().expect("failed to route log records into tracing");
    set_global_default(subscriber).expect("failed to install tracing subscriber");
}

/// Shared test subscriber guard: silent unless `TEST_LOG` is set.
pub static TEST_TRACING: Lazy<()> = Lazy::new(|| {
    let default_filter = "warn".to_string();
    let name = "bancs-test".to_string();
    if std::env::var("TEST_LOG").is_ok() {
        let filter = std::env::var("TEST_LOG").unwrap_or(default_filter);
        init_subscriber(get_subscriber(name, filter, std::io::stdout));
    } else {
        init_subscriber(get_subscriber(name, default_filter, std::io::sink));
    }
});
