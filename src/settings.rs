
use crate::billing::BillingSettings;
use crate::closure::ClosureSettings;
use crate::model::account::AccountPolicy;
use crate::runtime::RuntimeSettings;
use crate::transfer::{CoordinatorSettings, DomesticSettings};
use clap::Parser;
use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeSettings,
    pub policy: AccountPolicy,
    pub coordinator: CoordinatorSettings,
    pub domestic: DomesticSettings,
    pub billing: BillingSettings,
    pub closure: ClosureSettings,
    pub gateway: GatewaySettings,
    pub bus_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime: RuntimeSettings::default(),
            policy: AccountPolicy::default(),
            coordinator: CoordinatorSettings::default(),
            domestic: DomesticSettings::default(),
            billing: BillingSettings::default(),
            closure: ClosureSettings::default(),
            gateway: GatewaySettings::default(),
            bus_capacity: 1024,
        }
    }
}

#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub base_url: Url,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub request_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9050/"
                .parse()
                .expect("default gateway url is well-formed"),
            request_timeout: Duration::from_secs(10),
        }
    }
}

const DEFAULT_CONFIG_BASENAME: &str = "./resources/engine";
const ENV_PREFIX: &str = "BANCS";

#[derive(Debug, Default, Parser, PartialEq)]
#[clap(author, version, about)]
pub struct CliOptions {
    /// Explicit configuration file, bypassing the inferred `./resources`
    /// lookup. Environment overrides still apply on top.
    #[clap(short, long, value_name = "PATH_TO_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Override the domestic transfer gateway base url.
    #[clap(long, value_name = "URL")]
    pub gateway_url: Option<Url>,
}

impl Settings {
    /// Layered load: compiled defaults < optional file < `BANCS__*`
    /// environment variables < CLI overrides.
    pub fn load(options: &CliOptions) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = match &options.config {
            Some(path) => builder.add_source(config::File::from(path.clone())),
            None => {
                builder.add_source(config::File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
            },
        };
        builder = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));
        if let Some(url) = &options.gateway_url {
            builder = builder.set_override("gateway.base_url", url.as_str())?;
        }

        builder.build()?.try_deserialize()
    }
}
