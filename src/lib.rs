#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    clippy::suspicious,
    // missing_docs,
    rust_2018_idioms
)]

pub mod actor;
pub mod billing;
pub mod broadcast;
pub mod closure;
pub mod engine;
mod errors;
pub mod journal;
pub mod model;
pub mod runtime;
pub mod services;
mod settings;
pub mod telemetry;
pub mod transfer;

pub use engine::Engine;
pub use errors::EngineError;
pub use settings::{CliOptions, GatewaySettings, Settings};
