//! Blink-rate and host telemetry capture with a local durable queue and
//! periodic sync to a remote collector.

pub mod auth;
pub mod db;
pub mod pipeline;
pub mod sampler;
pub mod sensing;
pub mod settings;
pub mod sync;
pub mod telemetry;
mod utils;

pub use pipeline::{PipelineCoordinator, PipelineEvent};
pub use settings::{PipelineSettings, SettingsStore};

/// Installs the global logger. Reads `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
