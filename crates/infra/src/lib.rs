//! Infrastructure layer: job storage, workers, delivery and configuration.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, RelayConfig};
