//! Infrastructure layer: job storage, session lookup, config, and database wiring.

pub mod config;
pub mod db;
pub mod jobs;
pub mod sessions;

pub use config::{ConfigError, WorkerConfig};
