//! Application configuration

pub mod loader;
pub mod types;

pub use loader::{load_config, load_from_env, validate};
pub use types::{AppConfig, AppSettings, BusConfig, ExecutorConfig, RiskConfig, StreamConfig};
