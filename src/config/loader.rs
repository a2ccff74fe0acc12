//! Configuration loader

use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use super::types::AppConfig;
use crate::common::errors::{EngineError, Result};

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. Environment variables (`APP__<SECTION>__<KEY>`, e.g. `APP__RISK__MAX_DAILY_TRADES`)
/// 2. Configuration file (TOML format)
/// 3. Default values
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("APP")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| EngineError::Configuration(e.to_string()))?;

    let config: AppConfig = config
        .try_deserialize()
        .map_err(|e| EngineError::Configuration(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Load configuration from the flat environment variable names used by the
/// deployment scripts (`MAX_RETRIES`, `MAX_POSITION_AGE_SECONDS`, ...).
///
/// Unset variables keep their defaults; set but unparsable ones are an error.
pub fn load_from_env() -> Result<AppConfig> {
    dotenvy::dotenv().ok();
    let config = apply_env(AppConfig::default(), |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings no component can run with
pub fn validate(config: &AppConfig) -> Result<()> {
    let url = Url::parse(&config.stream.url)
        .map_err(|e| EngineError::Configuration(format!("stream.url {:?}: {}", config.stream.url, e)))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(EngineError::Configuration(format!(
            "stream.url must be ws:// or wss://, got {}",
            url.scheme()
        )));
    }

    if config.stream.ping_interval_secs == 0 {
        return Err(EngineError::Configuration(
            "stream.ping_interval_secs must be positive".to_string(),
        ));
    }
    if config.stream.ping_timeout_secs == 0 {
        return Err(EngineError::Configuration(
            "stream.ping_timeout_secs must be positive".to_string(),
        ));
    }

    let executor = &config.executor;
    if !executor.backoff_multiplier.is_finite() || executor.backoff_multiplier < 1.0 {
        return Err(EngineError::Configuration(format!(
            "executor.backoff_multiplier must be >= 1, got {}",
            executor.backoff_multiplier
        )));
    }
    if executor.confirmation_check_interval().is_zero() {
        return Err(EngineError::Configuration(
            "executor.confirmation_check_interval_secs must be positive".to_string(),
        ));
    }

    if config.risk.sweep_interval_secs == 0 {
        return Err(EngineError::Configuration(
            "risk.sweep_interval_secs must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Overlay flat environment overrides onto `config`.
///
/// `lookup` is injected so tests don't have to mutate the process environment.
pub fn apply_env<F>(mut config: AppConfig, lookup: F) -> Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let executor = &mut config.executor;
    override_parsed(&lookup, "MAX_RETRIES", &mut executor.max_retries)?;
    override_parsed(&lookup, "BASE_RETRY_DELAY", &mut executor.base_retry_delay_secs)?;
    override_parsed(&lookup, "MAX_RETRY_DELAY", &mut executor.max_retry_delay_secs)?;
    override_parsed(&lookup, "BACKOFF_MULTIPLIER", &mut executor.backoff_multiplier)?;
    override_parsed(&lookup, "CONFIRMATION_TIMEOUT", &mut executor.confirmation_timeout_secs)?;
    override_parsed(
        &lookup,
        "CONFIRMATION_CHECK_INTERVAL",
        &mut executor.confirmation_check_interval_secs,
    )?;

    let risk = &mut config.risk;
    override_parsed(&lookup, "MAX_POSITION_AGE_SECONDS", &mut risk.max_position_age_seconds)?;
    override_parsed(&lookup, "MAX_CONCURRENT_POSITIONS", &mut risk.max_concurrent_positions)?;
    override_parsed(&lookup, "MAX_TRADES_PER_DAY", &mut risk.max_daily_trades)?;
    override_parsed(&lookup, "MAX_DAILY_DRAWDOWN", &mut risk.max_daily_drawdown)?;
    if let Some(path) = lookup("POSITIONS_FILE") {
        risk.positions_file = Some(PathBuf::from(path));
    }

    let stream = &mut config.stream;
    if let Some(url) = lookup("BINANCE_WS_URL") {
        stream.url = url;
    }
    if let Some(symbols) = lookup("SYMBOLS") {
        stream.symbols = split_list(&symbols);
    }

    if let Some(level) = lookup("LOG_LEVEL") {
        config.settings.log_level = level;
    }

    Ok(config)
}

/// Split a comma-separated list, trimming blanks
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn override_parsed<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Configuration(format!("{}={:?}: {}", key, raw, e)))?;
    }
    Ok(())
}
