//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Venue stream configuration
    #[serde(default)]
    pub stream: StreamConfig,
    /// Order executor retry/confirmation settings
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Position risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Event bus settings
    #[serde(default)]
    pub bus: BusConfig,
    /// General application settings
    #[serde(default)]
    pub settings: AppSettings,
}

/// Stream client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Client name used in events and logs
    #[serde(default = "default_stream_name")]
    pub name: String,
    /// WebSocket URL
    #[serde(default = "default_stream_url")]
    pub url: String,
    /// Symbols to subscribe to on connect
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Pause between reconnection cycles, in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Keepalive ping interval, in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Time allowed for a pong, in seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    /// Largest accepted message, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Connect attempts per connect call before the supervisor backs off
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: default_stream_name(),
            url: default_stream_url(),
            symbols: Vec::new(),
            reconnect_delay_secs: default_reconnect_delay(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            max_message_size: default_max_message_size(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

fn default_stream_name() -> String {
    "BinanceWS".to_string()
}

fn default_stream_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

// Binance expects a ping at least every 3 minutes
fn default_ping_interval() -> u64 {
    180
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

fn default_connect_attempts() -> u32 {
    3
}

/// Order executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay, in seconds
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_secs: f64,
    /// Backoff cap, in seconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Per-leg confirmation deadline, in seconds
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: f64,
    /// Confirmation polling period, in seconds
    #[serde(default = "default_confirmation_check_interval")]
    pub confirmation_check_interval_secs: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_retry_delay_secs: default_base_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            confirmation_check_interval_secs: default_confirmation_check_interval(),
        }
    }
}

impl ExecutorConfig {
    pub fn base_retry_delay(&self) -> Duration {
        secs_f64(self.base_retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        secs_f64(self.max_retry_delay_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        secs_f64(self.confirmation_timeout_secs)
    }

    pub fn confirmation_check_interval(&self) -> Duration {
        secs_f64(self.confirmation_check_interval_secs)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay() -> f64 {
    0.1
}

fn default_max_retry_delay() -> f64 {
    30.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_confirmation_timeout() -> f64 {
    30.0
}

fn default_confirmation_check_interval() -> f64 {
    2.0
}

/// Position risk controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Age after which an open position is force-closed
    #[serde(default = "default_max_position_age")]
    pub max_position_age_seconds: u64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    /// Daily loss limit as a fraction of `drawdown_base_capital`
    #[serde(default = "default_max_daily_drawdown")]
    pub max_daily_drawdown: Decimal,
    #[serde(default = "default_drawdown_base_capital")]
    pub drawdown_base_capital: Decimal,
    /// Expiry sweep cadence, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Closed positions kept in memory and on disk
    #[serde(default = "default_closed_history_limit")]
    pub closed_history_limit: usize,
    /// Loss booked by the placeholder exit on timeout
    #[serde(default = "default_timeout_exit_loss")]
    pub timeout_exit_loss: Decimal,
    /// Loss booked by the placeholder exit on an emergency close
    #[serde(default = "default_emergency_exit_loss")]
    pub emergency_exit_loss: Decimal,
    /// Position state file; `None` disables persistence
    #[serde(default = "default_positions_file")]
    pub positions_file: Option<PathBuf>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_age_seconds: default_max_position_age(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_trades: default_max_daily_trades(),
            max_daily_drawdown: default_max_daily_drawdown(),
            drawdown_base_capital: default_drawdown_base_capital(),
            sweep_interval_secs: default_sweep_interval(),
            closed_history_limit: default_closed_history_limit(),
            timeout_exit_loss: default_timeout_exit_loss(),
            emergency_exit_loss: default_emergency_exit_loss(),
            positions_file: default_positions_file(),
        }
    }
}

fn default_max_position_age() -> u64 {
    180
}

fn default_max_concurrent_positions() -> usize {
    3
}

fn default_max_daily_trades() -> u32 {
    50
}

fn default_max_daily_drawdown() -> Decimal {
    Decimal::new(5, 2)
}

fn default_drawdown_base_capital() -> Decimal {
    Decimal::from(1000)
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_closed_history_limit() -> usize {
    100
}

fn default_timeout_exit_loss() -> Decimal {
    Decimal::from(2)
}

fn default_emergency_exit_loss() -> Decimal {
    Decimal::ONE
}

fn default_positions_file() -> Option<PathBuf> {
    Some(PathBuf::from("data/positions.json"))
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bounded queue capacity; publishes beyond it are dropped
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Grace period for the dispatch loop on stop, in milliseconds
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Latency samples kept for stats
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            stop_grace_ms: default_stop_grace_ms(),
            stats_window: default_stats_window(),
        }
    }
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_stats_window() -> usize {
    1_000
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Negative or non-finite values collapse to zero
fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}
