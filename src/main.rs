//! spread_arb - Main Entry Point
//!
//! Wires the event bus, the position risk controller and the Binance
//! book-ticker stream together and runs until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use spread_arb::bus::{EventBus, EventKind, EventPayload};
use spread_arb::config::loader::{apply_env, load_config, split_list, validate};
use spread_arb::config::AppConfig;
use spread_arb::risk::RiskController;
use spread_arb::stream::{BinanceBookTicker, ResilientStreamClient, StreamOptions};

/// CLI arguments for the application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Comma-separated list of Binance symbols to stream
    #[arg(long, env = "SYMBOLS")]
    symbols: Option<String>,

    /// Where open positions are persisted
    #[arg(long)]
    positions_file: Option<PathBuf>,
}

fn init_tracing(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn build_config(args: &Args) -> Result<AppConfig> {
    let config = load_config(Some(args.config.as_str())).context("loading configuration")?;
    let mut config = apply_env(config, |key| std::env::var(key).ok())
        .context("applying environment overrides")?;

    if let Some(level) = &args.log_level {
        config.settings.log_level = level.clone();
    }
    if let Some(format) = &args.log_format {
        config.settings.log_format = format.clone();
    }
    if let Some(symbols) = &args.symbols {
        config.stream.symbols = split_list(symbols);
    }
    if let Some(path) = &args.positions_file {
        config.risk.positions_file = Some(path.clone());
    }

    validate(&config).context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = build_config(&args)?;
    init_tracing(&config.settings.log_level, &config.settings.log_format)?;

    info!("Starting spread_arb");
    info!("Configuration file: {}", args.config);

    let bus = Arc::new(EventBus::new(config.bus.clone()));
    bus.subscribe_fn(EventKind::PriceUpdate, "price_logger", |event| async move {
        if let EventPayload::PriceUpdate(update) = &event.payload {
            debug!(
                venue = %update.venue,
                symbol = %update.symbol,
                bid = %update.bid,
                ask = %update.ask,
                "Price update"
            );
        }
        Ok(())
    });
    for kind in [EventKind::Connected, EventKind::Disconnected, EventKind::Error] {
        bus.subscribe_fn(kind, "connection_logger", |event| async move {
            match &event.payload {
                EventPayload::Connected(notice) => info!(client = %notice.client, "Stream connected"),
                EventPayload::Disconnected(notice) => {
                    warn!(client = %notice.client, reason = ?notice.reason, "Stream disconnected")
                }
                EventPayload::Error(notice) => {
                    warn!(client = %notice.client, error = %notice.error, "Stream error")
                }
                _ => {}
            }
            Ok(())
        });
    }
    bus.subscribe_fn(EventKind::RiskLimitBreached, "risk_logger", |event| async move {
        if let EventPayload::RiskLimitBreached(notice) = &event.payload {
            warn!(reason = %notice.reason, "Risk limit breached");
        }
        Ok(())
    });
    bus.start().await;

    let risk = Arc::new(RiskController::from_config(&config.risk).with_bus(bus.clone()));
    let resumed = risk.load().context("loading positions")?;
    info!(resumed, "Risk controller ready");
    risk.start_monitoring();

    if config.stream.symbols.is_empty() {
        warn!("No symbols configured; the stream will connect without subscriptions");
    }
    let handler = Arc::new(BinanceBookTicker::new(&config.stream.symbols));
    let stream = ResilientStreamClient::new(StreamOptions::from(&config.stream), handler, bus.clone());
    stream.start().await;

    info!("Application initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, cleaning up...");

    stream.stop().await;
    risk.stop_monitoring().await;
    bus.stop().await;

    let metrics = stream.metrics();
    info!(
        messages = metrics.messages_received,
        errors = metrics.errors,
        reconnects = metrics.reconnects,
        "Stream stats"
    );
    let summary = risk.position_summary();
    info!(
        open = summary.open_positions,
        daily_trades = summary.daily_trades_count,
        daily_pnl = %summary.daily_pnl,
        "Risk summary"
    );
    let stats = bus.stats();
    info!(
        processed = stats.events_processed,
        dropped = stats.events_dropped,
        "Event bus stats"
    );

    Ok(())
}
