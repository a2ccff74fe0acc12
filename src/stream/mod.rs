//! Venue market-data streams

pub mod binance;
pub mod client;
pub mod messages;
pub mod metrics;

pub use binance::BinanceBookTicker;
pub use client::{Outbound, ResilientStreamClient, StreamHandler, StreamOptions};
pub use metrics::StreamMetrics;
