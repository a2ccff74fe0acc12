//! Market data and connection types shared by every component

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that unwinds this one
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A single price level in an order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Best bid/ask quote from a venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Venue the quote came from (e.g. "binance")
    pub venue: String,
    /// Venue symbol (e.g. "SOLUSDT")
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Quantity resting at the best bid, when the venue reports it
    #[serde(default)]
    pub bid_size: Option<Decimal>,
    /// Quantity resting at the best ask, when the venue reports it
    #[serde(default)]
    pub ask_size: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl PriceUpdate {
    /// Midpoint between bid and ask
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::from(2)
    }

    /// Absolute bid/ask spread
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Order book snapshot or delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    pub venue: String,
    pub symbol: String,
    /// Bid levels sorted by price descending
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
    /// Whether this is a full snapshot or a delta update
    pub is_snapshot: bool,
    #[serde(default)]
    pub sequence: u64,
}

impl OrderBookUpdate {
    /// Best bid level, if any
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    /// Best ask level, if any
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }
}

/// Connection status of a stream client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}
