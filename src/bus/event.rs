//! Events carried by the bus
//!
//! Every event kind has its own typed payload; the kind is derived from the
//! payload variant so the two can never disagree.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::types::{OrderBookUpdate, PriceUpdate, Side};

/// Highest priority; processed before anything else
pub const PRIORITY_CRITICAL: u8 = 0;
/// Errors and risk alerts
pub const PRIORITY_HIGH: u8 = 1;
/// Market data
pub const PRIORITY_NORMAL: u8 = 2;

/// Event kinds, used as subscription keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PriceUpdate,
    OrderbookUpdate,
    TradeSignal,
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    Connected,
    Disconnected,
    Error,
    RiskLimitBreached,
    CircuitBreakerTriggered,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::PriceUpdate => "price_update",
            EventKind::OrderbookUpdate => "orderbook_update",
            EventKind::TradeSignal => "trade_signal",
            EventKind::OrderPlaced => "order_placed",
            EventKind::OrderFilled => "order_filled",
            EventKind::OrderCancelled => "order_cancelled",
            EventKind::Connected => "websocket_connected",
            EventKind::Disconnected => "websocket_disconnected",
            EventKind::Error => "websocket_error",
            EventKind::RiskLimitBreached => "risk_limit_breached",
            EventKind::CircuitBreakerTriggered => "circuit_breaker_triggered",
        };
        f.write_str(name)
    }
}

/// A strategy's request to trade a spread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub pair: String,
    pub spread: Decimal,
    pub trade_size: Decimal,
}

/// An order accepted or filled by a venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderNotice {
    pub venue: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
}

/// Stream client lifecycle notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionNotice {
    pub client: String,
    pub url: String,
    /// Why the connection ended (disconnect notices only)
    #[serde(default)]
    pub reason: Option<String>,
}

/// Stream client error notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub client: String,
    pub error: String,
}

/// Risk or circuit-breaker alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskNotice {
    pub reason: String,
}

/// Typed event payloads, one variant per [`EventKind`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    PriceUpdate(PriceUpdate),
    OrderbookUpdate(OrderBookUpdate),
    TradeSignal(TradeSignal),
    OrderPlaced(OrderNotice),
    OrderFilled(OrderNotice),
    OrderCancelled(OrderNotice),
    Connected(ConnectionNotice),
    Disconnected(ConnectionNotice),
    Error(ErrorNotice),
    RiskLimitBreached(RiskNotice),
    CircuitBreakerTriggered(RiskNotice),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PriceUpdate(_) => EventKind::PriceUpdate,
            EventPayload::OrderbookUpdate(_) => EventKind::OrderbookUpdate,
            EventPayload::TradeSignal(_) => EventKind::TradeSignal,
            EventPayload::OrderPlaced(_) => EventKind::OrderPlaced,
            EventPayload::OrderFilled(_) => EventKind::OrderFilled,
            EventPayload::OrderCancelled(_) => EventKind::OrderCancelled,
            EventPayload::Connected(_) => EventKind::Connected,
            EventPayload::Disconnected(_) => EventKind::Disconnected,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::RiskLimitBreached(_) => EventKind::RiskLimitBreached,
            EventPayload::CircuitBreakerTriggered(_) => EventKind::CircuitBreakerTriggered,
        }
    }

    /// Priority used when the producer doesn't pick one
    pub fn default_priority(&self) -> u8 {
        match self {
            EventPayload::Error(_)
            | EventPayload::Disconnected(_)
            | EventPayload::RiskLimitBreached(_) => PRIORITY_HIGH,
            EventPayload::CircuitBreakerTriggered(_) => PRIORITY_CRITICAL,
            EventPayload::PriceUpdate(_) | EventPayload::OrderbookUpdate(_) => PRIORITY_NORMAL,
            _ => PRIORITY_CRITICAL,
        }
    }
}

/// Immutable event as delivered to handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    /// Producer name (stream client, executor, ...)
    pub source: String,
    /// 0 = highest
    pub priority: u8,
}

impl Event {
    /// Create an event with the payload's default priority
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        let priority = payload.default_priority();
        Self {
            payload,
            timestamp: Utc::now(),
            source: source.into(),
            priority,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Serialize to JSON bytes for export
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
