//! Binance spot stream wire types

use serde::{Deserialize, Serialize};

/// Live subscription request
///
/// ```json
/// {"method": "SUBSCRIBE", "params": ["solusdt@bookTicker"], "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub method: SubscriptionMethod,
    pub params: Vec<String>,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionMethod {
    Subscribe,
    Unsubscribe,
}

/// Reply to a subscription request (`{"result": null, "id": 1}`)
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionResponse {
    pub result: Option<serde_json::Value>,
    pub id: u64,
}

/// Error reply to a request
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    #[serde(default)]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Combined-stream wrapper (`{"stream": "...", "data": {...}}`)
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    pub stream: String,
    pub data: serde_json::Value,
}

/// `<symbol>@bookTicker` payload
///
/// Prices and quantities arrive as decimal strings.
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerMessage {
    /// Order book update id
    #[serde(rename = "u", default)]
    pub update_id: Option<u64>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "B")]
    pub bid_qty: String,
    #[serde(rename = "a")]
    pub ask_price: String,
    #[serde(rename = "A")]
    pub ask_qty: String,
}

/// `<symbol>@depth<levels>` partial book payload
#[derive(Debug, Clone, Deserialize)]
pub struct PartialDepthMessage {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    /// `[price, quantity]` pairs, best first
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Any text frame the Binance stream sends
#[derive(Debug, Clone)]
pub enum BinanceMessage {
    BookTicker(BookTickerMessage),
    /// Depth snapshot with the symbol recovered from the stream name
    Depth {
        symbol: String,
        depth: PartialDepthMessage,
    },
    Ack(SubscriptionResponse),
    Error(ErrorResponse),
    /// Recognised JSON that carries nothing we consume
    Other(serde_json::Value),
}
