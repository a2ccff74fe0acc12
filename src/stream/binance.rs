//! Binance spot market-data handler
//!
//! Subscribes to `<symbol>@bookTicker` (and optionally partial depth) over the
//! raw `/ws` endpoint using live `SUBSCRIBE` requests, so the symbol set can
//! change without reconnecting. The full set is re-requested after every
//! connect.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::client::{Outbound, StreamHandler};
use super::messages::*;
use crate::bus::EventPayload;
use crate::common::errors::{EngineError, Result};
use crate::common::types::{OrderBookUpdate, PriceLevel, PriceUpdate};

/// Venue name stamped on Binance quotes
pub const VENUE: &str = "binance";

const BOOK_TICKER: &str = "bookTicker";

/// [`StreamHandler`] for Binance book-ticker and depth streams
pub struct BinanceBookTicker {
    /// Upper-case symbols currently wanted
    symbols: RwLock<BTreeSet<String>>,
    /// Stream suffixes per symbol, e.g. `bookTicker`, `depth5@100ms`
    channels: Vec<String>,
    next_request_id: AtomicU64,
    requests_tx: mpsc::UnboundedSender<SubscriptionRequest>,
    requests_rx: Mutex<mpsc::UnboundedReceiver<SubscriptionRequest>>,
}

impl BinanceBookTicker {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            symbols: RwLock::new(symbols.into_iter().map(|s| normalize(s.as_ref())).collect()),
            channels: vec![BOOK_TICKER.to_string()],
            next_request_id: AtomicU64::new(1),
            requests_tx,
            requests_rx: Mutex::new(requests_rx),
        }
    }

    /// Also stream the top `levels` of the book (5, 10 or 20)
    pub fn with_depth(mut self, levels: u8) -> Self {
        self.channels.push(format!("depth{}@100ms", levels));
        self
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().iter().cloned().collect()
    }

    /// Add symbols. Takes effect immediately when connected, otherwise on the
    /// next connect. Returns how many were new.
    pub fn subscribe<S: AsRef<str>>(&self, symbols: &[S]) -> usize {
        let added: Vec<String> = {
            let mut current = self.symbols.write();
            symbols
                .iter()
                .map(|s| normalize(s.as_ref()))
                .filter(|s| current.insert(s.clone()))
                .collect()
        };
        self.queue(SubscriptionMethod::Subscribe, &added);
        added.len()
    }

    /// Drop symbols. Returns how many were subscribed.
    pub fn unsubscribe<S: AsRef<str>>(&self, symbols: &[S]) -> usize {
        let removed: Vec<String> = {
            let mut current = self.symbols.write();
            symbols
                .iter()
                .map(|s| normalize(s.as_ref()))
                .filter(|s| current.remove(s))
                .collect()
        };
        self.queue(SubscriptionMethod::Unsubscribe, &removed);
        removed.len()
    }

    fn queue(&self, method: SubscriptionMethod, symbols: &[String]) {
        if symbols.is_empty() {
            return;
        }
        let request = self.request(method, symbols);
        // the receiver lives as long as self
        let _ = self.requests_tx.send(request);
    }

    fn request(&self, method: SubscriptionMethod, symbols: &[String]) -> SubscriptionRequest {
        SubscriptionRequest {
            method,
            params: self.stream_names(symbols),
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// `solusdt@bookTicker`-style stream names for `symbols`
    pub fn stream_names(&self, symbols: &[String]) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|symbol| {
                let lower = symbol.to_lowercase();
                self.channels
                    .iter()
                    .map(move |channel| format!("{}@{}", lower, channel))
            })
            .collect()
    }

    /// Classify a raw text frame
    pub fn parse_message(text: &str) -> Result<BinanceMessage> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        if value.get("error").is_some() {
            return Ok(BinanceMessage::Error(serde_json::from_value(value)?));
        }
        if value.get("result").is_some() && value.get("id").is_some() {
            return Ok(BinanceMessage::Ack(serde_json::from_value(value)?));
        }

        let (stream, data) = if value.get("stream").is_some() && value.get("data").is_some() {
            let envelope: StreamEnvelope = serde_json::from_value(value)?;
            (Some(envelope.stream), envelope.data)
        } else {
            (None, value)
        };

        // 24hr tickers also carry s/b/a but are tagged with an event type
        let is_book_ticker = data.get("e").is_none()
            && data.get("s").is_some()
            && data.get("b").is_some()
            && data.get("a").is_some();
        if is_book_ticker {
            return Ok(BinanceMessage::BookTicker(serde_json::from_value(data)?));
        }

        if data.get("bids").is_some() && data.get("asks").is_some() {
            let symbol = stream
                .as_deref()
                .and_then(|s| s.split('@').next())
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase)
                .ok_or_else(|| EngineError::Decode("depth update without stream name".to_string()))?;
            return Ok(BinanceMessage::Depth {
                symbol,
                depth: serde_json::from_value(data)?,
            });
        }

        Ok(BinanceMessage::Other(data))
    }
}

#[async_trait]
impl StreamHandler for BinanceBookTicker {
    async fn on_connect(&self, outbound: &Outbound) -> Result<()> {
        // Requests queued while offline are superseded by the full resubscribe
        {
            let mut pending = self.requests_rx.lock().await;
            while pending.try_recv().is_ok() {}
        }

        let symbols = self.symbols();
        if symbols.is_empty() {
            return Ok(());
        }
        let request = self.request(SubscriptionMethod::Subscribe, &symbols);
        info!(streams = ?request.params, "Subscribing to Binance streams");
        outbound.send_text(serde_json::to_string(&request)?).await
    }

    fn decode(&self, text: &str) -> Result<Vec<EventPayload>> {
        match Self::parse_message(text)? {
            BinanceMessage::BookTicker(ticker) => {
                Ok(vec![EventPayload::PriceUpdate(price_update(ticker)?)])
            }
            BinanceMessage::Depth { symbol, depth } => {
                Ok(vec![EventPayload::OrderbookUpdate(book_update(symbol, depth)?)])
            }
            BinanceMessage::Ack(ack) => {
                debug!(id = ack.id, "Subscription acknowledged");
                Ok(Vec::new())
            }
            BinanceMessage::Error(e) => Err(EngineError::Decode(format!(
                "Binance error {}: {}",
                e.error.code, e.error.msg
            ))),
            BinanceMessage::Other(_) => Ok(Vec::new()),
        }
    }

    async fn maintain(&self, outbound: Outbound) -> Result<()> {
        let mut requests = self.requests_rx.lock().await;
        while let Some(request) = requests.recv().await {
            debug!(method = ?request.method, streams = ?request.params, "Updating subscriptions");
            outbound.send_text(serde_json::to_string(&request)?).await?;
        }
        Ok(())
    }
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

fn decimal(field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| EngineError::Decode(format!("{} {:?}: {}", field, raw, e)))
}

fn price_update(ticker: BookTickerMessage) -> Result<PriceUpdate> {
    Ok(PriceUpdate {
        venue: VENUE.to_string(),
        bid: decimal("bid", &ticker.bid_price)?,
        ask: decimal("ask", &ticker.ask_price)?,
        bid_size: Some(decimal("bid qty", &ticker.bid_qty)?),
        ask_size: Some(decimal("ask qty", &ticker.ask_qty)?),
        symbol: ticker.symbol,
        timestamp: Utc::now(),
    })
}

fn levels(side: &str, raw: &[[String; 2]]) -> Result<Vec<PriceLevel>> {
    raw.iter()
        .map(|[price, size]| Ok(PriceLevel::new(decimal(side, price)?, decimal(side, size)?)))
        .collect()
}

fn book_update(symbol: String, depth: PartialDepthMessage) -> Result<OrderBookUpdate> {
    Ok(OrderBookUpdate {
        venue: VENUE.to_string(),
        symbol,
        bids: levels("bid", &depth.bids)?,
        asks: levels("ask", &depth.asks)?,
        timestamp: Utc::now(),
        is_snapshot: true,
        sequence: depth.last_update_id,
    })
}
