//! Common test utilities and fixtures

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use spread_arb::bus::{Event, EventHandler, EventKind};
use spread_arb::common::types::Side;
use spread_arb::config::ExecutorConfig;
use spread_arb::execution::{LegSpec, TradeDecision};
use spread_arb::Result;

/// Handler that keeps every event it sees
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Arc<Event>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Arc<Event>> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn sources(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.source.clone()).collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Poll `condition` every 10ms until it holds or `limit` passes
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Fast executor settings for tests
pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_retries: 3,
        base_retry_delay_secs: 0.001,
        max_retry_delay_secs: 0.01,
        backoff_multiplier: 2.0,
        confirmation_timeout_secs: 0.2,
        confirmation_check_interval_secs: 0.01,
    }
}

/// Buy spot on Binance, sell the perp on Drift
pub fn sol_decision() -> TradeDecision {
    TradeDecision {
        pair: "SOL/USDC".to_string(),
        leg_a: LegSpec {
            symbol: "SOLUSDT".to_string(),
            side: Side::Buy,
            price: dec!(100),
        },
        leg_b: LegSpec {
            symbol: "SOL-PERP".to_string(),
            side: Side::Sell,
            price: dec!(100.5),
        },
        spread: dec!(0.005),
    }
}

/// Sample Binance frames
pub mod binance_frames {
    pub const BOOK_TICKER: &str = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;

    pub const COMBINED_BOOK_TICKER: &str = r#"{"stream":"solusdt@bookTicker","data":{"u":1,"s":"SOLUSDT","b":"100.10","B":"5","a":"100.20","A":"7"}}"#;

    pub const SUBSCRIBE_ACK: &str = r#"{"result":null,"id":1}"#;

    pub const GARBAGE: &str = "definitely not json";
}

/// Local WebSocket server standing in for a venue.
///
/// Every connection gets `frames` sent right away; when `close_first` is set
/// the first connection is then closed by the server. Text frames received
/// from clients are forwarded to `received`.
pub struct TestServer {
    pub addr: SocketAddr,
    pub received: mpsc::UnboundedReceiver<String>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

pub async fn spawn_server(frames: Vec<String>, close_first: bool) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, received) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut connection = 0u32;
        while let Ok((tcp, _)) = listener.accept().await {
            connection += 1;
            let frames = frames.clone();
            let tx = tx.clone();
            let close = close_first && connection == 1;

            tokio::spawn(async move {
                let Ok(ws) = accept_async(tcp).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();
                for frame in frames {
                    if write.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                if close {
                    let _ = write.send(Message::Close(None)).await;
                }
                while let Some(Ok(message)) = read.next().await {
                    if let Message::Text(text) = message {
                        let _ = tx.send(text);
                    }
                }
            });
        }
    });

    TestServer { addr, received }
}

/// Local WebSocket server that completes the handshake and then never reads,
/// so client pings go unanswered. Returns the `ws://` URL.
pub async fn spawn_silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(ws) = accept_async(tcp).await else {
                    return;
                };
                // hold the socket open without ever polling it
                let _ws = ws;
                std::future::pending::<()>().await;
            });
        }
    });

    format!("ws://{}", addr)
}
