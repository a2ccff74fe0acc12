//! Integration tests for the resilient stream client
//!
//! A local tokio-tungstenite server plays the venue, so these run offline.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{binance_frames, spawn_server, spawn_silent_server, wait_until, Recorder};
use rust_decimal_macros::dec;
use spread_arb::bus::{EventBus, EventKind, EventPayload};
use spread_arb::common::types::ConnectionStatus;
use spread_arb::stream::{BinanceBookTicker, ResilientStreamClient, StreamOptions};
use spread_arb::EngineError;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn options(url: String) -> StreamOptions {
    let mut options = StreamOptions::new("TestWS", url);
    options.reconnect_delay = Duration::from_millis(50);
    options.backoff_min = Duration::from_millis(20);
    options.backoff_max = Duration::from_millis(100);
    options.close_timeout = Duration::from_millis(500);
    options
}

async fn recording_bus(kinds: &[EventKind]) -> (Arc<EventBus>, Arc<Recorder>) {
    let bus = Arc::new(EventBus::with_capacity(1024));
    let recorder = Recorder::new();
    for kind in kinds {
        bus.subscribe(*kind, recorder.clone());
    }
    bus.start().await;
    (bus, recorder)
}

#[test_log::test(tokio::test)]
async fn test_connect_subscribe_and_publish_prices() {
    let mut server = spawn_server(
        vec![
            binance_frames::SUBSCRIBE_ACK.to_string(),
            binance_frames::BOOK_TICKER.to_string(),
        ],
        false,
    )
    .await;
    let (bus, recorder) = recording_bus(&[EventKind::Connected, EventKind::PriceUpdate]).await;

    let handler = Arc::new(BinanceBookTicker::new(["bnbusdt"]));
    let client = ResilientStreamClient::new(options(server.url()), handler, bus.clone());
    client.start().await;

    let subscribe = timeout(WAIT, server.received.recv()).await.unwrap().unwrap();
    let subscribe: serde_json::Value = serde_json::from_str(&subscribe).unwrap();
    assert_eq!(subscribe["method"], "SUBSCRIBE");
    assert_eq!(subscribe["params"][0], "bnbusdt@bookTicker");

    assert!(wait_until(WAIT, || recorder.count(EventKind::PriceUpdate) == 1).await);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    let events = recorder.events();
    let price = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::PriceUpdate(update) => Some(update.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(price.venue, "binance");
    assert_eq!(price.symbol, "BNBUSDT");
    assert_eq!(price.bid, dec!(25.35190000));
    assert_eq!(price.ask_size, Some(dec!(40.66)));

    let metrics = client.metrics();
    assert!(metrics.is_connected());
    assert_eq!(metrics.messages_received, 2);
    assert!(metrics.last_message_at.is_some());

    client.stop().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    bus.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_reconnects_after_server_close() {
    let mut server = spawn_server(vec![binance_frames::BOOK_TICKER.to_string()], true).await;
    let (bus, recorder) = recording_bus(&[
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::PriceUpdate,
    ])
    .await;

    let handler = Arc::new(BinanceBookTicker::new(["BNBUSDT"]));
    let client = ResilientStreamClient::new(options(server.url()), handler, bus.clone());
    client.start().await;

    assert!(
        wait_until(WAIT, || recorder.count(EventKind::Connected) >= 2).await,
        "client did not reconnect"
    );
    assert!(recorder.count(EventKind::Disconnected) >= 1);
    assert!(wait_until(WAIT, || recorder.count(EventKind::PriceUpdate) >= 2).await);

    // the full subscription is replayed on the new connection
    for _ in 0..2 {
        let frame = timeout(WAIT, server.received.recv()).await.unwrap().unwrap();
        assert!(frame.contains("bnbusdt@bookTicker"));
    }

    let disconnect = recorder
        .events()
        .into_iter()
        .find(|e| e.kind() == EventKind::Disconnected)
        .unwrap();
    if let EventPayload::Disconnected(notice) = &disconnect.payload {
        assert_eq!(notice.client, "TestWS");
        assert!(notice.reason.is_some());
    }
    assert!(client.metrics().reconnects >= 1);

    client.stop().await;
    bus.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_send_and_runtime_subscription() {
    let mut server = spawn_server(Vec::new(), false).await;
    let (bus, recorder) = recording_bus(&[EventKind::Connected]).await;

    let handler = Arc::new(BinanceBookTicker::new(["SOLUSDT"]));
    let client = ResilientStreamClient::new(options(server.url()), handler.clone(), bus.clone());

    let err = client.send("early").await.unwrap_err();
    assert!(matches!(err, EngineError::NotConnected(_)));

    client.start().await;
    assert!(wait_until(WAIT, || client.is_connected()).await);
    assert!(wait_until(WAIT, || recorder.count(EventKind::Connected) == 1).await);
    let _initial = timeout(WAIT, server.received.recv()).await.unwrap().unwrap();

    client.send(r#"{"method":"LIST_SUBSCRIPTIONS","id":9}"#).await.unwrap();
    let frame = timeout(WAIT, server.received.recv()).await.unwrap().unwrap();
    assert!(frame.contains("LIST_SUBSCRIPTIONS"));

    assert_eq!(handler.subscribe(&["ethusdt"]), 1);
    let frame = timeout(WAIT, server.received.recv()).await.unwrap().unwrap();
    let request: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(request["method"], "SUBSCRIBE");
    assert_eq!(request["params"][0], "ethusdt@bookTicker");

    client.stop().await;
    bus.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_undecodable_frame_is_reported_and_skipped() {
    let server = spawn_server(
        vec![
            binance_frames::GARBAGE.to_string(),
            binance_frames::COMBINED_BOOK_TICKER.to_string(),
        ],
        false,
    )
    .await;
    let (bus, recorder) = recording_bus(&[EventKind::Error, EventKind::PriceUpdate]).await;

    let handler = Arc::new(BinanceBookTicker::new(["SOLUSDT"]));
    let client = ResilientStreamClient::new(options(server.url()), handler, bus.clone());
    client.start().await;

    assert!(wait_until(WAIT, || recorder.count(EventKind::PriceUpdate) == 1).await);
    assert_eq!(recorder.count(EventKind::Error), 1);
    assert_eq!(client.metrics().errors, 1);
    assert!(client.is_connected());

    client.stop().await;
    bus.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_unreachable_venue_keeps_retrying_until_stopped() {
    // bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (bus, recorder) = recording_bus(&[EventKind::Connected]).await;
    let handler = Arc::new(BinanceBookTicker::new(["SOLUSDT"]));
    let client = ResilientStreamClient::new(options(format!("ws://{}", addr)), handler, bus.clone());
    client.start().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.is_connected());
    assert_eq!(recorder.count(EventKind::Connected), 0);

    timeout(WAIT, client.stop()).await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    bus.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_unanswered_keepalive_forces_reconnect() {
    let url = spawn_silent_server().await;
    let (bus, recorder) = recording_bus(&[EventKind::Connected, EventKind::Disconnected]).await;

    let mut options = options(url);
    options.ping_interval = Duration::from_millis(50);
    options.ping_timeout = Duration::from_millis(50);
    let handler = Arc::new(BinanceBookTicker::new(["SOLUSDT"]));
    let client = ResilientStreamClient::new(options, handler, bus.clone());
    client.start().await;

    assert!(
        wait_until(WAIT, || recorder.count(EventKind::Connected) >= 2).await,
        "client did not reconnect after the keepalive timed out"
    );

    let reason = recorder
        .events()
        .into_iter()
        .find_map(|e| match &e.payload {
            EventPayload::Disconnected(notice) => notice.reason.clone(),
            _ => None,
        })
        .unwrap();
    // pong and read deadlines coincide; either one ends the session
    assert!(
        reason.contains("pong not received") || reason.starts_with("no message for"),
        "unexpected reason: {}",
        reason
    );
    assert!(client.metrics().reconnects >= 1);

    client.stop().await;
    bus.stop().await;
}
