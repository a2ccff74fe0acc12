//! Resilient WebSocket stream client
//!
//! A [`ResilientStreamClient`] owns one logical venue stream. A supervising
//! task keeps it connected for as long as the client runs:
//!
//! 1. connect, retrying a bounded number of times with exponential backoff
//! 2. publish `Connected`, let the handler (re)subscribe
//! 3. run the session: writer, keepalive pings, receiver and the handler's
//!    subscription maintenance, until any of them ends
//! 4. publish `Disconnected`, wait `reconnect_delay`, go back to 1
//!
//! Venue specifics live behind [`StreamHandler`]: what to send after every
//! connect and how to turn a text frame into bus payloads.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::metrics::{MetricsRecorder, StreamMetrics};
use crate::bus::{ConnectionNotice, ErrorNotice, Event, EventBus, EventPayload, PRIORITY_HIGH};
use crate::common::errors::{EngineError, Result};
use crate::common::types::ConnectionStatus;
use crate::config::StreamConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Queued outbound frames per connection
const OUTBOUND_CAPACITY: usize = 256;

/// Longest raw message echoed into a decode-failure log line
const RAW_LOG_LIMIT: usize = 200;

/// Connection tuning for a stream client
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Client name used as event source and in logs
    pub name: String,
    pub url: String,
    /// Pause between a disconnect and the next connect cycle
    pub reconnect_delay: Duration,
    /// Idle time between keepalive pings
    pub ping_interval: Duration,
    /// Time allowed for the pong
    pub ping_timeout: Duration,
    pub max_message_size: usize,
    /// Connect attempts per cycle
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    /// Backoff after the first failed attempt; doubles per attempt
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Deadline for the closing handshake
    pub close_timeout: Duration,
}

impl StreamOptions {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from(&StreamConfig {
            name: name.into(),
            url: url.into(),
            ..StreamConfig::default()
        })
    }

    /// Delay before connect attempt `attempt + 1`, `attempt` being 1-based
    pub fn connect_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_min.saturating_mul(factor).min(self.backoff_max)
    }

    /// Receive deadline: one ping cycle plus its pong allowance
    pub fn read_timeout(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

impl From<&StreamConfig> for StreamOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            ping_timeout: Duration::from_secs(config.ping_timeout_secs),
            max_message_size: config.max_message_size,
            connect_attempts: config.connect_attempts,
            connect_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
        }
    }
}

/// Write half of the current connection, handed to [`StreamHandler`]s
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    /// Outbound handle plus the receiving end the writer drains
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a text frame for the writer
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| EngineError::NotConnected("connection closed".to_string()))
    }
}

/// Venue-specific behaviour plugged into a [`ResilientStreamClient`]
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Called after every successful connect, before any message is read.
    /// Re-issue subscriptions here.
    async fn on_connect(&self, outbound: &Outbound) -> Result<()> {
        let _ = outbound;
        Ok(())
    }

    /// Decode one text frame into zero or more bus payloads
    fn decode(&self, text: &str) -> Result<Vec<EventPayload>>;

    /// Runs alongside the session for its whole lifetime. Returning ends the
    /// session and triggers a reconnect.
    async fn maintain(&self, outbound: Outbound) -> Result<()> {
        let _ = outbound;
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Why a session ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Closed(Option<String>),
    ReadTimeout(Duration),
    PongTimeout,
    MaintenanceEnded,
    Failed(EngineError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Shutdown => write!(f, "shutdown requested"),
            SessionEnd::Closed(Some(reason)) if !reason.is_empty() => {
                write!(f, "closed by peer: {}", reason)
            }
            SessionEnd::Closed(_) => write!(f, "closed by peer"),
            SessionEnd::ReadTimeout(after) => write!(f, "no message for {:?}", after),
            SessionEnd::PongTimeout => write!(f, "pong not received in time"),
            SessionEnd::MaintenanceEnded => write!(f, "subscription maintenance ended"),
            SessionEnd::Failed(e) => write!(f, "{}", e),
        }
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner<H> {
    options: StreamOptions,
    handler: Arc<H>,
    bus: Arc<EventBus>,
    status: RwLock<ConnectionStatus>,
    metrics: MetricsRecorder,
    outbound: Mutex<Option<Outbound>>,
}

/// Self-healing WebSocket client publishing decoded messages to the bus
pub struct ResilientStreamClient<H: StreamHandler> {
    inner: Arc<Inner<H>>,
    worker: Mutex<Option<Worker>>,
}

impl<H: StreamHandler> ResilientStreamClient<H> {
    pub fn new(options: StreamOptions, handler: Arc<H>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                handler,
                bus,
                status: RwLock::new(ConnectionStatus::Disconnected),
                metrics: MetricsRecorder::default(),
                outbound: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }

    /// Spawn the supervising task. No-op while it is already running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().map_or(false, |w| !w.handle.is_finished()) {
            debug!(client = %self.name(), "Stream client already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.inner.clone().supervise(shutdown_rx));
        *worker = Some(Worker { shutdown, handle });
    }

    /// Close the connection and stop reconnecting
    pub async fn stop(&self) {
        let Some(mut worker) = self.worker.lock().take() else {
            return;
        };

        let _ = worker.shutdown.send(true);
        let grace = self.inner.options.close_timeout + Duration::from_secs(1);
        if timeout(grace, &mut worker.handle).await.is_err() {
            warn!(client = %self.name(), "Stream task did not stop in time, aborting");
            worker.handle.abort();
        }

        *self.inner.outbound.lock() = None;
        self.inner.metrics.disconnected();
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.inner.metrics.snapshot(self.name(), self.status())
    }

    /// Send a text frame on the live connection
    ///
    /// # Errors
    /// [`EngineError::NotConnected`] when there is no live connection.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| EngineError::NotConnected(self.name().to_string()))?;
        outbound.send_text(text).await
    }
}

impl<H: StreamHandler> Inner<H> {
    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    fn notice(&self, reason: Option<String>) -> ConnectionNotice {
        ConnectionNotice {
            client: self.options.name.clone(),
            url: self.options.url.clone(),
            reason,
        }
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let name = self.options.name.as_str();
        info!(client = %name, url = %self.options.url, "Stream client starting");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_status(ConnectionStatus::Connecting);

            let connected = tokio::select! {
                result = self.connect_with_retry() => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(ws) => {
                    self.on_connected();
                    let end = self.run_session(ws, &mut shutdown).await;
                    self.on_disconnected(&end);
                    if matches!(end, SessionEnd::Shutdown) {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.error();
                    self.set_status(ConnectionStatus::Disconnected);
                    error!(client = %name, error = %e, "Connect attempts exhausted");
                }
            }

            self.metrics.reconnect();
            info!(
                client = %name,
                delay_ms = self.options.reconnect_delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::select! {
                _ = sleep(self.options.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        info!(client = %name, "Stream client stopped");
    }

    async fn connect_with_retry(&self) -> Result<WsStream> {
        let attempts = self.options.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connect_once().await {
                Ok(ws) => return Ok(ws),
                Err(e) if attempt < attempts => {
                    let delay = self.options.connect_backoff(attempt);
                    warn!(
                        client = %self.options.name,
                        attempt,
                        attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Connect attempt failed"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(&self) -> Result<WsStream> {
        let url = self.options.url.as_str();
        debug!(client = %self.options.name, %url, "Connecting");

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.options.max_message_size);

        let connect = connect_async_with_config(url, Some(ws_config), false);
        match timeout(self.options.connect_timeout, connect).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(EngineError::WebSocketConnection(e.to_string())),
            Err(_) => Err(EngineError::Timeout(format!("connecting to {}", url))),
        }
    }

    fn on_connected(&self) {
        self.set_status(ConnectionStatus::Connected);
        self.metrics.connected();
        info!(client = %self.options.name, url = %self.options.url, "WebSocket connection established");
        self.bus.publish(Event::new(
            self.options.name.as_str(),
            EventPayload::Connected(self.notice(None)),
        ));
    }

    fn on_disconnected(&self, end: &SessionEnd) {
        *self.outbound.lock() = None;
        self.metrics.disconnected();
        self.set_status(ConnectionStatus::Disconnected);

        match end {
            SessionEnd::Shutdown => info!(client = %self.options.name, "WebSocket closed"),
            SessionEnd::Failed(e) => {
                self.metrics.error();
                error!(client = %self.options.name, error = %e, "WebSocket error");
            }
            other => warn!(client = %self.options.name, reason = %other, "WebSocket disconnected"),
        }

        self.bus.publish(Event::new(
            self.options.name.as_str(),
            EventPayload::Disconnected(self.notice(Some(end.to_string()))),
        ));
    }

    async fn run_session(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let (outbound, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        *self.outbound.lock() = Some(outbound.clone());
        let pong = Notify::new();

        let end = match self.handler.on_connect(&outbound).await {
            Err(e) => SessionEnd::Failed(e),
            Ok(()) => {
                let writer = async {
                    while let Some(message) = rx.recv().await {
                        if let Err(e) = write.send(message).await {
                            return SessionEnd::Failed(e.into());
                        }
                    }
                    SessionEnd::Closed(None)
                };

                tokio::select! {
                    end = writer => end,
                    end = self.keepalive(&outbound, &pong) => end,
                    end = self.receive(&mut read, &pong) => end,
                    result = self.handler.maintain(outbound.clone()) => match result {
                        Ok(()) => SessionEnd::MaintenanceEnded,
                        Err(e) => SessionEnd::Failed(e),
                    },
                    _ = shutdown.changed() => SessionEnd::Shutdown,
                }
            }
        };

        *self.outbound.lock() = None;
        match timeout(self.options.close_timeout, write.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(client = %self.options.name, error = %e, "Close handshake failed"),
            Err(_) => debug!(client = %self.options.name, "Close handshake timed out"),
        }
        end
    }

    async fn keepalive(&self, outbound: &Outbound, pong: &Notify) -> SessionEnd {
        loop {
            sleep(self.options.ping_interval).await;

            // Register before sending so a fast pong is not missed
            let answered = pong.notified();
            if let Err(e) = outbound.send(Message::Ping(Vec::new())).await {
                return SessionEnd::Failed(e);
            }
            if timeout(self.options.ping_timeout, answered).await.is_err() {
                return SessionEnd::PongTimeout;
            }
            debug!(client = %self.options.name, "Ping answered");
        }
    }

    async fn receive(&self, read: &mut SplitStream<WsStream>, pong: &Notify) -> SessionEnd {
        let read_timeout = self.options.read_timeout();
        loop {
            let next = match timeout(read_timeout, read.next()).await {
                Ok(next) => next,
                Err(_) => return SessionEnd::ReadTimeout(read_timeout),
            };

            match next {
                Some(Ok(Message::Text(text))) => self.process(&text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => self.process(&text),
                    Err(e) => {
                        self.metrics.message_received();
                        self.decode_failed(
                            EngineError::Decode(format!("binary frame is not UTF-8: {}", e)),
                            "",
                        );
                    }
                },
                Some(Ok(Message::Pong(_))) => pong.notify_waiters(),
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the pong itself
                    debug!(client = %self.options.name, "Received ping");
                }
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Closed(frame.map(|f| f.reason.to_string()));
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return SessionEnd::Failed(e.into()),
                None => return SessionEnd::Closed(None),
            }
        }
    }

    fn process(&self, text: &str) {
        self.metrics.message_received();
        let started = Instant::now();

        match self.handler.decode(text) {
            Ok(payloads) => {
                for payload in payloads {
                    self.bus
                        .publish(Event::new(self.options.name.as_str(), payload));
                }
                self.metrics.message_processed(started.elapsed());
            }
            Err(e) => self.decode_failed(e, text),
        }
    }

    fn decode_failed(&self, error: EngineError, raw: &str) {
        self.metrics.error();
        let raw: String = raw.chars().take(RAW_LOG_LIMIT).collect();
        warn!(client = %self.options.name, error = %error, %raw, "Failed to decode message");

        let notice = ErrorNotice {
            client: self.options.name.clone(),
            error: error.to_string(),
        };
        self.bus.publish(
            Event::new(self.options.name.as_str(), EventPayload::Error(notice))
                .with_priority(PRIORITY_HIGH),
        );
    }
}
