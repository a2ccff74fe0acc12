//! In-process priority publish/subscribe bus
//!
//! Producers call [`EventBus::publish`], which never blocks: events go into a
//! bounded priority queue ordered by `(priority, enqueue order)` and are
//! dropped (and counted) when the queue is full. A single dispatch task pops
//! the next event and runs every handler subscribed to its kind concurrently,
//! waiting for all of them before taking the next event. Handler failures are
//! logged and never reach siblings or the dispatch loop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event::{Event, EventKind, EventPayload};
use crate::common::errors::Result;
use crate::common::latency::{LatencySummary, LatencyWindow};
use crate::config::types::BusConfig;

/// Identifier returned by [`EventBus::subscribe`]
pub type SubscriptionId = u64;

/// Consumer of bus events.
///
/// Handlers run on the Tokio runtime and must not block; long work belongs in
/// a spawned task. An `Err` is logged by the bus and otherwise ignored.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, event: Arc<Event>) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`]
struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        (self.f)(event).await
    }
}

struct Registered {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

struct Queued {
    priority: u8,
    seq: u64,
    enqueued_at: Instant,
    event: Event,
}

// BinaryHeap is a max-heap: the "greatest" entry is the lowest (priority, seq).
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

struct Timings {
    queue_wait: LatencyWindow,
    processing: LatencyWindow,
}

struct BusInner {
    handlers: RwLock<HashMap<EventKind, Vec<Registered>>>,
    queue: Mutex<BinaryHeap<Queued>>,
    capacity: usize,
    notify: Notify,
    next_seq: AtomicU64,
    next_subscription: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    timings: Mutex<Timings>,
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Snapshot returned by [`EventBus::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub events_processed: u64,
    pub events_dropped: u64,
    pub queue_depth: usize,
    /// Time between publish and dispatch
    pub queue_latency: Option<LatencySummary>,
    /// Time spent running all handlers of an event
    pub processing_time: Option<LatencySummary>,
}

/// Priority publish/subscribe hub.
///
/// Construct one at startup and share it (`Arc<EventBus>`) with producers and
/// consumers.
pub struct EventBus {
    inner: Arc<BusInner>,
    worker: Mutex<Option<Worker>>,
    stop_grace: Duration,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                capacity: config.max_queue_size.max(1),
                notify: Notify::new(),
                next_seq: AtomicU64::new(0),
                next_subscription: AtomicU64::new(1),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                timings: Mutex::new(Timings {
                    queue_wait: LatencyWindow::new(config.stats_window),
                    processing: LatencyWindow::new(config.stats_window),
                }),
            }),
            worker: Mutex::new(None),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        }
    }

    /// Bus with a custom queue capacity and default settings otherwise
    pub fn with_capacity(max_queue_size: usize) -> Self {
        Self::new(BusConfig {
            max_queue_size,
            ..BusConfig::default()
        })
    }

    /// Register a handler for one event kind.
    ///
    /// Handlers of the same kind are started in registration order and run
    /// concurrently; no ordering is implied across kinds.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(handler = handler.name(), %kind, id, "Subscribed handler");
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Registered { id, handler });
        id
    }

    /// Register an async closure as a handler
    pub fn subscribe_fn<F, Fut>(&self, kind: EventKind, name: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(
            kind,
            Arc::new(FnHandler {
                name: name.into(),
                f,
            }),
        )
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if removed {
            debug!(%kind, id, "Unsubscribed handler");
        }
        removed
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Enqueue an event without blocking.
    ///
    /// Returns `false` when the queue was full and the event was dropped.
    pub fn publish(&self, event: Event) -> bool {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            drop(queue);
            self.inner.dropped.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(kind = %event.kind(), source = %event.source, "Event queue full, dropping event");
            return false;
        }

        let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        queue.push(Queued {
            priority: event.priority,
            seq,
            enqueued_at: Instant::now(),
            event,
        });
        drop(queue);

        self.inner.notify.notify_one();
        true
    }

    /// Build and publish an event with the payload's default priority
    pub fn publish_payload(&self, source: &str, payload: EventPayload) -> bool {
        self.publish(Event::new(source, payload))
    }

    /// Start the dispatch loop; no-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatch_loop(self.inner.clone(), shutdown_rx));
        *worker = Some(Worker { handle, shutdown });
        info!("Event bus started");
    }

    /// Stop the dispatch loop.
    ///
    /// The event being dispatched is allowed to finish within the configured
    /// grace period; after that the loop is aborted. Queued events stay queued.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some(Worker { handle, shutdown }) = worker else {
            return;
        };

        let _ = shutdown.send(true);
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.stop_grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!("Event bus dispatch loop panicked: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(grace_ms = self.stop_grace.as_millis() as u64, "Dispatch loop did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("Event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Current queue length
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn stats(&self) -> BusStats {
        let timings = self.inner.timings.lock();
        BusStats {
            events_processed: self.inner.processed.load(AtomicOrdering::Relaxed),
            events_dropped: self.inner.dropped.load(AtomicOrdering::Relaxed),
            queue_depth: self.queue_depth(),
            queue_latency: timings.queue_wait.summary(),
            processing_time: timings.processing.summary(),
        }
    }
}

async fn dispatch_loop(inner: Arc<BusInner>, mut shutdown: watch::Receiver<bool>) {
    debug!("Event bus dispatch loop running");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = inner.queue.lock().pop();
        match next {
            Some(queued) => inner.dispatch(queued).await,
            None => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Event bus dispatch loop exited");
}

impl BusInner {
    async fn dispatch(&self, queued: Queued) {
        let queue_wait = queued.enqueued_at.elapsed();
        let event = Arc::new(queued.event);
        let kind = event.kind();

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default();

        let started = Instant::now();
        if handlers.is_empty() {
            debug!(%kind, "No handlers for event");
        } else {
            // One task per handler so a panic stays inside that handler.
            let tasks = handlers.iter().map(|handler| {
                let handler = handler.clone();
                let event = event.clone();
                tokio::spawn(async move { handler.handle(event).await })
            });
            let results = join_all(tasks).await;

            for (handler, result) in handlers.iter().zip(results) {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(handler = handler.name(), %kind, error = %e, "Event handler failed");
                    }
                    Err(e) => {
                        error!(handler = handler.name(), %kind, error = %e, "Event handler panicked");
                    }
                }
            }
        }

        let processing = started.elapsed();
        self.processed.fetch_add(1, AtomicOrdering::Relaxed);
        let mut timings = self.timings.lock();
        timings.queue_wait.record(queue_wait);
        timings.processing.record(processing);
    }
}
