//! Stream client counters

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::common::latency::{LatencySummary, LatencyWindow};
use crate::common::types::ConnectionStatus;

/// Point-in-time view of a stream client's health
#[derive(Debug, Clone, Serialize)]
pub struct StreamMetrics {
    pub name: String,
    pub status: ConnectionStatus,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub errors: u64,
    pub reconnects: u64,
    /// Time since the current connection was established; zero while disconnected
    pub uptime: Duration,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Per-message decode and publish time
    pub processing_latency: Option<LatencySummary>,
}

impl StreamMetrics {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[derive(Debug, Default)]
struct Counters {
    messages_received: u64,
    messages_processed: u64,
    errors: u64,
    reconnects: u64,
    connected_since: Option<Instant>,
    last_message_at: Option<DateTime<Utc>>,
    latencies: LatencyWindow,
}

/// Shared, lock-protected counters updated by the connection task
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    inner: Mutex<Counters>,
}

impl MetricsRecorder {
    pub fn message_received(&self) {
        let mut c = self.inner.lock();
        c.messages_received += 1;
        c.last_message_at = Some(Utc::now());
    }

    pub fn message_processed(&self, elapsed: Duration) {
        let mut c = self.inner.lock();
        c.messages_processed += 1;
        c.latencies.record(elapsed);
    }

    pub fn error(&self) {
        self.inner.lock().errors += 1;
    }

    pub fn reconnect(&self) {
        self.inner.lock().reconnects += 1;
    }

    pub fn connected(&self) {
        self.inner.lock().connected_since = Some(Instant::now());
    }

    pub fn disconnected(&self) {
        self.inner.lock().connected_since = None;
    }

    pub fn snapshot(&self, name: &str, status: ConnectionStatus) -> StreamMetrics {
        let c = self.inner.lock();
        StreamMetrics {
            name: name.to_string(),
            status,
            messages_received: c.messages_received,
            messages_processed: c.messages_processed,
            errors: c.errors,
            reconnects: c.reconnects,
            uptime: c
                .connected_since
                .map(|since| since.elapsed())
                .unwrap_or_default(),
            last_message_at: c.last_message_at,
            processing_latency: c.latencies.summary(),
        }
    }
}
