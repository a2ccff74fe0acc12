//! Rolling latency window
//!
//! Keeps the last N duration samples and summarises them. Used by the event
//! bus (queue wait and handler time) and by stream clients (per-message
//! processing time).

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Default number of samples retained
pub const DEFAULT_WINDOW: usize = 1000;

/// Fixed-capacity window of the most recent latency samples
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LatencyWindow {
    /// Create a window holding at most `capacity` samples (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample, evicting the oldest when full
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Summarise the window; `None` when no samples were recorded
    pub fn summary(&self) -> Option<LatencySummary> {
        let min = *self.samples.iter().min()?;
        let max = *self.samples.iter().max()?;
        let total: Duration = self.samples.iter().sum();
        let avg = total / self.samples.len() as u32;

        Some(LatencySummary {
            samples: self.samples.len(),
            min_ms: millis(min),
            avg_ms: millis(avg),
            max_ms: millis(max),
        })
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Min/avg/max over a latency window, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples, min {:.3} ms, avg {:.3} ms, max {:.3} ms",
            self.samples, self.min_ms, self.avg_ms, self.max_ms
        )
    }
}
