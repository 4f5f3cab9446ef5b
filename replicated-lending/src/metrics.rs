//! Dispatcher counters and the periodic snapshot logged by the background task.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::replication::{ReplicaState, ReplicationStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Operations the active store accepted.
    Processed,
    /// Business rejections and malformed requests.
    Rejected,
    /// Operations that hit an unavailable store or an internal error.
    Failed,
    /// Payloads written to a retry queue.
    Deferred,
    /// Submissions refused because a worker queue was full.
    Saturated,
    /// Grant callers that gave up waiting.
    Timeouts,
    /// Replays from the retry queues and inline grant retries.
    Retried,
}

#[derive(Debug, Default)]
pub struct Metrics {
    processed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    deferred: AtomicU64,
    saturated: AtomicU64,
    timeouts: AtomicU64,
    retried: AtomicU64,
}

impl Metrics {
    pub fn record(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Processed => &self.processed,
            Counter::Rejected => &self.rejected,
            Counter::Failed => &self.failed,
            Counter::Deferred => &self.deferred,
            Counter::Saturated => &self.saturated,
            Counter::Timeouts => &self.timeouts,
            Counter::Retried => &self.retried,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.get(Counter::Processed),
            rejected: self.get(Counter::Rejected),
            failed: self.get(Counter::Failed),
            deferred: self.get(Counter::Deferred),
            saturated: self.get(Counter::Saturated),
            timeouts: self.get(Counter::Timeouts),
            retried: self.get(Counter::Retried),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub deferred: u64,
    pub saturated: u64,
    pub timeouts: u64,
    pub retried: u64,
}

/// Everything the background task reports on each tick.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub grant_queue_depth: usize,
    pub async_queue_depth: usize,
    pub retry_queue_depth: usize,
    pub clock: u64,
    pub primary_active: bool,
    pub replica_state: ReplicaState,
    pub replication: ReplicationStats,
}
