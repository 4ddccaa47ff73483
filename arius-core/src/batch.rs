//! Greedy size/count batching between a queue and a bulk-transfer stage.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Anything whose transfer size counts against a batch.
pub trait Weighed {
    fn weight(&self) -> u64;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_bytes: u64,
    pub max_count: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self { max_bytes: 64 * 1024 * 1024, max_count: 256 }
    }
}

/// Batches are cut in arrival order, never reordered. An item larger than
/// `max_bytes` travels alone.
pub struct Batcher<T> {
    limits: BatchLimits,
    current: Vec<T>,
    bytes: u64,
}

impl<T: Weighed> Batcher<T> {
    pub fn new(limits: BatchLimits) -> Self {
        Self { limits, current: Vec::new(), bytes: 0 }
    }

    /// Add an item; returns any batches that are now closed.
    pub fn push(&mut self, item: T) -> Vec<Vec<T>> {
        let mut closed = Vec::new();
        let w = item.weight();
        if !self.current.is_empty() && self.bytes + w > self.limits.max_bytes {
            closed.extend(self.flush());
        }
        self.bytes += w;
        self.current.push(item);
        if self.current.len() >= self.limits.max_count.max(1) || self.bytes >= self.limits.max_bytes {
            closed.extend(self.flush());
        }
        closed
    }

    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.current.is_empty() {
            return None;
        }
        self.bytes = 0;
        Some(std::mem::take(&mut self.current))
    }
}

/// Drain `rx` until every sender is gone, forwarding closed batches to `tx`.
pub fn run_batcher<T: Weighed>(rx: Receiver<T>, tx: Sender<Vec<T>>, limits: BatchLimits, label: &str) {
    let mut batcher = Batcher::new(limits);
    let mut batches = 0usize;
    for item in rx.iter() {
        for batch in batcher.push(item) {
            batches += 1;
            if tx.send(batch).is_err() {
                return;
            }
        }
    }
    if let Some(batch) = batcher.flush() {
        batches += 1;
        let _ = tx.send(batch);
    }
    debug!(stage = label, batches, "batcher drained");
}
