//! Bounded buffers holding reported data between flushes.
//!
//! Both buffers evict their oldest entry when full. Every eviction is counted
//! so the loss surfaces in self-monitoring as `buffer.overflow.count`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::warn;

/// Encoded metric lines awaiting the next flush.
pub type MetricBuffer = PendingBuffer<String>;

/// Log-ingest records (events and raw log lines) awaiting the next flush.
pub type EventQueue = PendingBuffer<Value>;

/// A thread-safe FIFO with a fixed capacity that drops its oldest entries.
#[derive(Debug)]
pub struct PendingBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Evictions since the last [`take_overflow`](Self::take_overflow).
    overflow: AtomicU64,
    /// Evictions over the buffer's lifetime.
    overflow_total: AtomicU64,
}

impl<T> PendingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            overflow: AtomicU64::new(0),
            overflow_total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_evictions(&self, dropped: u64) {
        if dropped == 0 {
            return;
        }
        self.overflow.fetch_add(dropped, Ordering::Relaxed);
        let total = self.overflow_total.fetch_add(dropped, Ordering::Relaxed) + dropped;
        // One warning per thousand evictions keeps a saturated buffer from flooding the log.
        if total / 1000 != (total - dropped) / 1000 || total == dropped {
            warn!(dropped, total, capacity = self.capacity, "pending buffer full, dropped oldest entries");
        }
    }

    /// Append one entry, evicting the oldest if the buffer is full.
    pub fn push(&self, item: T) {
        let mut items = self.lock();
        let mut dropped = 0;
        if items.len() >= self.capacity {
            items.pop_front();
            dropped += 1;
        }
        items.push_back(item);
        drop(items);
        self.record_evictions(dropped);
    }

    /// Append several entries in order, evicting the oldest as needed.
    pub fn extend(&self, batch: impl IntoIterator<Item = T>) {
        let mut items = self.lock();
        let mut dropped = 0;
        for item in batch {
            if items.len() >= self.capacity {
                items.pop_front();
                dropped += 1;
            }
            items.push_back(item);
        }
        drop(items);
        self.record_evictions(dropped);
    }

    /// Put entries back at the head of the buffer, ahead of anything reported
    /// since they were drained. If the result exceeds capacity, the oldest
    /// entries (the requeued ones first) are dropped.
    pub fn requeue_front(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let mut items = self.lock();
        for item in batch.into_iter().rev() {
            items.push_front(item);
        }
        let mut dropped = 0;
        while items.len() > self.capacity {
            items.pop_front();
            dropped += 1;
        }
        drop(items);
        self.record_evictions(dropped);
    }

    /// Take every pending entry, leaving the buffer empty.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Evictions since the previous call. Resets the interval counter.
    pub fn take_overflow(&self) -> u64 {
        self.overflow.swap(0, Ordering::Relaxed)
    }

    /// Evictions over the buffer's lifetime.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_total.load(Ordering::Relaxed)
    }
}
