//! Ordered intake buffer between producer callers and the background writer.
//!
//! Multi-producer, single-consumer: any number of threads may `enqueue`;
//! only the flusher drains. Enqueue never surfaces an error to the caller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;

use crate::metrics::IntakeMetrics;

/// What to do with a new record when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the incoming record and count it as dropped.
    Reject,
    /// Evict the oldest buffered record to make room.
    DropOldest,
}

/// FIFO record buffer. Unbounded by default; an optional capacity with an
/// explicit overflow policy is available as an operational hardening knob.
pub struct IntakeQueue {
    inner: Mutex<VecDeque<Bytes>>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    metrics: Arc<IntakeMetrics>,
}

impl IntakeQueue {
    /// Creates an unbounded queue.
    pub fn new(metrics: Arc<IntakeMetrics>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: None,
            overflow: OverflowPolicy::Reject,
            metrics,
        }
    }

    /// Creates a queue bounded at `capacity` records.
    pub fn bounded(capacity: usize, overflow: OverflowPolicy, metrics: Arc<IntakeMetrics>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Some(capacity),
            overflow,
            metrics,
        }
    }

    // A poisoned lock only means another producer panicked mid-push; the
    // queue contents are still a valid VecDeque, so recover rather than
    // propagate — enqueue has no error channel to the producer.
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a record at the tail.
    ///
    /// Never returns an error to the producer. When the queue is bounded and
    /// full, the overflow policy decides which record is discarded; the drop
    /// is logged and counted.
    pub fn enqueue(&self, record: Bytes) {
        let start = Instant::now();
        let depth = {
            let mut queue = self.lock();
            if let Some(capacity) = self.capacity {
                if queue.len() >= capacity {
                    match self.overflow {
                        OverflowPolicy::Reject => {
                            tracing::warn!(capacity, "intake queue full, rejecting record");
                            self.metrics.record_drop();
                            self.metrics.set_depth(queue.len() as u64);
                            return;
                        }
                        OverflowPolicy::DropOldest => {
                            tracing::warn!(capacity, "intake queue full, evicting oldest record");
                            queue.pop_front();
                            self.metrics.record_drop();
                        }
                    }
                }
            }
            queue.push_back(record);
            queue.len() as u64
        };
        self.metrics
            .record_enqueue(depth, start.elapsed().as_micros() as u64);
    }

    /// Removes and returns up to `max` records from the head, preserving
    /// arrival order. Returns fewer (possibly none) if the queue is shorter.
    pub fn drain(&self, max: usize) -> Vec<Bytes> {
        let mut queue = self.lock();
        let take = max.min(queue.len());
        let batch: Vec<Bytes> = queue.drain(..take).collect();
        self.metrics.set_depth(queue.len() as u64);
        batch
    }

    /// Appends a failed batch back onto the tail, intact and in order.
    ///
    /// Known ordering caveat: records that arrived while the batch was being
    /// retried now sit ahead of it, so requeued records can be written out of
    /// their original relative order. Downstream ordering sensitivity is
    /// unspecified, so this is documented rather than reordered away.
    pub fn requeue(&self, batch: Vec<Bytes>) {
        let mut queue = self.lock();
        queue.extend(batch);
        self.metrics.set_depth(queue.len() as u64);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
