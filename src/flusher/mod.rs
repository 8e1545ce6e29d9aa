//! Background pipeline: batch flusher, roll checker, shutdown coordinator.
//!
//! Two independent periodic tasks share the session manager's lock domain
//! and one shutdown signal. The flusher drains bounded batches from the
//! intake queue and drives writes with retry; the roll checker closes the
//! open session when the rolling policy says so.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::contracts::SegmentStore;
use crate::metrics::SinkMetrics;
use crate::queue::IntakeQueue;
use crate::session::{RollingPolicy, SessionManager};

/// Retry policy for failed batch writes.
///
/// The backoff is a pure function of the attempt number so retry timing is
/// testable without real delays; the flusher supplies the suspension via
/// `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure. Total attempts per
    /// batch = 1 + max_retries.
    pub max_retries: u32,
    /// Fixed backoff interval.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-based). Fixed backoff.
    pub fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Timing configuration for the background tasks.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub flush_interval: Duration,
    pub roll_interval: Duration,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub rolling: RollingPolicy,
    pub shutdown_timeout: Duration,
}

/// The background sink pipeline.
pub struct SinkPipeline<S: SegmentStore + 'static> {
    queue: Arc<IntakeQueue>,
    sessions: Arc<SessionManager<S>>,
    config: PipelineConfig,
    metrics: Arc<SinkMetrics>,
    shutdown: Arc<AtomicBool>,
    flush_notify: Arc<Notify>,
    shutdown_notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: SegmentStore + 'static> SinkPipeline<S> {
    pub fn new(
        queue: Arc<IntakeQueue>,
        sessions: Arc<SessionManager<S>>,
        config: PipelineConfig,
        metrics: Arc<SinkMetrics>,
    ) -> Self {
        Self {
            queue,
            sessions,
            config,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
            flush_notify: Arc::new(Notify::new()),
            shutdown_notify: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the flusher and roll checker tasks.
    pub fn start(&self) {
        self.shutdown.store(false, Ordering::SeqCst);

        let flusher = {
            let queue = Arc::clone(&self.queue);
            let sessions = Arc::clone(&self.sessions);
            let metrics = Arc::clone(&self.metrics);
            let shutdown = Arc::clone(&self.shutdown);
            let notify = Arc::clone(&self.flush_notify);
            let config = self.config.clone();
            tokio::spawn(async move {
                tracing::info!("batch flusher started");
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(config.flush_interval) => {},
                        _ = notify.notified() => {},
                    }
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let batch = queue.drain(config.batch_size);
                    if !batch.is_empty() {
                        Self::write_with_retry(&queue, &sessions, &config, &metrics, batch)
                            .await;
                    }
                }
                tracing::info!("batch flusher stopped");
            })
        };

        let roller = {
            let sessions = Arc::clone(&self.sessions);
            let shutdown = Arc::clone(&self.shutdown);
            let notify = Arc::clone(&self.shutdown_notify);
            let config = self.config.clone();
            tokio::spawn(async move {
                tracing::info!("roll checker started");
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(config.roll_interval) => {},
                        _ = notify.notified() => {},
                    }
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    sessions.check_roll(&config.rolling).await;
                }
                tracing::info!("roll checker stopped");
            })
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(flusher);
        tasks.push(roller);
    }

    /// Writes a batch with retry. On failure the session is closed, the
    /// retry interval elapses, and the entire original batch is retried on
    /// a fresh session. After exhaustion the whole batch goes back onto the
    /// queue tail, intact.
    async fn write_with_retry(
        queue: &IntakeQueue,
        sessions: &SessionManager<S>,
        config: &PipelineConfig,
        metrics: &SinkMetrics,
        batch: Vec<Bytes>,
    ) {
        let start = Instant::now();
        let total_attempts = 1 + config.retry.max_retries;

        for attempt in 1..=total_attempts {
            match sessions.write_batch(&batch).await {
                Ok(()) => {
                    metrics
                        .write
                        .record_batch_written(start.elapsed().as_micros() as u64);
                    tracing::debug!(
                        records = batch.len(),
                        attempt,
                        elapsed = ?start.elapsed(),
                        "batch written"
                    );
                    return;
                }
                Err(e) => {
                    let abandoned = (batch.len() - e.rows_written) as u64;
                    metrics.write.record_attempt_failed(abandoned);
                    tracing::warn!(
                        records = batch.len(),
                        rows_written = e.rows_written,
                        attempt,
                        total_attempts,
                        error = %e.source,
                        "batch write attempt failed"
                    );
                    // Rows already written stay committed; the retry starts
                    // a fresh session and rewrites the whole batch.
                    sessions.close().await;
                    if attempt < total_attempts {
                        tokio::time::sleep(config.retry.delay(attempt)).await;
                    }
                }
            }
        }

        tracing::error!(
            records = batch.len(),
            total_attempts,
            "batch write retries exhausted, requeueing"
        );
        metrics.write.record_requeue(batch.len() as u64);
        queue.requeue(batch);
    }

    /// Synchronously flushes everything currently in the queue.
    ///
    /// Processes a bounded number of batches (one pass over the current
    /// depth), so a failing store cannot trap the caller in a requeue loop:
    /// each buffered record is attempted at least once.
    pub async fn flush_now(&self) {
        let depth = self.queue.len();
        let batches = depth.div_ceil(self.config.batch_size);
        for _ in 0..batches {
            let batch = self.queue.drain(self.config.batch_size);
            if batch.is_empty() {
                break;
            }
            Self::write_with_retry(&self.queue, &self.sessions, &self.config, &self.metrics, batch)
                .await;
        }
    }

    /// Graceful shutdown: stop scheduling new cycles, run one final flush,
    /// close any open session, then wait (bounded) for the tasks to finish.
    pub async fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        // notify_waiters wakes tasks already parked in select; notify_one
        // leaves a permit for a task that has not reached its wait point yet.
        self.flush_notify.notify_waiters();
        self.flush_notify.notify_one();
        self.shutdown_notify.notify_waiters();
        self.shutdown_notify.notify_one();

        // Join the tasks first so no batch lands after the final flush.
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(self.config.shutdown_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::error!(error = %e, "background task panicked"),
                Err(_) => {
                    tracing::warn!(
                        timeout = ?self.config.shutdown_timeout,
                        "background task did not stop in time, aborting"
                    );
                    abort.abort();
                }
            }
        }

        self.flush_now().await;
        self.sessions.close().await;

        let snap = self.metrics.snapshot();
        tracing::info!(
            received = snap.records_received,
            written = snap.records_written,
            failed = snap.records_failed,
            requeued = snap.records_requeued,
            files_created = snap.files_created,
            files_closed = snap.files_closed,
            "sink pipeline stopped"
        );
    }

    /// Wakes the flusher for an immediate cycle.
    pub fn notify_flush(&self) {
        self.flush_notify.notify_one();
    }

    /// True once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
