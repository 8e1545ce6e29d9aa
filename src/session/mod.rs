//! Writer session lifecycle.
//!
//! At most one output file is open at any instant. All session state lives
//! behind a single async mutex so the flusher's check-then-act sequences
//! (ensure open, write rows) and the roll checker's close cannot interleave
//! mid-batch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::contracts::{RowWriter, SegmentStore, SinkError};
use crate::metrics::SinkMetrics;
use crate::partition::PartitionTemplate;

/// Age/row-count thresholds for rolling the open session.
///
/// A configured max-size-in-bytes threshold exists in the outer config but
/// is never evaluated here; see `SinkConfig::validate`.
#[derive(Debug, Clone)]
pub struct RollingPolicy {
    pub max_age: Duration,
    pub max_rows: u64,
}

/// Why a session was rolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollReason {
    Age,
    RowCount,
}

impl RollingPolicy {
    /// Pure rolling decision, testable without an open session or a clock.
    pub fn roll_due(&self, age: Duration, rows: u64) -> Option<RollReason> {
        if age >= self.max_age {
            Some(RollReason::Age)
        } else if rows >= self.max_rows {
            Some(RollReason::RowCount)
        } else {
            None
        }
    }
}

/// File naming and placement settings for sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Output root path, relative to the store root.
    pub output_path: String,
    pub file_prefix: String,
    pub file_extension: String,
    /// Close the session after every successful row write, trading file
    /// count for minimum end-to-end visibility latency.
    pub force_immediate_flush: bool,
}

/// Observable snapshot of the open session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub partition_path: String,
    pub file_path: String,
    pub rows: u64,
    pub age_secs: u64,
}

struct Session<W> {
    partition_path: String,
    file_path: String,
    opened_at: Instant,
    rows: u64,
    writer: W,
}

/// A batch write attempt that failed partway through.
///
/// Rows written before the failure stay committed to the file; the batch is
/// not atomic.
#[derive(Debug)]
pub struct BatchWriteError {
    /// Rows of this attempt that were written before the failure.
    pub rows_written: usize,
    pub source: SinkError,
}

/// Owns the lifecycle of the currently-open output file.
pub struct SessionManager<S: SegmentStore> {
    store: Arc<S>,
    template: PartitionTemplate,
    config: SessionConfig,
    metrics: Arc<SinkMetrics>,
    session: Mutex<Option<Session<S::Writer>>>,
    /// Millisecond suffix of the most recently opened file. File creation is
    /// create-only, so suffixes must never repeat within a process.
    last_file_millis: AtomicI64,
}

impl<S: SegmentStore> SessionManager<S> {
    pub fn new(
        store: Arc<S>,
        template: PartitionTemplate,
        config: SessionConfig,
        metrics: Arc<SinkMetrics>,
    ) -> Self {
        Self {
            store,
            template,
            config,
            metrics,
            session: Mutex::new(None),
            last_file_millis: AtomicI64::new(0),
        }
    }

    /// Writes a batch of records, one row each, opening a session lazily
    /// with the batch's first record as the partitioning sample.
    ///
    /// Holds the session lock for the whole batch so the roll checker cannot
    /// close the file between rows. On a row failure the remaining records
    /// of this attempt are abandoned and the session is left for the caller
    /// to close.
    pub async fn write_batch(&self, batch: &[Bytes]) -> Result<(), BatchWriteError> {
        let Some(sample) = batch.first() else {
            return Ok(());
        };

        let mut guard = self.session.lock().await;
        for (written, record) in batch.iter().enumerate() {
            if guard.is_none() {
                let session = self.open_session(sample).await.map_err(|source| {
                    BatchWriteError {
                        rows_written: written,
                        source,
                    }
                })?;
                *guard = Some(session);
            }
            // Just ensured open above.
            let session = guard.as_mut().unwrap();

            session
                .writer
                .write_row(record)
                .await
                .map_err(|source| BatchWriteError {
                    rows_written: written,
                    source,
                })?;
            session.rows += 1;
            self.metrics.write.record_rows_written(1);

            if self.config.force_immediate_flush {
                self.close_locked(&mut guard).await;
            }
        }
        Ok(())
    }

    /// Opens a new session: resolves the partition path from the sample,
    /// composes a millisecond-suffixed file name and creates the file.
    async fn open_session(&self, sample: &Bytes) -> Result<Session<S::Writer>, SinkError> {
        let now = Utc::now();
        let partition_path = self.template.resolve(sample, now.date_naive());

        // Sessions can open within the same millisecond (force_immediate_flush
        // in particular); nudge the suffix forward so create-only paths stay
        // unique. Callers hold the session lock, so load/store is enough.
        let prev = self.last_file_millis.load(Ordering::Relaxed);
        let millis = now.timestamp_millis().max(prev + 1);
        self.last_file_millis.store(millis, Ordering::Relaxed);

        let file_name = format!(
            "{}-{}-{}.{}",
            self.config.file_prefix,
            now.format("%Y%m%dT%H%M%S"),
            millis,
            self.config.file_extension
        );
        let file_path = if partition_path.is_empty() {
            format!("{}/{}", self.config.output_path, file_name)
        } else {
            format!("{}/{}/{}", self.config.output_path, partition_path, file_name)
        };

        let writer = self.store.create(&file_path).await?;
        self.metrics.files.record_file_created(&partition_path);
        tracing::info!(partition = %partition_path, file = %file_path, "opened writer session");

        Ok(Session {
            partition_path,
            file_path,
            opened_at: Instant::now(),
            rows: 0,
            writer,
        })
    }

    /// Closes the open session, if any. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        self.close_locked(&mut guard).await;
    }

    async fn close_locked(&self, guard: &mut Option<Session<S::Writer>>) {
        let Some(session) = guard.take() else {
            return;
        };

        let Session {
            partition_path,
            file_path,
            rows,
            writer,
            ..
        } = session;

        // A close failure loses buffered rows; the at-least-once guarantee
        // comes from the flusher requeueing failed batches, so this is
        // logged rather than propagated.
        if let Err(e) = writer.close().await {
            tracing::error!(file = %file_path, error = %e, "failed to close session file");
        }

        let bytes = match self.store.file_size(&file_path).await {
            Ok(size) => Some(size),
            Err(e) => {
                tracing::warn!(file = %file_path, error = %e, "failed to stat closed file");
                None
            }
        };
        self.metrics.files.record_file_closed(bytes);

        tracing::info!(
            partition = %partition_path,
            file = %file_path,
            rows,
            bytes = bytes.unwrap_or(0),
            "closed writer session"
        );
    }

    /// Evaluates the rolling policy against the open session and closes it
    /// when due. No new session is opened here; the next write reopens
    /// lazily.
    pub async fn check_roll(&self, policy: &RollingPolicy) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_ref() else {
            return;
        };

        if let Some(reason) = policy.roll_due(session.opened_at.elapsed(), session.rows) {
            tracing::info!(
                file = %session.file_path,
                rows = session.rows,
                ?reason,
                "rolling session"
            );
            self.close_locked(&mut guard).await;
        }
    }

    /// Snapshot of the open session, if any.
    pub async fn current(&self) -> Option<SessionInfo> {
        let guard = self.session.lock().await;
        guard.as_ref().map(|s| SessionInfo {
            partition_path: s.partition_path.clone(),
            file_path: s.file_path.clone(),
            rows: s.rows,
            age_secs: s.opened_at.elapsed().as_secs(),
        })
    }
}
