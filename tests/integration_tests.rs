//! End-to-end tests for the sink pipeline against a real filesystem store
//! and against mock stores for failure injection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tempfile::TempDir;

use telsink::contracts::{RowWriter, SegmentStore, SinkError};
use telsink::flusher::{PipelineConfig, RetryPolicy, SinkPipeline};
use telsink::metrics::SinkMetrics;
use telsink::partition::PartitionTemplate;
use telsink::queue::IntakeQueue;
use telsink::session::{RollingPolicy, SessionConfig, SessionManager};
use telsink::store::ParquetStore;

// =============================================================================
// Helpers
// =============================================================================

fn session_config() -> SessionConfig {
    SessionConfig {
        output_path: "out".into(),
        file_prefix: "telemetry".into(),
        file_extension: "parquet".into(),
        force_immediate_flush: false,
    }
}

fn pipeline_config(batch_size: usize, max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        flush_interval: Duration::from_secs(60),
        roll_interval: Duration::from_millis(50),
        batch_size,
        retry: RetryPolicy {
            max_retries,
            interval: Duration::ZERO,
        },
        rolling: RollingPolicy {
            max_age: Duration::from_secs(3600),
            max_rows: u64::MAX,
        },
        shutdown_timeout: Duration::from_secs(5),
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    queue: Arc<IntakeQueue>,
    sessions: Arc<SessionManager<ParquetStore>>,
    pipeline: Arc<SinkPipeline<ParquetStore>>,
    metrics: Arc<SinkMetrics>,
}

fn harness(template: &str, batch_size: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let metrics = Arc::new(SinkMetrics::new());
    let store = Arc::new(ParquetStore::new(&root));
    let queue = Arc::new(IntakeQueue::new(Arc::clone(&metrics.intake)));
    let sessions = Arc::new(SessionManager::new(
        store,
        PartitionTemplate::parse(template).unwrap(),
        session_config(),
        Arc::clone(&metrics),
    ));
    let pipeline = Arc::new(SinkPipeline::new(
        Arc::clone(&queue),
        Arc::clone(&sessions),
        pipeline_config(batch_size, 3),
        Arc::clone(&metrics),
    ));
    Harness {
        _dir: dir,
        root,
        queue,
        sessions,
        pipeline,
        metrics,
    }
}

fn parquet_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "parquet") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn count_rows(root: &Path) -> usize {
    parquet_files(root)
        .into_iter()
        .map(|path| {
            let file = std::fs::File::open(path).unwrap();
            ParquetRecordBatchReaderBuilder::try_new(file)
                .unwrap()
                .build()
                .unwrap()
                .map(|batch| batch.unwrap().num_rows())
                .sum::<usize>()
        })
        .sum()
}

// =============================================================================
// Mock stores for failure injection
// =============================================================================

/// Store whose writers fail every row write. Session opens succeed, so each
/// attempt creates and then closes a file.
struct FailingWriteStore {
    creates: AtomicU64,
}

struct FailingWriter;

impl SegmentStore for FailingWriteStore {
    type Writer = FailingWriter;

    async fn create(&self, _path: &str) -> Result<FailingWriter, SinkError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(FailingWriter)
    }

    async fn file_size(&self, _path: &str) -> Result<u64, SinkError> {
        Err(SinkError::Io("no file".into()))
    }
}

impl RowWriter for FailingWriter {
    async fn write_row(&mut self, _raw_json: &[u8]) -> Result<(), SinkError> {
        Err(SinkError::Store("connection reset".into()))
    }

    async fn close(self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Store that captures written rows in memory and fails after a set number
/// of successful rows per writer.
struct FailAfterStore {
    rows: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_after: usize,
}

struct CapturingWriter {
    rows: Arc<Mutex<Vec<Vec<u8>>>>,
    written: usize,
    fail_after: usize,
}

impl SegmentStore for FailAfterStore {
    type Writer = CapturingWriter;

    async fn create(&self, _path: &str) -> Result<CapturingWriter, SinkError> {
        Ok(CapturingWriter {
            rows: Arc::clone(&self.rows),
            written: 0,
            fail_after: self.fail_after,
        })
    }

    async fn file_size(&self, _path: &str) -> Result<u64, SinkError> {
        Ok(0)
    }
}

impl RowWriter for CapturingWriter {
    async fn write_row(&mut self, raw_json: &[u8]) -> Result<(), SinkError> {
        if self.written >= self.fail_after {
            return Err(SinkError::Store("timed out".into()));
        }
        self.written += 1;
        self.rows.lock().unwrap().push(raw_json.to_vec());
        Ok(())
    }

    async fn close(self) -> Result<(), SinkError> {
        Ok(())
    }
}

// =============================================================================
// Conservation and partitioning
// =============================================================================

#[tokio::test]
async fn conservation_every_record_lands_exactly_once() {
    let h = harness("", 10);
    for i in 0..37 {
        h.queue.enqueue(Bytes::from(format!(r#"{{"vehicle_id":{}}}"#, i)));
    }

    h.pipeline.flush_now().await;
    h.sessions.close().await;

    assert!(h.queue.is_empty());
    assert_eq!(count_rows(&h.root), 37);

    let snap = h.metrics.snapshot();
    assert_eq!(snap.records_received, 37);
    assert_eq!(snap.records_written, 37);
    assert_eq!(snap.records_failed, 0);
    assert_eq!(snap.records_requeued, 0);
}

#[tokio::test]
async fn empty_template_uses_date_partition() {
    let h = harness("", 10);
    h.queue.enqueue(Bytes::from_static(b"{}"));
    h.pipeline.flush_now().await;
    h.sessions.close().await;

    let files = parquet_files(&h.root);
    assert_eq!(files.len(), 1);
    let partition_dir = files[0].parent().unwrap().file_name().unwrap();
    let today = chrono::Utc::now().date_naive().format("%Y-%m-%d");
    assert_eq!(
        partition_dir.to_str().unwrap(),
        format!("date={}", today)
    );
}

#[tokio::test]
async fn driver_id_partition_strips_prefix() {
    let h = harness("payload.driver_id", 10);
    h.queue
        .enqueue(Bytes::from_static(br#"{"driver_id":"DRIVER-400018"}"#));
    h.pipeline.flush_now().await;
    h.sessions.close().await;

    let files = parquet_files(&h.root);
    assert_eq!(files.len(), 1);
    let partition_dir = files[0].parent().unwrap().file_name().unwrap();
    assert_eq!(partition_dir.to_str().unwrap(), "400018");
}

#[tokio::test]
async fn partition_resolved_once_per_session_from_first_record() {
    // All records of a batch land in the file opened from the first sample,
    // even when later records would resolve differently.
    let h = harness("'region='+payload.region", 10);
    h.queue.enqueue(Bytes::from_static(br#"{"region":"emea"}"#));
    h.queue.enqueue(Bytes::from_static(br#"{"region":"apac"}"#));
    h.pipeline.flush_now().await;
    h.sessions.close().await;

    let files = parquet_files(&h.root);
    assert_eq!(files.len(), 1);
    let partition_dir = files[0].parent().unwrap().file_name().unwrap();
    assert_eq!(partition_dir.to_str().unwrap(), "region=emea");
    assert_eq!(count_rows(&h.root), 2);
}

#[tokio::test]
async fn unparsable_sample_lands_under_unknown() {
    let h = harness("'region='+payload.region", 10);
    h.queue.enqueue(Bytes::from_static(b"not json"));
    h.pipeline.flush_now().await;
    h.sessions.close().await;

    let files = parquet_files(&h.root);
    assert_eq!(files.len(), 1);
    let partition_dir = files[0].parent().unwrap().file_name().unwrap();
    assert_eq!(partition_dir.to_str().unwrap(), "region=unknown");
}

// =============================================================================
// Retry and failure semantics
// =============================================================================

#[tokio::test]
async fn retry_exhaustion_requeues_batch_intact() {
    let store = Arc::new(FailingWriteStore {
        creates: AtomicU64::new(0),
    });
    let metrics = Arc::new(SinkMetrics::new());
    let queue = Arc::new(IntakeQueue::new(Arc::clone(&metrics.intake)));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        PartitionTemplate::parse("").unwrap(),
        session_config(),
        Arc::clone(&metrics),
    ));
    let pipeline = Arc::new(SinkPipeline::new(
        Arc::clone(&queue),
        Arc::clone(&sessions),
        pipeline_config(10, 3),
        Arc::clone(&metrics),
    ));

    let records: Vec<Bytes> = (0..5)
        .map(|i| Bytes::from(format!(r#"{{"n":{}}}"#, i)))
        .collect();
    for record in &records {
        queue.enqueue(record.clone());
    }

    pipeline.flush_now().await;

    // Total attempts = 1 + max_retries; each opened and closed a session.
    assert_eq!(store.creates.load(Ordering::SeqCst), 4);
    let snap = metrics.snapshot();
    assert_eq!(snap.files_created, 4);
    assert_eq!(snap.files_closed, 4);
    assert_eq!(snap.records_written, 0);
    assert_eq!(snap.records_requeued, 5);

    // The batch reappears at the tail, intact and in order.
    assert_eq!(queue.len(), 5);
    assert_eq!(queue.drain(5), records);
    assert!(sessions.current().await.is_none());
}

#[tokio::test]
async fn mid_batch_failure_keeps_written_rows_and_abandons_rest() {
    let rows = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(FailAfterStore {
        rows: Arc::clone(&rows),
        fail_after: 2,
    });
    let metrics = Arc::new(SinkMetrics::new());
    let sessions = SessionManager::new(
        store,
        PartitionTemplate::parse("").unwrap(),
        session_config(),
        Arc::clone(&metrics),
    );

    let batch: Vec<Bytes> = (0..5)
        .map(|i| Bytes::from(format!(r#"{{"n":{}}}"#, i)))
        .collect();
    let err = sessions.write_batch(&batch).await.unwrap_err();

    // Two rows committed before the failure; the rest of the attempt is
    // abandoned, not atomic-rolled-back.
    assert_eq!(err.rows_written, 2);
    assert_eq!(rows.lock().unwrap().len(), 2);
    assert_eq!(metrics.snapshot().records_written, 2);
}

#[tokio::test]
async fn recovery_after_transient_failure_preserves_records() {
    // First flush fails and requeues; a healthy store then drains the queue.
    let store = Arc::new(FailingWriteStore {
        creates: AtomicU64::new(0),
    });
    let metrics = Arc::new(SinkMetrics::new());
    let queue = Arc::new(IntakeQueue::new(Arc::clone(&metrics.intake)));
    let sessions = Arc::new(SessionManager::new(
        store,
        PartitionTemplate::parse("").unwrap(),
        session_config(),
        Arc::clone(&metrics),
    ));
    let pipeline = SinkPipeline::new(
        Arc::clone(&queue),
        sessions,
        pipeline_config(10, 0),
        Arc::clone(&metrics),
    );

    for i in 0..3 {
        queue.enqueue(Bytes::from(format!(r#"{{"n":{}}}"#, i)));
    }
    pipeline.flush_now().await;
    assert_eq!(queue.len(), 3);

    // Same queue, healthy store.
    let h = harness("", 10);
    for record in queue.drain(3) {
        h.queue.enqueue(record);
    }
    h.pipeline.flush_now().await;
    h.sessions.close().await;
    assert_eq!(count_rows(&h.root), 3);
}

// =============================================================================
// Rolling
// =============================================================================

#[tokio::test]
async fn count_rolling_closes_at_threshold_with_batch_overshoot() {
    let h = harness("", 12);
    let rolling = RollingPolicy {
        max_age: Duration::from_secs(3600),
        max_rows: 10,
    };

    // A single 12-record batch overshoots the 10-row threshold by one batch
    // slack; the roll check then closes the session.
    for i in 0..12 {
        h.queue.enqueue(Bytes::from(format!(r#"{{"n":{}}}"#, i)));
    }
    h.pipeline.flush_now().await;
    assert_eq!(h.sessions.current().await.unwrap().rows, 12);

    h.sessions.check_roll(&rolling).await;
    assert!(h.sessions.current().await.is_none());
    assert_eq!(h.metrics.snapshot().files_closed, 1);

    // The next write lazily opens a new session with a new file.
    h.queue.enqueue(Bytes::from_static(b"{}"));
    h.pipeline.flush_now().await;
    h.sessions.close().await;
    assert_eq!(h.metrics.snapshot().files_created, 2);
    assert_eq!(count_rows(&h.root), 13);
}

#[tokio::test]
async fn roll_check_leaves_young_session_open() {
    let h = harness("", 10);
    let rolling = RollingPolicy {
        max_age: Duration::from_secs(3600),
        max_rows: 100,
    };

    h.queue.enqueue(Bytes::from_static(b"{}"));
    h.pipeline.flush_now().await;
    h.sessions.check_roll(&rolling).await;

    assert!(h.sessions.current().await.is_some());
}

#[tokio::test]
async fn force_immediate_flush_writes_one_file_per_record() {
    let dir = TempDir::new().unwrap();
    let metrics = Arc::new(SinkMetrics::new());
    let store = Arc::new(ParquetStore::new(dir.path()));
    let sessions = SessionManager::new(
        store,
        PartitionTemplate::parse("").unwrap(),
        SessionConfig {
            force_immediate_flush: true,
            ..session_config()
        },
        Arc::clone(&metrics),
    );

    let batch: Vec<Bytes> = (0..3)
        .map(|i| Bytes::from(format!(r#"{{"n":{}}}"#, i)))
        .collect();
    sessions.write_batch(&batch).await.unwrap();

    assert!(sessions.current().await.is_none());
    assert_eq!(metrics.snapshot().files_created, 3);
    assert_eq!(metrics.snapshot().files_closed, 3);
    assert_eq!(parquet_files(dir.path()).len(), 3);
    assert_eq!(count_rows(dir.path()), 3);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn shutdown_drains_queue_and_closes_session() {
    let h = harness("", 10);
    h.pipeline.start();

    for i in 0..25 {
        h.queue.enqueue(Bytes::from(format!(r#"{{"n":{}}}"#, i)));
    }
    h.pipeline.shutdown().await;

    assert!(h.queue.is_empty());
    assert!(h.sessions.current().await.is_none());
    assert_eq!(count_rows(&h.root), 25);
    assert_eq!(h.metrics.snapshot().records_written, 25);
}

#[tokio::test]
async fn shutdown_with_empty_queue_is_clean() {
    let h = harness("", 10);
    h.pipeline.start();
    h.pipeline.shutdown().await;

    assert!(h.queue.is_empty());
    assert_eq!(h.metrics.snapshot().files_created, 0);
}
