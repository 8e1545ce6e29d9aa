//! Metrics registry for the sink pipeline.
//!
//! Lock-free atomics for counters, a concurrent map for per-partition file
//! counts, and fixed-bucket histograms for latency timers.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::Histogram;

/// Central registry for sink observability metrics.
#[derive(Default)]
pub struct SinkMetrics {
    /// Intake queue metrics
    pub intake: Arc<IntakeMetrics>,
    /// Batch write pipeline metrics
    pub write: Arc<WriteMetrics>,
    /// Output file lifecycle metrics
    pub files: Arc<FileMetrics>,
    /// Segment store connectivity metrics
    pub store: Arc<StoreMetrics>,
}

impl SinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formats all metrics in Prometheus exposition format.
    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(8192);
        output.push_str(&self.intake.format_prometheus());
        output.push_str(&self.write.format_prometheus());
        output.push_str(&self.files.format_prometheus());
        output.push_str(&self.store.format_prometheus());
        output
    }

    /// Point-in-time snapshot of the headline counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_received: self.intake.records_received_total.load(Ordering::Relaxed),
            records_dropped: self.intake.records_dropped_total.load(Ordering::Relaxed),
            queue_depth: self.intake.queue_depth.load(Ordering::Relaxed),
            records_written: self.write.records_written_total.load(Ordering::Relaxed),
            records_failed: self.write.records_failed_total.load(Ordering::Relaxed),
            records_requeued: self.write.records_requeued_total.load(Ordering::Relaxed),
            batches_written: self.write.batches_written_total.load(Ordering::Relaxed),
            files_created: self.files.files_created_total.load(Ordering::Relaxed),
            files_closed: self.files.files_closed_total.load(Ordering::Relaxed),
            bytes_written: self.files.bytes_written_total.load(Ordering::Relaxed),
            connection_failures: self.store.connection_failures_total.load(Ordering::Relaxed),
        }
    }
}

/// Headline counters, serialized by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_received: u64,
    pub records_dropped: u64,
    pub queue_depth: u64,
    pub records_written: u64,
    pub records_failed: u64,
    pub records_requeued: u64,
    pub batches_written: u64,
    pub files_created: u64,
    pub files_closed: u64,
    pub bytes_written: u64,
    pub connection_failures: u64,
}

/// Metrics for the intake queue.
#[derive(Default)]
pub struct IntakeMetrics {
    /// Total records accepted by enqueue
    pub records_received_total: AtomicU64,
    /// Total records discarded by the overflow policy (bounded queue only)
    pub records_dropped_total: AtomicU64,
    /// Current queue depth
    pub queue_depth: AtomicU64,
    /// Histogram of per-record enqueue latencies in microseconds
    pub enqueue_latency_us: Histogram,
}

impl IntakeMetrics {
    #[inline]
    pub fn record_enqueue(&self, depth: u64, latency_us: u64) {
        self.records_received_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.enqueue_latency_us.observe(latency_us);
    }

    #[inline]
    pub fn record_drop(&self) {
        self.records_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(1024);

        let _ = writeln!(
            output,
            "# HELP telsink_records_received_total Total records accepted by the intake queue"
        );
        let _ = writeln!(output, "# TYPE telsink_records_received_total counter");
        let _ = writeln!(
            output,
            "telsink_records_received_total {}",
            self.records_received_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_records_dropped_total Total records discarded by the overflow policy"
        );
        let _ = writeln!(output, "# TYPE telsink_records_dropped_total counter");
        let _ = writeln!(
            output,
            "telsink_records_dropped_total {}",
            self.records_dropped_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_queue_depth Records currently buffered in the intake queue"
        );
        let _ = writeln!(output, "# TYPE telsink_queue_depth gauge");
        let _ = writeln!(
            output,
            "telsink_queue_depth {}",
            self.queue_depth.load(Ordering::Relaxed)
        );
        output.push('\n');

        output.push_str(&self.enqueue_latency_us.format_prometheus(
            "telsink_enqueue_latency_us",
            "Per-record enqueue latency in microseconds",
        ));
        output.push('\n');

        output
    }
}

/// Metrics for the batch write pipeline.
#[derive(Default)]
pub struct WriteMetrics {
    /// Total rows written successfully
    pub records_written_total: AtomicU64,
    /// Total rows abandoned by failed write attempts
    pub records_failed_total: AtomicU64,
    /// Total rows appended back to the queue after retry exhaustion
    pub records_requeued_total: AtomicU64,
    /// Total batches fully written
    pub batches_written_total: AtomicU64,
    /// Total write attempts, including retries
    pub write_attempts_total: AtomicU64,
    /// Histogram of per-batch write latencies (drain to success) in microseconds
    pub batch_latency_us: Histogram,
}

impl WriteMetrics {
    #[inline]
    pub fn record_rows_written(&self, rows: u64) {
        self.records_written_total.fetch_add(rows, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_attempt_failed(&self, abandoned_rows: u64) {
        self.write_attempts_total.fetch_add(1, Ordering::Relaxed);
        self.records_failed_total
            .fetch_add(abandoned_rows, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_batch_written(&self, latency_us: u64) {
        self.write_attempts_total.fetch_add(1, Ordering::Relaxed);
        self.batches_written_total.fetch_add(1, Ordering::Relaxed);
        self.batch_latency_us.observe(latency_us);
    }

    #[inline]
    pub fn record_requeue(&self, rows: u64) {
        self.records_requeued_total.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        let _ = writeln!(
            output,
            "# HELP telsink_records_written_total Total rows written to the segment store"
        );
        let _ = writeln!(output, "# TYPE telsink_records_written_total counter");
        let _ = writeln!(
            output,
            "telsink_records_written_total {}",
            self.records_written_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_records_failed_total Total rows abandoned by failed write attempts"
        );
        let _ = writeln!(output, "# TYPE telsink_records_failed_total counter");
        let _ = writeln!(
            output,
            "telsink_records_failed_total {}",
            self.records_failed_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_records_requeued_total Total rows requeued after retry exhaustion"
        );
        let _ = writeln!(output, "# TYPE telsink_records_requeued_total counter");
        let _ = writeln!(
            output,
            "telsink_records_requeued_total {}",
            self.records_requeued_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_batches_written_total Total batches fully written"
        );
        let _ = writeln!(output, "# TYPE telsink_batches_written_total counter");
        let _ = writeln!(
            output,
            "telsink_batches_written_total {}",
            self.batches_written_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_write_attempts_total Total batch write attempts including retries"
        );
        let _ = writeln!(output, "# TYPE telsink_write_attempts_total counter");
        let _ = writeln!(
            output,
            "telsink_write_attempts_total {}",
            self.write_attempts_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        output.push_str(&self.batch_latency_us.format_prometheus(
            "telsink_batch_latency_us",
            "Per-batch write latency in microseconds",
        ));
        output.push('\n');

        output
    }
}

/// Metrics for output file lifecycle.
#[derive(Default)]
pub struct FileMetrics {
    /// Total files created (sessions opened)
    pub files_created_total: AtomicU64,
    /// Total files closed (sessions finalized)
    pub files_closed_total: AtomicU64,
    /// Total bytes of finalized files (best-effort, from close-time stat)
    pub bytes_written_total: AtomicU64,
    /// Files created per partition path
    pub files_by_partition: DashMap<String, u64>,
}

impl FileMetrics {
    #[inline]
    pub fn record_file_created(&self, partition: &str) {
        self.files_created_total.fetch_add(1, Ordering::Relaxed);
        self.files_by_partition
            .entry(partition.to_string())
            .and_modify(|v| *v += 1)
            .or_insert(1);
    }

    #[inline]
    pub fn record_file_closed(&self, bytes: Option<u64>) {
        self.files_closed_total.fetch_add(1, Ordering::Relaxed);
        if let Some(bytes) = bytes {
            self.bytes_written_total.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        let _ = writeln!(
            output,
            "# HELP telsink_files_created_total Total output files created"
        );
        let _ = writeln!(output, "# TYPE telsink_files_created_total counter");
        let _ = writeln!(
            output,
            "telsink_files_created_total {}",
            self.files_created_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_files_closed_total Total output files finalized"
        );
        let _ = writeln!(output, "# TYPE telsink_files_closed_total counter");
        let _ = writeln!(
            output,
            "telsink_files_closed_total {}",
            self.files_closed_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_bytes_written_total Total bytes of finalized output files"
        );
        let _ = writeln!(output, "# TYPE telsink_bytes_written_total counter");
        let _ = writeln!(
            output,
            "telsink_bytes_written_total {}",
            self.bytes_written_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP telsink_files_by_partition Files created per partition path"
        );
        let _ = writeln!(output, "# TYPE telsink_files_by_partition counter");

        // Sorted for deterministic output
        let mut partitions: Vec<(String, u64)> = self
            .files_by_partition
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        partitions.sort_by(|a, b| a.0.cmp(&b.0));

        for (partition, count) in &partitions {
            let _ = writeln!(
                output,
                "telsink_files_by_partition{{partition=\"{}\"}} {}",
                partition, count
            );
        }
        output.push('\n');

        output
    }
}

/// Metrics for segment store connectivity.
#[derive(Default)]
pub struct StoreMetrics {
    /// Total store connection failures
    pub connection_failures_total: AtomicU64,
}

impl StoreMetrics {
    #[inline]
    pub fn record_connection_failure(&self) {
        self.connection_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(256);

        let _ = writeln!(
            output,
            "# HELP telsink_connection_failures_total Total segment store connection failures"
        );
        let _ = writeln!(output, "# TYPE telsink_connection_failures_total counter");
        let _ = writeln!(
            output,
            "telsink_connection_failures_total {}",
            self.connection_failures_total.load(Ordering::Relaxed)
        );
        output.push('\n');

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intake_metrics() {
        let metrics = IntakeMetrics::default();
        metrics.record_enqueue(1, 15);
        metrics.record_enqueue(2, 30);
        metrics.record_drop();

        assert_eq!(metrics.records_received_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.records_dropped_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.queue_depth.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.enqueue_latency_us.count(), 2);
    }

    #[test]
    fn test_write_metrics() {
        let metrics = WriteMetrics::default();
        metrics.record_rows_written(100);
        metrics.record_attempt_failed(20);
        metrics.record_batch_written(5_000);
        metrics.record_requeue(20);

        assert_eq!(metrics.records_written_total.load(Ordering::Relaxed), 100);
        assert_eq!(metrics.records_failed_total.load(Ordering::Relaxed), 20);
        assert_eq!(metrics.records_requeued_total.load(Ordering::Relaxed), 20);
        assert_eq!(metrics.write_attempts_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.batch_latency_us.count(), 1);
    }

    #[test]
    fn test_file_metrics_by_partition() {
        let metrics = FileMetrics::default();
        metrics.record_file_created("date=2026-08-31");
        metrics.record_file_created("date=2026-08-31");
        metrics.record_file_created("date=2026-09-01");
        metrics.record_file_closed(Some(4096));
        metrics.record_file_closed(None);

        assert_eq!(metrics.files_created_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.files_closed_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.bytes_written_total.load(Ordering::Relaxed), 4096);
        assert_eq!(*metrics.files_by_partition.get("date=2026-08-31").unwrap(), 2);

        let output = metrics.format_prometheus();
        assert!(output.contains("telsink_files_by_partition{partition=\"date=2026-08-31\"} 2"));
    }

    #[test]
    fn test_registry_prometheus_format() {
        let metrics = SinkMetrics::new();
        metrics.intake.record_enqueue(1, 10);
        metrics.write.record_rows_written(1);
        metrics.store.record_connection_failure();

        let output = metrics.format_prometheus();
        assert!(output.contains("telsink_records_received_total 1"));
        assert!(output.contains("telsink_records_written_total 1"));
        assert!(output.contains("telsink_connection_failures_total 1"));
        assert!(output.contains("telsink_enqueue_latency_us_bucket"));
    }

    #[test]
    fn test_snapshot() {
        let metrics = SinkMetrics::new();
        metrics.intake.record_enqueue(3, 10);
        metrics.write.record_rows_written(2);
        metrics.files.record_file_created("date=2026-08-31");

        let snap = metrics.snapshot();
        assert_eq!(snap.records_received, 1);
        assert_eq!(snap.queue_depth, 3);
        assert_eq!(snap.records_written, 2);
        assert_eq!(snap.files_created, 1);
    }
}
