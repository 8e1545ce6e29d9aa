//! Filesystem-mounted segment store writing Snappy-compressed Parquet.
//!
//! Each output file carries a single non-null Utf8 column, `raw_json`, one
//! row per record. Files are opened create-only; an existing exact path is
//! an error.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::StringArray;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use backon::{ConstantBuilder, Retryable};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::config::AuthMode;
use crate::contracts::{RowWriter, SegmentStore, SinkError};
use crate::metrics::StoreMetrics;

/// Connection settings for the segment store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store endpoint: the mounted root directory.
    pub root: PathBuf,
    /// Timeout for the startup reachability probe.
    pub connect_timeout: Duration,
    /// Probe retries before giving up at startup.
    pub connect_retries: usize,
    /// Fixed delay between probe attempts.
    pub connect_retry_interval: Duration,
    /// Durability/replication factor, honored by the backing mount.
    pub replication: u16,
    /// Authentication mode, honored by the backing mount.
    pub auth: AuthMode,
}

/// Production [`SegmentStore`] backed by a mounted hierarchical store.
pub struct ParquetStore {
    root: PathBuf,
    schema: Arc<Schema>,
}

impl ParquetStore {
    /// Arrow schema for the single-column raw JSON row format.
    pub fn row_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![Field::new(
            "raw_json",
            DataType::Utf8,
            false,
        )]))
    }

    /// Connects to the store root, probing reachability with fixed-interval
    /// retries.
    ///
    /// A store that is unreachable at startup is logged and counted, not
    /// fatal: the sink keeps running, records accumulate in the intake
    /// queue, and later session opens are retried by the flusher.
    pub async fn connect(config: StoreConfig, metrics: Arc<StoreMetrics>) -> Self {
        let root = config.root.clone();
        let connect_timeout = config.connect_timeout;

        let probe = || {
            let root = root.clone();
            async move {
                tokio::time::timeout(connect_timeout, tokio::fs::create_dir_all(&root))
                    .await
                    .map_err(|_| SinkError::Store("store connect timed out".into()))?
                    .map_err(|e| SinkError::Store(e.to_string()))
            }
        };

        let result = probe
            .retry(
                ConstantBuilder::default()
                    .with_delay(config.connect_retry_interval)
                    .with_max_times(config.connect_retries),
            )
            .notify(|err: &SinkError, dur: Duration| {
                tracing::warn!(error = %err, retry_in = ?dur, "store connect failed, retrying");
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    root = %config.root.display(),
                    replication = config.replication,
                    auth = %config.auth,
                    "connected to segment store"
                );
            }
            Err(e) => {
                metrics.record_connection_failure();
                tracing::error!(
                    root = %config.root.display(),
                    error = %e,
                    "segment store unreachable at startup, continuing with buffered intake"
                );
            }
        }

        Self {
            root: config.root,
            schema: Self::row_schema(),
        }
    }

    /// Opens a store rooted at `root` without a connectivity probe.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            schema: Self::row_schema(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl SegmentStore for ParquetStore {
    type Writer = ParquetRowWriter;

    async fn create(&self, path: &str) -> Result<ParquetRowWriter, SinkError> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::Store(e.to_string()))?;
        }

        // Create-only: reusing an exact path is an error; the millisecond
        // file name suffix makes collisions practically impossible.
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&full)
            .map_err(|e| SinkError::Store(format!("create {}: {}", full.display(), e)))?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();

        let writer = ArrowWriter::try_new(file, Arc::clone(&self.schema), Some(props))
            .map_err(|e| SinkError::Serialization(e.to_string()))?;

        Ok(ParquetRowWriter {
            writer,
            schema: Arc::clone(&self.schema),
        })
    }

    async fn file_size(&self, path: &str) -> Result<u64, SinkError> {
        let meta = tokio::fs::metadata(self.full_path(path))
            .await
            .map_err(|e| SinkError::Io(e.to_string()))?;
        Ok(meta.len())
    }
}

/// Writer for one open Parquet file.
#[derive(Debug)]
pub struct ParquetRowWriter {
    writer: ArrowWriter<File>,
    schema: Arc<Schema>,
}

impl RowWriter for ParquetRowWriter {
    async fn write_row(&mut self, raw_json: &[u8]) -> Result<(), SinkError> {
        let text = String::from_utf8_lossy(raw_json);
        let column = StringArray::from(vec![text.as_ref()]);
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), vec![Arc::new(column)])
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        self.writer
            .write(&batch)
            .map_err(|e| SinkError::Store(e.to_string()))
    }

    async fn close(self) -> Result<(), SinkError> {
        self.writer
            .close()
            .map(|_| ())
            .map_err(|e| SinkError::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_write_close_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ParquetStore::new(dir.path());

        let mut writer = store.create("out/date=2026-08-31/f-1.parquet").await.unwrap();
        writer.write_row(br#"{"a":1}"#).await.unwrap();
        writer.write_row(br#"{"a":2}"#).await.unwrap();
        writer.close().await.unwrap();

        let size = store.file_size("out/date=2026-08-31/f-1.parquet").await.unwrap();
        assert!(size > 0);

        let file = File::open(dir.path().join("out/date=2026-08-31/f-1.parquet")).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_create_is_create_only() {
        let dir = TempDir::new().unwrap();
        let store = ParquetStore::new(dir.path());

        let writer = store.create("dup.parquet").await.unwrap();
        writer.close().await.unwrap();

        let err = store.create("dup.parquet").await.unwrap_err();
        assert!(matches!(err, SinkError::Store(_)));
    }

    #[tokio::test]
    async fn test_file_size_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let store = ParquetStore::new(dir.path());
        assert!(store.file_size("absent.parquet").await.is_err());
    }
}
