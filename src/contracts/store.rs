use std::future::Future;

use crate::contracts::error::SinkError;

/// The external columnar-write client.
///
/// The sink composes partitioned file paths and drives row writes through
/// this seam; the store owns the actual encoding (Parquet) and the
/// create-only open semantics. Paths are relative to the store root.
pub trait SegmentStore: Send + Sync {
    type Writer: RowWriter + 'static;

    /// Opens a new file at `path` in create-only mode.
    ///
    /// An already-existing exact path is an error; callers avoid collisions
    /// with a wall-clock-millisecond file name suffix.
    fn create(&self, path: &str) -> impl Future<Output = Result<Self::Writer, SinkError>> + Send;

    /// Returns the size in bytes of a finalized file.
    fn file_size(&self, path: &str) -> impl Future<Output = Result<u64, SinkError>> + Send;
}

/// An open writer for a single output file: one row per record, a single
/// text column holding the raw JSON payload.
pub trait RowWriter: Send {
    fn write_row(&mut self, raw_json: &[u8])
        -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Finalizes and closes the file. Consumes the writer; a closed file is
    /// never reopened.
    fn close(self) -> impl Future<Output = Result<(), SinkError>> + Send;
}
