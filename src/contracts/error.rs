use thiserror::Error;

/// Errors surfaced by the sink internals.
///
/// None of these ever reach a producer calling `enqueue`; they are absorbed
/// by the flusher (retry, requeue) and reflected through logs and counters.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Transient failure talking to the segment store (session open or row
    /// write). Retried per the configured retry policy, never fatal.
    #[error("store error: {0}")]
    Store(String),

    /// Local I/O failure.
    #[error("io error: {0}")]
    Io(String),

    /// Failure encoding a record into the columnar row format.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration, rejected at startup.
    #[error("config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e.to_string())
    }
}
