mod histogram;
mod registry;

pub use histogram::{Histogram, HISTOGRAM_BUCKETS};
pub use registry::{
    FileMetrics, IntakeMetrics, MetricsSnapshot, SinkMetrics, StoreMetrics, WriteMetrics,
};
