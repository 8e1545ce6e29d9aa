pub mod error;
pub mod store;

pub use error::SinkError;
pub use store::{RowWriter, SegmentStore};
