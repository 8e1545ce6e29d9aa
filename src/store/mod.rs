mod parquet_store;

pub use parquet_store::{ParquetRowWriter, ParquetStore, StoreConfig};
