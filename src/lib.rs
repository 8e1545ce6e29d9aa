pub mod api;
pub mod config;
pub mod contracts;
pub mod flusher;
pub mod metrics;
pub mod partition;
pub mod queue;
pub mod session;
pub mod store;
