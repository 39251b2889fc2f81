//! Trace events for the coach streaming pipeline.
//!
//! Sessions record [`TraceEvent`]s through a fire-and-forget
//! [`TraceEventLog`]; sinks persist them and the [`TelemetryAggregator`]
//! reduces a time window of them into latency, cost and reliability
//! metrics.

pub mod fs;
pub mod log;
pub mod memory;
pub mod pricing;
pub mod store;
pub mod telemetry;
pub mod types;

pub use fs::FsTraceSink;
pub use log::TraceEventLog;
pub use memory::MemoryTraceSink;
pub use pricing::*;
pub use store::*;
pub use telemetry::*;
pub use types::*;
