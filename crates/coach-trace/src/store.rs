use crate::types::TraceEvent;

#[derive(Debug, thiserror::Error)]
pub enum TraceStoreError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type TraceStoreResult<T> = Result<T, TraceStoreError>;

/// Durable destination for trace events.
///
/// Writers never wait on the result of `append` from the session path; see
/// [`crate::TraceEventLog`]. `events_since` is the read side used by the
/// telemetry aggregator.
#[async_trait::async_trait]
pub trait TraceSink: Send + Sync {
    async fn append(&self, event: &TraceEvent) -> TraceStoreResult<()>;

    /// Events with `timestamp_ms >= since_ms`, in append order.
    async fn events_since(&self, since_ms: u64) -> TraceStoreResult<Vec<TraceEvent>>;
}
