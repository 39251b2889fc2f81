use crate::store::{TraceSink, TraceStoreError, TraceStoreResult};
use crate::types::TraceEvent;
use std::sync::{Arc, Mutex};

/// In-process sink, used by tests and as the default read model for
/// short-lived deployments.
#[derive(Clone, Debug, Default)]
pub struct MemoryTraceSink {
    inner: Arc<Mutex<Vec<TraceEvent>>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.inner
            .lock()
            .expect("memory trace sink mutex poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("memory trace sink mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl TraceSink for MemoryTraceSink {
    async fn append(&self, event: &TraceEvent) -> TraceStoreResult<()> {
        let mut events = self
            .inner
            .lock()
            .map_err(|_| TraceStoreError::Backend("memory trace sink mutex poisoned".to_string()))?;
        events.push(event.clone());
        Ok(())
    }

    async fn events_since(&self, since_ms: u64) -> TraceStoreResult<Vec<TraceEvent>> {
        let events = self
            .inner
            .lock()
            .map_err(|_| TraceStoreError::Backend("memory trace sink mutex poisoned".to_string()))?;
        Ok(events
            .iter()
            .filter(|event| event.timestamp_ms >= since_ms)
            .cloned()
            .collect())
    }
}
