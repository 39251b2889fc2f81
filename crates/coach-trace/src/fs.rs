use crate::store::{TraceSink, TraceStoreError, TraceStoreResult};
use crate::types::TraceEvent;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const TRACE_FILE_NAME: &str = "trace-events.jsonl";

/// Append-only JSON Lines sink, one event per line.
#[derive(Clone, Debug)]
pub struct FsTraceSink {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FsTraceSink {
    pub fn new<P: AsRef<Path>>(root: P) -> TraceStoreResult<Self> {
        fs::create_dir_all(root.as_ref()).map_err(|err| {
            TraceStoreError::Backend(format!("create trace sink root failed: {err}"))
        })?;
        Ok(Self {
            path: root.as_ref().join(TRACE_FILE_NAME),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl TraceSink for FsTraceSink {
    async fn append(&self, event: &TraceEvent) -> TraceStoreResult<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|err| TraceStoreError::Serialization(err.to_string()))?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TraceStoreError::Backend("trace file lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| TraceStoreError::Unavailable(format!("open trace file failed: {err}")))?;
        file.write_all(&line)
            .map_err(|err| TraceStoreError::Backend(format!("write trace file failed: {err}")))?;
        Ok(())
    }

    async fn events_since(&self, since_ms: u64) -> TraceStoreResult<Vec<TraceEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|err| TraceStoreError::Backend(format!("read trace file failed: {err}")))?;

        let mut events = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TraceEvent>(line) {
                Ok(event) if event.timestamp_ms >= since_ms => events.push(event),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %err,
                        "skipping unreadable trace line"
                    );
                }
            }
        }
        Ok(events)
    }
}
