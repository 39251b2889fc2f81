#![allow(dead_code)]

use async_trait::async_trait;
use coach_backend::{
    BackendAdapter, BackendError, BackendRequest, BackendResult, BufferedResponse,
    FragmentSource, StreamEvent, Usage,
};
use coach_session::{StreamConfig, StreamSessionController};
use coach_trace::{MemoryTraceSink, TraceEvent, TraceEventLog, TraceStage};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What the scripted backend does for one invocation.
pub enum Script {
    /// Handshake fails.
    Fail(BackendError),
    /// Handshake succeeds with these stream items, in order.
    Stream(Vec<BackendResult<StreamEvent>>),
    /// Handshake succeeds with a complete answer.
    Buffered(BufferedResponse),
    /// Handshake never resolves.
    Pending,
    /// Stream yields these events, then never yields again.
    StreamThenHang(Vec<StreamEvent>),
}

impl Script {
    pub fn fragments(fragments: &[&str]) -> Self {
        let mut events: Vec<BackendResult<StreamEvent>> = fragments
            .iter()
            .map(|text| Ok(StreamEvent::fragment(*text)))
            .collect();
        events.push(Ok(StreamEvent::finish_with_usage(
            "gpt-4o-mini",
            Usage::new(120, 9),
        )));
        Self::Stream(events)
    }
}

#[derive(Clone, Default)]
pub struct SequenceBackend {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<BackendRequest>>>,
}

impl SequenceBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().expect("scripts mutex").push_back(script);
    }

    pub fn invocations(&self) -> usize {
        self.requests.lock().expect("requests mutex").len()
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().expect("requests mutex").clone()
    }
}

#[async_trait]
impl BackendAdapter for SequenceBackend {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn invoke(&self, request: BackendRequest) -> BackendResult<FragmentSource> {
        self.requests.lock().expect("requests mutex").push(request);
        let script = self
            .scripts
            .lock()
            .expect("scripts mutex")
            .pop_front()
            .ok_or_else(|| BackendError::config_missing("no script queued"))?;

        match script {
            Script::Fail(error) => Err(error),
            Script::Stream(items) => Ok(FragmentSource::incremental(Box::pin(
                futures::stream::iter(items),
            ))),
            Script::Buffered(response) => Ok(FragmentSource::Buffered(response)),
            Script::Pending => std::future::pending().await,
            Script::StreamThenHang(events) => Ok(FragmentSource::incremental(Box::pin(
                futures::stream::iter(events.into_iter().map(Ok)).chain(futures::stream::pending()),
            ))),
        }
    }
}

/// Controller wired to an in-memory trace sink.
pub struct Harness {
    pub backend: SequenceBackend,
    pub sink: MemoryTraceSink,
    pub trace_log: TraceEventLog,
    pub controller: Arc<StreamSessionController>,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self::with_config(scripts, quiet_config())
    }

    pub fn with_config(scripts: Vec<Script>, config: StreamConfig) -> Self {
        let backend = SequenceBackend::new(scripts);
        let sink = MemoryTraceSink::new();
        let trace_log = TraceEventLog::spawn(Arc::new(sink.clone()));
        let controller = StreamSessionController::new(
            Arc::new(backend.clone()),
            trace_log.clone(),
            config,
        )
        .expect("controller should build");
        Self {
            backend,
            sink,
            trace_log,
            controller: Arc::new(controller),
        }
    }

    pub async fn events(&self) -> Vec<TraceEvent> {
        self.trace_log.flush().await;
        self.sink.snapshot()
    }

    pub async fn stages_for(&self, session_id: &str) -> Vec<TraceStage> {
        self.events()
            .await
            .into_iter()
            .filter(|event| event.session_id == session_id)
            .map(|event| event.stage)
            .collect()
    }
}

/// Defaults without timeouts or simulated pacing, so paused-clock tests
/// only advance for retry backoff.
pub fn quiet_config() -> StreamConfig {
    StreamConfig {
        connect_timeout_ms: None,
        fragment_timeout_ms: None,
        simulated_delay_ms: 0,
        ..StreamConfig::default()
    }
}

pub fn count(stages: &[TraceStage], stage: TraceStage) -> usize {
    stages.iter().filter(|candidate| **candidate == stage).count()
}
