use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

/// Structured payload of a trace event: durations, token counts, flags.
pub type TraceData = Map<String, Value>;

/// Pipeline checkpoint a trace event marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStage {
    Received,
    BackendCallStarted,
    ContextReady,
    FirstFragment,
    StreamDone,
    Completed,
    Retrying,
    Error,
    Aborted,
}

impl TraceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::BackendCallStarted => "backend_call_started",
            Self::ContextReady => "context_ready",
            Self::FirstFragment => "first_fragment",
            Self::StreamDone => "stream_done",
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl Display for TraceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one pipeline checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: String,
    #[serde(default)]
    pub session_id: String,
    pub stage: TraceStage,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub data: TraceData,
}

impl TraceEvent {
    pub fn new(trace_id: impl Into<String>, session_id: impl Into<String>, stage: TraceStage) -> Self {
        Self {
            trace_id: trace_id.into(),
            session_id: session_id.into(),
            stage,
            timestamp_ms: now_ms(),
            data: TraceData::new(),
        }
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: TraceData) -> Self {
        self.data.extend(data);
        self
    }
}

/// Typed lookups that tolerate missing or mistyped fields.
pub trait TraceDataExt {
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_u64(&self, key: &str) -> Option<u64>;
    fn get_f64(&self, key: &str) -> Option<f64>;
    fn get_bool(&self, key: &str) -> Option<bool>;
}

impl TraceDataExt for TraceData {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        let value = self.get(key)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u64))
            .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        let value = self.get(key)?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
            .filter(|v| v.is_finite())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }
}

pub fn now_ms() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis() as u64
}
