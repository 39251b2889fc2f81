//! Fragment stream contract between a backend and the session controller.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::BackendResult;
use crate::types::Usage;

/// Free-form values reported by the backend (cache/RAG hits, breaker
/// state, sentiment, ...). Passed through to trace events untouched.
pub type BackendMetadata = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Context the backend resolved for this turn. May arrive at any point
    /// before `Finish`.
    Context {
        trace_id: Option<String>,
        #[serde(default)]
        metadata: BackendMetadata,
    },
    Fragment {
        text: String,
    },
    /// Explicit end-of-stream signal.
    Finish {
        usage: Option<Usage>,
        model: Option<String>,
        #[serde(default)]
        metadata: BackendMetadata,
    },
}

impl StreamEvent {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment { text: text.into() }
    }

    pub fn finish() -> Self {
        Self::Finish {
            usage: None,
            model: None,
            metadata: BackendMetadata::new(),
        }
    }

    pub fn finish_with_usage(model: impl Into<String>, usage: Usage) -> Self {
        Self::Finish {
            usage: Some(usage),
            model: Some(model.into()),
            metadata: BackendMetadata::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = BackendResult<StreamEvent>> + Send>>;

/// A complete answer that must be cut into artificial fragments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferedResponse {
    pub text: String,
    pub trace_id: Option<String>,
    pub usage: Option<Usage>,
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: BackendMetadata,
}

impl BufferedResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// How buffered responses are split when replayed as a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimulatedChunking {
    pub chunk_chars: usize,
    pub delay_ms: u64,
}

impl Default for SimulatedChunking {
    fn default() -> Self {
        Self {
            chunk_chars: 24,
            delay_ms: 20,
        }
    }
}

/// What a successful handshake hands back: either real incremental
/// fragments or a finished text that is fragmented after the fact.
pub enum FragmentSource {
    Incremental {
        trace_id: Option<String>,
        events: FragmentStream,
    },
    Buffered(BufferedResponse),
}

impl FragmentSource {
    pub fn incremental(events: FragmentStream) -> Self {
        Self::Incremental {
            trace_id: None,
            events,
        }
    }

    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        Self::incremental(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }

    pub fn backend_trace_id(&self) -> Option<&str> {
        match self {
            Self::Incremental { trace_id, .. } => trace_id.as_deref(),
            Self::Buffered(response) => response.trace_id.as_deref(),
        }
    }

    pub fn into_stream(self, chunking: &SimulatedChunking) -> FragmentStream {
        match self {
            Self::Incremental { events, .. } => events,
            Self::Buffered(response) => simulated_stream(response, chunking),
        }
    }
}

fn simulated_stream(response: BufferedResponse, chunking: &SimulatedChunking) -> FragmentStream {
    let mut events: Vec<StreamEvent> = simulate_fragments(&response.text, chunking.chunk_chars)
        .into_iter()
        .map(|text| StreamEvent::Fragment { text })
        .collect();
    events.push(StreamEvent::Finish {
        usage: response.usage,
        model: response.model,
        metadata: response.metadata,
    });

    let events = stream::iter(events.into_iter().map(Ok));
    if chunking.delay_ms == 0 {
        return Box::pin(events);
    }
    let delay = Duration::from_millis(chunking.delay_ms);
    Box::pin(events.then(move |event| async move {
        tokio::time::sleep(delay).await;
        event
    }))
}

/// Split `text` into fragments of roughly `chunk_chars` characters, cutting
/// after whitespace. Concatenating the fragments yields `text` exactly.
pub fn simulate_fragments(text: &str, chunk_chars: usize) -> Vec<String> {
    let chunk_chars = chunk_chars.max(1);
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for word in text.split_inclusive(char::is_whitespace) {
        let word_chars = word.chars().count();
        if current_chars > 0 && current_chars + word_chars > chunk_chars {
            fragments.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push_str(word);
        current_chars += word_chars;
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_fragments_cuts_on_whitespace_and_preserves_text() {
        let text = "Du hast 1200 kcal übrig.";
        let fragments = simulate_fragments(text, 8);
        assert_eq!(fragments, vec!["Du hast ", "1200 ", "kcal ", "übrig."]);
        assert_eq!(fragments.concat(), text);
    }

    #[test]
    fn simulate_fragments_keeps_oversized_words_whole() {
        let fragments = simulate_fragments("Proteinsupplementierung hilft", 4);
        assert_eq!(fragments, vec!["Proteinsupplementierung ", "hilft"]);
        assert!(simulate_fragments("", 4).is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn buffered_source_replays_fragments_then_finish() {
        let source = FragmentSource::Buffered(BufferedResponse {
            text: "Trink mehr Wasser.".to_string(),
            trace_id: Some("backend-trace".to_string()),
            usage: Some(Usage::new(10, 5)),
            model: Some("gpt-4o-mini".to_string()),
            metadata: BackendMetadata::new(),
        });
        assert!(source.is_simulated());
        assert_eq!(source.backend_trace_id(), Some("backend-trace"));

        let chunking = SimulatedChunking {
            chunk_chars: 6,
            delay_ms: 0,
        };
        let events: Vec<StreamEvent> = source
            .into_stream(&chunking)
            .map(|event| event.expect("simulated events never fail"))
            .collect()
            .await;

        let text: String = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Fragment { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Trink mehr Wasser.");
        assert!(events.last().is_some_and(StreamEvent::is_terminal));
    }

    #[test]
    fn stream_event_wire_shape_is_tagged() {
        let raw = serde_json::to_value(StreamEvent::fragment("hi")).expect("serialize");
        assert_eq!(raw, serde_json::json!({ "type": "fragment", "text": "hi" }));
    }
}
