//! Accumulates the non-text side of a fragment stream.

use crate::stream::{BackendMetadata, StreamEvent};
use crate::types::Usage;

/// Whether an event was applied or dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    /// The stream already finished; late or replayed events are dropped.
    AfterFinish,
}

/// Folds one attempt's events into usage, model, metadata and counters.
/// Text itself is owned by the session so it is never copied twice.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    backend_trace_id: Option<String>,
    fragment_count: usize,
    char_count: usize,
    usage: Option<Usage>,
    model: Option<String>,
    metadata: BackendMetadata,
    finished: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, event: &StreamEvent) -> Applied {
        if self.finished {
            return Applied::AfterFinish;
        }

        match event {
            StreamEvent::Context { trace_id, metadata } => {
                if trace_id.is_some() {
                    self.backend_trace_id = trace_id.clone();
                }
                merge(&mut self.metadata, metadata);
            }
            StreamEvent::Fragment { text } => {
                self.fragment_count += 1;
                self.char_count += text.chars().count();
            }
            StreamEvent::Finish {
                usage,
                model,
                metadata,
            } => {
                if usage.is_some() {
                    self.usage = *usage;
                }
                if model.is_some() {
                    self.model = model.clone();
                }
                merge(&mut self.metadata, metadata);
                self.finished = true;
            }
        }
        Applied::Accepted
    }

    pub fn backend_trace_id(&self) -> Option<&str> {
        self.backend_trace_id.as_deref()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    pub fn char_count(&self) -> usize {
        self.char_count
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn metadata(&self) -> &BackendMetadata {
        &self.metadata
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

fn merge(target: &mut BackendMetadata, incoming: &BackendMetadata) {
    for (key, value) in incoming {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: serde_json::Value) -> BackendMetadata {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn accumulates_counts_usage_and_metadata() {
        let mut acc = StreamAccumulator::new();
        acc.process(&StreamEvent::Context {
            trace_id: Some("srv-1".to_string()),
            metadata: metadata(json!({ "rag_hit": true })),
        });
        acc.process(&StreamEvent::fragment("Du hast "));
        acc.process(&StreamEvent::fragment("1200 kcal"));
        acc.process(&StreamEvent::Finish {
            usage: Some(Usage::new(40, 9)),
            model: Some("gpt-4o".to_string()),
            metadata: metadata(json!({ "cache_hit": false })),
        });

        assert_eq!(acc.backend_trace_id(), Some("srv-1"));
        assert_eq!(acc.fragment_count(), 2);
        assert_eq!(acc.char_count(), 17);
        assert_eq!(acc.usage().map(|usage| usage.total_tokens), Some(49));
        assert_eq!(acc.model(), Some("gpt-4o"));
        assert_eq!(acc.metadata().get("rag_hit"), Some(&json!(true)));
        assert_eq!(acc.metadata().get("cache_hit"), Some(&json!(false)));
        assert!(acc.is_finished());
    }

    #[test]
    fn events_after_finish_are_dropped() {
        let mut acc = StreamAccumulator::new();
        assert_eq!(acc.process(&StreamEvent::finish()), Applied::Accepted);
        assert_eq!(
            acc.process(&StreamEvent::fragment("late")),
            Applied::AfterFinish
        );
        assert_eq!(acc.fragment_count(), 0);
    }
}
