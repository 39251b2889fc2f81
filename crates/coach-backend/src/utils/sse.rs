//! Server-Sent Events framing for the HTTP backend.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::errors::{BackendError, BackendResult, ErrorKind};
use crate::stream::{BackendMetadata, StreamEvent};
use crate::types::Usage;

/// One dispatched SSE frame.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty() && self.id.is_none()
    }
}

/// Incremental parser fed with raw body chunks.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    frame: SseFrame,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.apply_line(line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Dispatch whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(frame) = self.apply_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn apply_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.frame.event = Some(value.to_string()),
            "id" => self.frame.id = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.frame.data.push('\n');
                }
                self.frame.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        self.has_data = false;
        let frame = std::mem::take(&mut self.frame);
        if frame.is_empty() { None } else { Some(frame) }
    }
}

#[derive(Deserialize)]
struct DeltaPayload {
    #[serde(alias = "delta", alias = "content")]
    text: String,
}

#[derive(Deserialize)]
struct DonePayload {
    usage: Option<Usage>,
    model: Option<String>,
    #[serde(flatten)]
    metadata: BackendMetadata,
}

#[derive(Deserialize)]
struct ContextPayload {
    trace_id: Option<String>,
    #[serde(flatten)]
    metadata: BackendMetadata,
}

#[derive(Deserialize)]
struct ErrorPayload {
    code: Option<String>,
    message: Option<String>,
}

/// Decode a frame of the coach backend's event protocol.
///
/// `context`, `delta` (or unnamed), `done` and `error` frames are
/// understood; a bare `[DONE]` data line also finishes the stream. Other
/// event names are ignored.
pub fn decode_frame(frame: &SseFrame) -> Option<BackendResult<StreamEvent>> {
    let data = frame.data.trim();
    if data == "[DONE]" {
        return Some(Ok(StreamEvent::finish()));
    }
    if data.is_empty() && matches!(frame.event.as_deref(), None | Some("delta" | "message")) {
        return None;
    }

    match frame.event.as_deref().unwrap_or("delta") {
        "delta" | "message" => Some(
            parse::<DeltaPayload>(data, "delta")
                .map(|payload| StreamEvent::Fragment { text: payload.text }),
        ),
        "context" => Some(parse::<ContextPayload>(data, "context").map(|payload| {
            StreamEvent::Context {
                trace_id: payload.trace_id,
                metadata: payload.metadata,
            }
        })),
        "done" => {
            if data.is_empty() {
                return Some(Ok(StreamEvent::finish()));
            }
            Some(
                parse::<DonePayload>(data, "done").map(|payload| StreamEvent::Finish {
                    usage: payload.usage,
                    model: payload.model,
                    metadata: payload.metadata,
                }),
            )
        }
        "error" => {
            let payload = parse::<ErrorPayload>(data, "error").ok();
            let code = payload.as_ref().and_then(|payload| payload.code.as_deref());
            let kind = code.and_then(ErrorKind::from_code).unwrap_or(ErrorKind::Unknown);
            let message = payload
                .as_ref()
                .and_then(|payload| payload.message.clone())
                .unwrap_or_else(|| data.to_string());
            Some(Err(BackendError::new(kind, message)))
        }
        _ => None,
    }
}

fn parse<T: DeserializeOwned>(data: &str, event: &str) -> BackendResult<T> {
    serde_json::from_str(data)
        .map_err(|err| BackendError::malformed(format!("malformed {event} payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let mut parser = SseParser::new();
        let body = "event: delta\ndata: {\"text\": \"übrig.\"}\n\n".as_bytes();
        let split = body.iter().position(|byte| *byte == 0xC3).expect("umlaut") + 1;

        assert!(parser.push(&body[..split]).is_empty());
        let frames = parser.push(&body[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("delta"));
        assert_eq!(frames[0].data, "{\"text\": \"übrig.\"}");
    }

    #[test]
    fn comments_are_skipped_and_multiline_data_joined() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": keepalive\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"id: 9\ndata: [DONE]").is_empty());
        let frame = parser.finish().expect("trailing frame");
        assert_eq!(frame.id.as_deref(), Some("9"));
        assert_eq!(frame.data, "[DONE]");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn decode_maps_protocol_events() {
        let delta = SseFrame {
            event: None,
            data: r#"{"text": "Du hast "}"#.to_string(),
            id: None,
        };
        assert_eq!(
            decode_frame(&delta).expect("decoded").expect("ok"),
            StreamEvent::fragment("Du hast ")
        );

        let done = SseFrame {
            event: Some("done".to_string()),
            data: r#"{"model": "gpt-4o", "usage": {"prompt_tokens": 3, "completion_tokens": 4}, "cache_hit": true}"#
                .to_string(),
            id: None,
        };
        match decode_frame(&done).expect("decoded").expect("ok") {
            StreamEvent::Finish {
                usage,
                model,
                metadata,
            } => {
                assert_eq!(usage.map(|usage| usage.completion_tokens), Some(4));
                assert_eq!(model.as_deref(), Some("gpt-4o"));
                assert_eq!(metadata.get("cache_hit"), Some(&Value::Bool(true)));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let error = SseFrame {
            event: Some("error".to_string()),
            data: r#"{"code": "BACKEND_5XX", "message": "upstream overloaded"}"#.to_string(),
            id: None,
        };
        let error = decode_frame(&error).expect("decoded").expect_err("error frame");
        assert_eq!(error.kind(), ErrorKind::Backend5xx);

        let ping = SseFrame {
            event: Some("ping".to_string()),
            data: String::new(),
            id: None,
        };
        assert!(decode_frame(&ping).is_none());
    }

    #[test]
    fn malformed_delta_is_unknown_error() {
        let frame = SseFrame {
            event: Some("delta".to_string()),
            data: "not json".to_string(),
            id: None,
        };
        let error = decode_frame(&frame).expect("decoded").expect_err("malformed");
        assert_eq!(error.kind(), ErrorKind::Unknown);
    }
}
