//! reqwest-based adapter for the coach backend's HTTP endpoint.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BackendError, BackendResult};
use crate::provider::BackendAdapter;
use crate::stream::{BackendMetadata, BufferedResponse, FragmentSource, FragmentStream, StreamEvent};
use crate::types::{AttachmentRef, BackendRequest, HistoryMessage, Usage};
use crate::utils::sse::{SseParser, decode_frame};

pub const TRACE_ID_HEADER: &str = "x-trace-id";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub path: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            path: "/v1/coach/stream".to_string(),
            api_key: None,
            model: None,
            connect_timeout_ms: 10_000,
        }
    }
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Reads `COACH_BACKEND_URL` (required), `COACH_BACKEND_PATH`,
    /// `COACH_BACKEND_API_KEY`, `COACH_BACKEND_MODEL` and
    /// `COACH_BACKEND_CONNECT_TIMEOUT_MS`.
    pub fn from_env() -> BackendResult<Self> {
        let base_url = std::env::var("COACH_BACKEND_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| BackendError::config_missing("COACH_BACKEND_URL is not set"))?;
        let mut config = Self::new(base_url);
        if let Ok(path) = std::env::var("COACH_BACKEND_PATH") {
            config.path = path;
        }
        config.api_key = std::env::var("COACH_BACKEND_API_KEY").ok();
        config.model = std::env::var("COACH_BACKEND_MODEL").ok();
        if let Ok(raw) = std::env::var("COACH_BACKEND_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = raw.trim().parse().map_err(|_| {
                BackendError::config_missing(format!(
                    "COACH_BACKEND_CONNECT_TIMEOUT_MS must be an integer, got '{raw}'"
                ))
            })?;
        }
        Ok(config)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    user_id: &'a str,
    message: Option<&'a str>,
    attachments: &'a [AttachmentRef],
    history: &'a [HistoryMessage],
    model: Option<&'a str>,
    trace_id: Option<&'a str>,
    stream: bool,
}

#[derive(Deserialize)]
struct WireBufferedResponse {
    #[serde(alias = "content", alias = "response")]
    text: String,
    trace_id: Option<String>,
    usage: Option<Usage>,
    model: Option<String>,
    #[serde(flatten)]
    metadata: BackendMetadata,
}

#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> BackendResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(BackendError::config_missing("backend base url is empty"));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|err| BackendError::config_missing(format!("http client: {err}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }
}

#[async_trait]
impl BackendAdapter for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, request: BackendRequest) -> BackendResult<FragmentSource> {
        let model = request.model.as_deref().or(self.config.model.as_deref());
        let body = WireRequest {
            user_id: &request.user_id,
            message: request.text.as_deref(),
            attachments: &request.attachments,
            history: &request.history,
            model,
            trace_id: request.trace_id.as_deref(),
            stream: true,
        };

        let mut builder = self
            .client
            .post(self.config.endpoint())
            .header(ACCEPT, "text/event-stream, application/json")
            .json(&body);
        if let Some(api_key) = self.config.api_key.as_deref() {
            builder = builder.bearer_auth(api_key);
        }
        if let Some(trace_id) = request.trace_id.as_deref() {
            builder = builder.header(TRACE_ID_HEADER, trace_id);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let trace_id = header_value(response.headers(), TRACE_ID_HEADER);
        let is_event_stream = header_value(response.headers(), CONTENT_TYPE.as_str())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let error = error_from_body(status.as_u16(), &raw);
            tracing::warn!(status = status.as_u16(), kind = %error.kind, "coach backend rejected request");
            return Err(error);
        }

        tracing::debug!(
            event_stream = is_event_stream,
            backend_trace_id = trace_id.as_deref().unwrap_or_default(),
            "coach backend accepted request"
        );
        if is_event_stream {
            let events = sse_event_stream(response.bytes_stream());
            return Ok(FragmentSource::Incremental { trace_id, events });
        }

        let payload: WireBufferedResponse = response
            .json()
            .await
            .map_err(|err| BackendError::malformed(format!("malformed response body: {err}")))?;
        Ok(FragmentSource::Buffered(BufferedResponse {
            text: payload.text,
            trace_id: payload.trace_id.or(trace_id),
            usage: payload.usage,
            model: payload.model,
            metadata: payload.metadata,
        }))
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Map a transport-level failure onto the taxonomy.
pub fn classify_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        return BackendError::timeout(err.to_string());
    }
    if err.is_decode() {
        return BackendError::malformed(err.to_string());
    }
    BackendError::network(err.to_string())
}

/// Build an error from a non-2xx response body of the form
/// `{"error": {"code": .., "message": ..}}` or `{"code": .., "message": ..}`.
pub fn error_from_body(status: u16, raw: &str) -> BackendError {
    let parsed: Option<Value> = serde_json::from_str(raw).ok();
    let detail = parsed
        .as_ref()
        .map(|value| value.get("error").filter(|inner| inner.is_object()).unwrap_or(value));
    let code = detail
        .and_then(|value| value.get("code"))
        .and_then(Value::as_str);
    let message = detail
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            if raw.trim().is_empty() {
                format!("backend responded with status {status}")
            } else {
                raw.trim().to_string()
            }
        });
    BackendError::from_response(status, code, message)
}

fn sse_event_stream<S>(body: S) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        parser: SseParser,
        ready: VecDeque<BackendResult<StreamEvent>>,
        exhausted: bool,
    }

    let state = State {
        body: Box::pin(body),
        parser: SseParser::new(),
        ready: VecDeque::new(),
        exhausted: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(next) = state.ready.pop_front() {
                return Some((next, state));
            }
            if state.exhausted {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.parser.push(&chunk) {
                        if let Some(event) = decode_frame(&frame) {
                            state.ready.push_back(event);
                        }
                    }
                }
                Some(Err(err)) => {
                    state.ready.push_back(Err(classify_transport_error(err)));
                    state.exhausted = true;
                }
                None => {
                    if let Some(event) = state.parser.finish().as_ref().and_then(decode_frame) {
                        state.ready.push_back(event);
                    }
                    state.exhausted = true;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn error_body_with_nested_code_is_classified() {
        let error = error_from_body(
            500,
            r#"{"error": {"code": "CONFIG_MISSING", "message": "OPENAI_API_KEY not set"}}"#,
        );
        assert_eq!(error.kind(), ErrorKind::ConfigMissing);
        assert_eq!(error.message, "OPENAI_API_KEY not set");
        assert_eq!(error.status, Some(500));
    }

    #[test]
    fn error_body_without_json_falls_back_to_status() {
        let error = error_from_body(401, "");
        assert_eq!(error.kind(), ErrorKind::Unauthorized);
        assert_eq!(error.message, "backend responded with status 401");

        let error = error_from_body(502, "bad gateway");
        assert_eq!(error.kind(), ErrorKind::Backend5xx);
        assert_eq!(error.message, "bad gateway");
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let mut config = HttpBackendConfig::new("http://localhost:8787/");
        assert_eq!(config.endpoint(), "http://localhost:8787/v1/coach/stream");
        config.path = "chat".to_string();
        assert_eq!(config.endpoint(), "http://localhost:8787/chat");
    }

    #[test]
    fn empty_base_url_is_config_missing() {
        let error = HttpBackend::new(HttpBackendConfig::default()).expect_err("empty url");
        assert_eq!(error.kind(), ErrorKind::ConfigMissing);
    }
}
