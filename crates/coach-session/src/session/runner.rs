use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use coach_backend::{
    BackendAdapter, BackendError, BackendRequest, ErrorKind, FragmentSource,
    SimulatedChunking, StreamAccumulator, StreamEvent,
};
use coach_trace::{
    CLIENT_TRACE_ID_KEY, TOTAL_DURATION_KEY, TTFT_KEY, TraceData, TraceEvent, TraceEventLog,
    TraceStage,
};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{CompletionHook, SessionAbortHandle, SessionState, StreamError, StreamSession};
use crate::retry::{RetryDecision, RetryRecoveryPolicy};

enum Interrupt {
    Aborted,
    TimedOut(u64),
}

enum AttemptOutcome {
    Completed,
    Aborted,
    Failed(BackendError),
}

/// Await `future` unless the session is aborted or `timeout_ms` elapses
/// first. Dropping the losing branch cancels it.
async fn guarded<F: Future>(
    abort: &SessionAbortHandle,
    timeout_ms: Option<u64>,
    future: F,
) -> Result<F::Output, Interrupt> {
    let bounded = async {
        match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), future)
                .await
                .map_err(|_| Interrupt::TimedOut(ms)),
            None => Ok(future.await),
        }
    };
    tokio::select! {
        biased;
        _ = abort.aborted() => Err(Interrupt::Aborted),
        output = bounded => output,
    }
}

pub(super) struct SessionDriver {
    pub(super) backend: Arc<dyn BackendAdapter>,
    pub(super) trace_log: TraceEventLog,
    pub(super) chunking: SimulatedChunking,
    pub(super) connect_timeout_ms: Option<u64>,
    pub(super) fragment_timeout_ms: Option<u64>,
    pub(super) policy: RetryRecoveryPolicy,
    pub(super) completion_hook: Option<Arc<dyn CompletionHook>>,
    pub(super) abort: SessionAbortHandle,
    pub(super) publisher: watch::Sender<StreamSession>,
    pub(super) request: BackendRequest,
    pub(super) session: StreamSession,
    /// Trace id the session started with; kept on every event recorded
    /// after a backend id replaces it.
    pub(super) client_trace_id: String,
    pub(super) started: Instant,
}

impl SessionDriver {
    pub(super) async fn run(mut self) {
        self.record(
            TraceStage::Received,
            trace_data([
                ("user_id", Value::from(self.request.user_id.clone())),
                (
                    "has_text",
                    Value::from(
                        self.request
                            .text
                            .as_deref()
                            .is_some_and(|text| !text.trim().is_empty()),
                    ),
                ),
                ("attachment_count", Value::from(self.request.attachments.len())),
                ("history_length", Value::from(self.request.history.len())),
            ]),
        );

        if !self.request.has_input() {
            let error = BackendError::new(
                ErrorKind::NoInput,
                "request carries neither text nor attachments",
            );
            self.enter_error(&error, RetryDecision::give_up());
            return;
        }

        loop {
            let error = match self.attempt().await {
                AttemptOutcome::Completed => return,
                AttemptOutcome::Aborted => {
                    self.finish_aborted();
                    return;
                }
                AttemptOutcome::Failed(error) => error,
            };

            let decision = self.policy.decide(error.kind, self.session.attempt_count);
            self.enter_error(&error, decision);
            if !decision.retry {
                return;
            }

            self.record(
                TraceStage::Retrying,
                trace_data([
                    ("attempt", Value::from(self.session.attempt_count + 1)),
                    ("delay_ms", Value::from(decision.delay_ms)),
                    ("kind", Value::from(error.kind.as_str())),
                ]),
            );
            tracing::info!(
                trace_id = %self.session.trace_id,
                attempt = self.session.attempt_count,
                delay_ms = decision.delay_ms,
                kind = %error.kind,
                "retrying backend call"
            );
            let backoff = tokio::time::sleep(Duration::from_millis(decision.delay_ms));
            if guarded(&self.abort, None, backoff).await.is_err() {
                self.finish_aborted();
                return;
            }
        }
    }

    async fn attempt(&mut self) -> AttemptOutcome {
        self.session.attempt_count += 1;
        self.session.fragments.clear();
        self.session.last_error = None;
        self.session.retry_pending = false;
        self.session.simulated = false;
        self.session.metrics = Default::default();
        self.transition(SessionState::Connecting);
        self.publish();
        self.record(
            TraceStage::BackendCallStarted,
            trace_data([
                ("attempt", Value::from(self.session.attempt_count)),
                ("backend", Value::from(self.backend.name())),
            ]),
        );
        tracing::debug!(
            trace_id = %self.session.trace_id,
            attempt = self.session.attempt_count,
            "calling backend"
        );

        let mut request = self.request.clone();
        request.trace_id = Some(self.session.trace_id.clone());
        let invocation = self.backend.invoke(request);
        let source = match guarded(&self.abort, self.connect_timeout_ms, invocation).await {
            Err(Interrupt::Aborted) => return AttemptOutcome::Aborted,
            Err(Interrupt::TimedOut(ms)) => {
                return AttemptOutcome::Failed(BackendError::timeout(format!(
                    "backend handshake exceeded {ms} ms"
                )));
            }
            Ok(Err(error)) => return AttemptOutcome::Failed(error),
            Ok(Ok(source)) => source,
        };
        self.stream(source).await
    }

    async fn stream(&mut self, source: FragmentSource) -> AttemptOutcome {
        if let Some(trace_id) = source.backend_trace_id() {
            self.adopt_trace_id(trace_id);
        }
        self.session.simulated = source.is_simulated();
        self.transition(SessionState::LoadingContext);
        self.publish();

        let mut events = source.into_stream(&self.chunking);
        let mut accumulator = StreamAccumulator::new();
        let mut context_recorded = false;

        loop {
            let event = match guarded(&self.abort, self.fragment_timeout_ms, events.next()).await {
                Err(Interrupt::Aborted) => return AttemptOutcome::Aborted,
                Err(Interrupt::TimedOut(ms)) => {
                    return AttemptOutcome::Failed(BackendError::timeout(format!(
                        "no stream event within {ms} ms"
                    )));
                }
                Ok(None) => {
                    return AttemptOutcome::Failed(BackendError::network(
                        "stream ended without a completion signal",
                    ));
                }
                Ok(Some(Err(error))) => return AttemptOutcome::Failed(error),
                Ok(Some(Ok(event))) => event,
            };
            accumulator.process(&event);

            match event {
                StreamEvent::Context { trace_id, metadata } => {
                    if let Some(trace_id) = trace_id.as_deref() {
                        self.adopt_trace_id(trace_id);
                    }
                    if !context_recorded {
                        context_recorded = true;
                        self.record(TraceStage::ContextReady, metadata);
                    }
                }
                StreamEvent::Fragment { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    self.push_fragment(text);
                }
                StreamEvent::Finish { .. } => break,
            }
        }
        drop(events);

        self.complete(&accumulator).await
    }

    fn push_fragment(&mut self, text: String) {
        if self.session.fragments.is_empty() {
            let ttft = self.elapsed_ms();
            self.session.metrics.time_to_first_fragment_ms = Some(ttft);
            self.record(
                TraceStage::FirstFragment,
                trace_data([
                    (TTFT_KEY, Value::from(ttft)),
                    ("attempt", Value::from(self.session.attempt_count)),
                    ("simulated", Value::from(self.session.simulated)),
                ]),
            );
        }
        self.session.fragments.push(text);
        self.session.metrics.fragment_count = self.session.fragments.len();
        self.transition(SessionState::Streaming);
        self.publish();
    }

    async fn complete(&mut self, accumulator: &StreamAccumulator) -> AttemptOutcome {
        let duration_ms = self.elapsed_ms();
        self.session.metrics.total_duration_ms = Some(duration_ms);
        self.session.metrics.fragment_count = self.session.fragments.len();
        self.session.metrics.fragments_per_second =
            fragments_per_second(self.session.fragments.len(), duration_ms);
        self.transition(SessionState::Completing);
        self.publish();

        let mut data = accumulator.metadata().clone();
        data.insert("duration_ms".to_string(), Value::from(duration_ms));
        data.insert(
            "fragment_count".to_string(),
            Value::from(self.session.fragments.len()),
        );
        data.insert("char_count".to_string(), Value::from(accumulator.char_count()));
        data.insert("simulated".to_string(), Value::from(self.session.simulated));
        data.insert(
            "attempt".to_string(),
            Value::from(self.session.attempt_count),
        );
        if let Some(model) = accumulator.model().or(self.request.model.as_deref()) {
            data.insert("model".to_string(), Value::from(model));
        }
        if let Some(usage) = accumulator.usage() {
            let total = if usage.total_tokens > 0 {
                usage.total_tokens
            } else {
                usage.prompt_tokens + usage.completion_tokens
            };
            data.insert("prompt_tokens".to_string(), Value::from(usage.prompt_tokens));
            data.insert(
                "completion_tokens".to_string(),
                Value::from(usage.completion_tokens),
            );
            data.insert("total_tokens".to_string(), Value::from(total));
        }
        self.record(TraceStage::StreamDone, data);

        if let Some(hook) = self.completion_hook.clone() {
            match guarded(&self.abort, None, hook.on_completed(&self.session)).await {
                Err(_) => return AttemptOutcome::Aborted,
                Ok(Err(error)) => {
                    tracing::warn!(
                        trace_id = %self.session.trace_id,
                        error = %error,
                        "completion hook failed; session still completes"
                    );
                }
                Ok(Ok(())) => {}
            }
        }

        self.transition(SessionState::Completed);
        let metrics = &self.session.metrics;
        let mut data = trace_data([
            (TOTAL_DURATION_KEY, Value::from(duration_ms)),
            ("fragment_count", Value::from(metrics.fragment_count)),
            ("attempt_count", Value::from(self.session.attempt_count)),
        ]);
        if let Some(rate) = metrics.fragments_per_second {
            data.insert("fragments_per_second".to_string(), Value::from(rate));
        }
        self.record(TraceStage::Completed, data);
        self.publish();
        tracing::info!(
            trace_id = %self.session.trace_id,
            attempts = self.session.attempt_count,
            fragments = self.session.fragments.len(),
            duration_ms,
            "session completed"
        );
        AttemptOutcome::Completed
    }

    fn enter_error(&mut self, error: &BackendError, decision: RetryDecision) {
        self.session.last_error = Some(StreamError::from(error));
        self.session.retry_pending = decision.retry;
        if !decision.retry {
            self.session.metrics.total_duration_ms = Some(self.elapsed_ms());
        }
        self.transition(SessionState::Error);

        let mut data = trace_data([
            ("kind", Value::from(error.kind.as_str())),
            ("message", Value::from(error.message.clone())),
            ("attempt", Value::from(self.session.attempt_count)),
            ("will_retry", Value::from(decision.retry)),
        ]);
        if let Some(status) = error.status {
            data.insert("status".to_string(), Value::from(status));
        }
        if decision.retry {
            data.insert("retry_delay_ms".to_string(), Value::from(decision.delay_ms));
        }
        self.record(TraceStage::Error, data);
        self.publish();

        tracing::warn!(
            trace_id = %self.session.trace_id,
            attempt = self.session.attempt_count,
            kind = %error.kind,
            will_retry = decision.retry,
            error = %error.message,
            "backend attempt failed"
        );
    }

    fn finish_aborted(&mut self) {
        self.session.last_error = None;
        self.session.retry_pending = false;
        self.session.metrics.total_duration_ms = Some(self.elapsed_ms());
        self.transition(SessionState::Aborted);
        self.record(
            TraceStage::Aborted,
            trace_data([
                ("attempt", Value::from(self.session.attempt_count)),
                ("fragment_count", Value::from(self.session.fragments.len())),
            ]),
        );
        self.publish();
        tracing::info!(
            trace_id = %self.session.trace_id,
            attempt = self.session.attempt_count,
            "session aborted"
        );
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.session.state.can_transition_to(&next),
            "invalid session transition {} -> {}",
            self.session.state,
            next
        );
        self.session.state = next;
    }

    fn adopt_trace_id(&mut self, trace_id: &str) {
        let trace_id = trace_id.trim();
        if trace_id.is_empty() || trace_id == self.session.trace_id {
            return;
        }
        tracing::debug!(
            client_trace_id = %self.client_trace_id,
            backend_trace_id = %trace_id,
            "adopting backend trace id"
        );
        self.session.trace_id = trace_id.to_string();
        self.publish();
    }

    fn publish(&self) {
        self.publisher.send_replace(self.session.clone());
    }

    fn record(&self, stage: TraceStage, mut data: TraceData) {
        if self.session.trace_id != self.client_trace_id {
            data.insert(
                CLIENT_TRACE_ID_KEY.to_string(),
                Value::from(self.client_trace_id.clone()),
            );
        }
        self.trace_log.record(
            TraceEvent::new(
                self.session.trace_id.clone(),
                self.session.session_id.clone(),
                stage,
            )
            .with_data(data),
        );
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

fn trace_data<const N: usize>(pairs: [(&str, Value); N]) -> TraceData {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn fragments_per_second(fragments: usize, duration_ms: u64) -> Option<f64> {
    (duration_ms > 0).then(|| fragments as f64 / (duration_ms as f64 / 1000.0))
}
