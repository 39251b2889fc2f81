mod support;

use coach_backend::{BackendError, BackendRequest, StreamEvent, Usage};
use coach_session::StreamSessionController;
use coach_trace::{
    CircuitState, FsTraceSink, PricingTable, TelemetryAggregator, TraceEventLog, TraceSink,
};
use serde_json::json;
use std::sync::Arc;
use support::{Script, SequenceBackend, quiet_config};
use tempfile::tempdir;

fn finish_with(model: &str, usage: Usage, metadata: serde_json::Value) -> StreamEvent {
    StreamEvent::Finish {
        usage: Some(usage),
        model: Some(model.to_string()),
        metadata: metadata.as_object().cloned().unwrap_or_default(),
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sessions_recorded_to_file_sink_aggregate_into_metrics() {
    let dir = tempdir().expect("temp dir should be created");
    let sink = Arc::new(FsTraceSink::new(dir.path()).expect("sink should open"));
    let trace_log = TraceEventLog::spawn(sink.clone());

    let backend = SequenceBackend::new(vec![
        Script::Stream(vec![
            Ok(StreamEvent::Context {
                trace_id: None,
                metadata: json!({"rag_hit": true})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            }),
            Ok(StreamEvent::fragment("Du hast ")),
            Ok(StreamEvent::fragment("1200 kcal übrig.")),
            Ok(finish_with(
                "gpt-4o",
                Usage::new(1_000, 1_000),
                json!({"cache_hit": true, "circuit_state": "closed"}),
            )),
        ]),
        Script::Fail(BackendError::backend_5xx(503, "overloaded")),
        Script::Stream(vec![
            Ok(StreamEvent::fragment("Trink Wasser.")),
            Ok(finish_with(
                "unreleased-model",
                Usage::new(400, 100),
                json!({"cache_hit": false, "circuit_state": "half_open"}),
            )),
        ]),
        Script::Fail(BackendError::unauthorized("expired")),
    ]);
    let controller =
        StreamSessionController::new(Arc::new(backend), trace_log.clone(), quiet_config())
            .expect("controller should build");

    for question in ["Kalorien?", "Wasser?", "Schlaf?"] {
        controller
            .start(BackendRequest::text("user-1", question))
            .wait()
            .await
            .expect("session should finish");
    }
    controller
        .start(BackendRequest::new("user-1"))
        .wait()
        .await
        .expect("empty request should finish");
    trace_log.flush().await;

    let aggregator = TelemetryAggregator::new(sink.clone(), PricingTable::default());
    let metrics = aggregator.compute_metrics(0).await.expect("metrics");

    let reliability = &metrics.reliability;
    assert_eq!(reliability.request_count, 4);
    assert_eq!(reliability.retry_count, 1);
    assert_eq!(reliability.error_count, 2);
    assert!((reliability.error_rate - 0.5).abs() < 1e-12);
    assert!((reliability.cache_hit_rate - 0.5).abs() < 1e-12);
    assert!((reliability.rag_hit_rate - 1.0).abs() < 1e-12);
    assert_eq!(reliability.circuit_state, CircuitState::HalfOpen);

    assert!((metrics.cost.total_cost - 0.02).abs() < 1e-12);
    assert_eq!(metrics.cost.prompt_tokens, 1_400);
    assert_eq!(metrics.cost.completion_tokens, 1_100);
    assert_eq!(metrics.cost.total_tokens, 2_500);

    assert_eq!(metrics.latency.time_to_first_fragment_samples, 2);
    assert_eq!(metrics.latency.total_duration_samples, 2);
    assert!(metrics.latency.p95_total_duration_ms >= 1_000);

    let stored = sink.events_since(0).await.expect("read back");
    assert!(!stored.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn empty_window_reports_zero_metrics() {
    let dir = tempdir().expect("temp dir should be created");
    let sink = Arc::new(FsTraceSink::new(dir.path()).expect("sink should open"));
    let aggregator = TelemetryAggregator::new(sink, PricingTable::default());

    let metrics = aggregator.compute_metrics(0).await.expect("metrics");
    assert_eq!(metrics.reliability.request_count, 0);
    assert_eq!(metrics.reliability.error_rate, 0.0);
    assert_eq!(metrics.latency.p95_time_to_first_fragment_ms, 0);
    assert_eq!(metrics.cost.total_cost, 0.0);
    assert_eq!(metrics.reliability.circuit_state, CircuitState::Closed);
}
