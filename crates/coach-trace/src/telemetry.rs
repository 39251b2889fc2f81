//! Rolling-window reduction of trace events into dashboard metrics.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pricing::PricingTable;
use crate::store::{TraceSink, TraceStoreResult};
use crate::types::{TraceDataExt, TraceEvent, TraceStage};

pub const TTFT_KEY: &str = "time_to_first_fragment_ms";
pub const TOTAL_DURATION_KEY: &str = "total_duration_ms";
/// Set on events recorded after a backend-issued trace id replaced the
/// client one, so both ids resolve to the same session.
pub const CLIENT_TRACE_ID_KEY: &str = "client_trace_id";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }

    fn severity(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }

    fn max_by_severity(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub avg_time_to_first_fragment_ms: f64,
    pub p95_time_to_first_fragment_ms: u64,
    pub avg_total_duration_ms: f64,
    pub p95_total_duration_ms: u64,
    pub time_to_first_fragment_samples: usize,
    pub total_duration_samples: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    pub total_cost: f64,
    pub avg_cost_per_request: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityMetrics {
    pub request_count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    pub rag_hit_rate: f64,
    pub circuit_state: CircuitState,
    pub retry_count: usize,
    pub retry_rate: f64,
}

/// Pass-through aggregates of backend-reported fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub avg_sentiment_score: Option<f64>,
    pub pii_detected_count: usize,
    pub persona_usage: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub latency: LatencyMetrics,
    pub cost: CostMetrics,
    pub reliability: ReliabilityMetrics,
    pub quality: QualityMetrics,
}

/// 95th percentile by the nearest-rank method. Empty input yields 0.
pub fn percentile_95(samples: &[u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn average(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|v| *v as f64).sum::<f64>() / samples.len() as f64
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn breaker_signal(event: &TraceEvent) -> CircuitState {
    match event.data.get_str("circuit_state") {
        Some("open") => return CircuitState::Open,
        Some("half_open") => return CircuitState::HalfOpen,
        _ => {}
    }
    if event.data.get_bool("breaker_open") == Some(true) {
        CircuitState::Open
    } else if event.data.get_bool("breaker_half_open") == Some(true) {
        CircuitState::HalfOpen
    } else {
        CircuitState::Closed
    }
}

/// Reduce a window of events. Fields that are missing or mistyped are
/// skipped individually; the rest of the event still counts.
pub fn aggregate(events: &[TraceEvent], pricing: &PricingTable) -> AggregatedMetrics {
    let mut ttft = Vec::new();
    let mut durations = Vec::new();
    let mut cost = CostMetrics::default();
    let mut requests = 0usize;
    let mut errors = 0usize;
    let mut retries = 0usize;
    let mut cache = HitCounter::default();
    let mut rag = HitCounter::default();
    let mut circuit_state = CircuitState::Closed;
    let mut sentiment = Vec::new();
    let mut quality = QualityMetrics::default();

    for event in events {
        let data = &event.data;
        match event.stage {
            TraceStage::Received => requests += 1,
            TraceStage::Retrying => retries += 1,
            TraceStage::Error if data.get_bool("will_retry") != Some(true) => errors += 1,
            _ => {}
        }

        if let Some(value) = data.get_u64(TTFT_KEY) {
            ttft.push(value);
        }
        if let Some(value) = data.get_u64(TOTAL_DURATION_KEY) {
            durations.push(value);
        }

        let prompt = data.get_u64("prompt_tokens");
        let completion = data.get_u64("completion_tokens");
        if prompt.is_some() || completion.is_some() {
            let prompt = prompt.unwrap_or(0);
            let completion = completion.unwrap_or(0);
            cost.prompt_tokens += prompt;
            cost.completion_tokens += completion;
            cost.total_tokens += data
                .get_u64("total_tokens")
                .unwrap_or(prompt + completion);
            if let Some(model) = data.get_str("model") {
                cost.total_cost += pricing.cost(model, prompt, completion);
            }
        }

        // stream_done carries the merged context and finish metadata once
        // per answered request.
        if event.stage == TraceStage::StreamDone {
            cache.observe(data.get_bool("cache_hit"));
            rag.observe(data.get_bool("rag_hit"));
        }

        circuit_state = circuit_state.max_by_severity(breaker_signal(event));

        if let Some(score) = data.get_f64("sentiment_score") {
            sentiment.push(score);
        }
        if data.get_bool("pii_detected") == Some(true) {
            quality.pii_detected_count += 1;
        }
        if let Some(persona) = data.get_str("persona").filter(|p| !p.trim().is_empty()) {
            *quality.persona_usage.entry(persona.to_string()).or_default() += 1;
        }
    }

    cost.avg_cost_per_request = if requests == 0 {
        0.0
    } else {
        cost.total_cost / requests as f64
    };
    if !sentiment.is_empty() {
        quality.avg_sentiment_score = Some(sentiment.iter().sum::<f64>() / sentiment.len() as f64);
    }

    AggregatedMetrics {
        latency: LatencyMetrics {
            avg_time_to_first_fragment_ms: average(&ttft),
            p95_time_to_first_fragment_ms: percentile_95(&ttft),
            avg_total_duration_ms: average(&durations),
            p95_total_duration_ms: percentile_95(&durations),
            time_to_first_fragment_samples: ttft.len(),
            total_duration_samples: durations.len(),
        },
        cost,
        reliability: ReliabilityMetrics {
            request_count: requests,
            error_count: errors,
            error_rate: ratio(errors, requests),
            cache_hit_rate: cache.rate(),
            rag_hit_rate: rag.rate(),
            circuit_state,
            retry_count: retries,
            retry_rate: ratio(retries, requests),
        },
        quality,
    }
}

#[derive(Default)]
struct HitCounter {
    flagged: usize,
    hits: usize,
}

impl HitCounter {
    fn observe(&mut self, flag: Option<bool>) {
        if let Some(hit) = flag {
            self.flagged += 1;
            self.hits += usize::from(hit);
        }
    }

    fn rate(&self) -> f64 {
        ratio(self.hits, self.flagged)
    }
}

/// Computes [`AggregatedMetrics`] over the events a sink holds.
#[derive(Clone)]
pub struct TelemetryAggregator {
    source: Arc<dyn TraceSink>,
    pricing: PricingTable,
}

impl TelemetryAggregator {
    pub fn new(source: Arc<dyn TraceSink>, pricing: PricingTable) -> Self {
        Self { source, pricing }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub async fn compute_metrics(&self, since_ms: u64) -> TraceStoreResult<AggregatedMetrics> {
        let events = self.source.events_since(since_ms).await?;
        let metrics = aggregate(&events, &self.pricing);
        tracing::debug!(
            since_ms,
            events = events.len(),
            requests = metrics.reliability.request_count,
            circuit_state = %metrics.reliability.circuit_state,
            "computed telemetry window"
        );
        Ok(metrics)
    }
}
