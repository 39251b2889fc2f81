use coach_backend::ErrorKind;
use serde::{Deserialize, Serialize};

use crate::session::{SessionState, StreamSession};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_ms: u64,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay_ms: 0,
        }
    }

    pub fn after(delay_ms: u64) -> Self {
        Self {
            retry: true,
            delay_ms,
        }
    }
}

/// Linear backoff: `base_delay_ms * attempt`, capped at `max_delay_ms`.
pub fn delay_for_attempt_ms(attempt: u32, config: &RetryConfig) -> u64 {
    config
        .base_delay_ms
        .saturating_mul(u64::from(attempt))
        .min(config.max_delay_ms)
}

/// Decide whether the attempt that just failed with `kind` gets a successor.
/// `attempt_count` counts the attempts started so far.
pub fn decide(kind: ErrorKind, attempt_count: u32, config: &RetryConfig) -> RetryDecision {
    if kind.is_fatal() || attempt_count >= config.max_attempts {
        return RetryDecision::give_up();
    }
    RetryDecision::after(delay_for_attempt_ms(attempt_count, config))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryRecoveryPolicy {
    config: RetryConfig,
}

impl RetryRecoveryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn decide(&self, kind: ErrorKind, attempt_count: u32) -> RetryDecision {
        decide(kind, attempt_count, &self.config)
    }

    /// Whether a retry affordance makes sense for this snapshot.
    pub fn can_retry(&self, session: &StreamSession) -> bool {
        session.state == SessionState::Error
            && session
                .last_error
                .as_ref()
                .is_some_and(|error| error.kind.is_transient())
            && session.attempt_count < self.config.max_attempts
    }
}
