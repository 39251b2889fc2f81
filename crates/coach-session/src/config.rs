use serde::{Deserialize, Serialize};
use std::env;

use coach_backend::SimulatedChunking;

use crate::errors::SessionError;
use crate::retry::RetryConfig;

pub const ENV_PREFIX: &str = "COACH_STREAM_";

/// Runtime configuration shared by every session a controller starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub retry: RetryConfig,
    /// Upper bound for the backend handshake. `None` waits indefinitely.
    pub connect_timeout_ms: Option<u64>,
    /// Upper bound between two stream events.
    pub fragment_timeout_ms: Option<u64>,
    pub simulated_chunk_chars: usize,
    pub simulated_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let chunking = SimulatedChunking::default();
        Self {
            retry: RetryConfig::default(),
            connect_timeout_ms: Some(30_000),
            fragment_timeout_ms: Some(30_000),
            simulated_chunk_chars: chunking.chunk_chars,
            simulated_delay_ms: chunking.delay_ms,
        }
    }
}

impl StreamConfig {
    /// Defaults overlaid with `COACH_STREAM_*` environment variables.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by the full
    /// variable name. Timeouts accept `0` or `off` to disable them.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SessionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .map(|raw| (name, raw))
        };

        let mut config = Self::default();
        if let Some((name, raw)) = read("MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_number(&name, &raw)?;
        }
        if let Some((name, raw)) = read("BASE_DELAY_MS") {
            config.retry.base_delay_ms = parse_number(&name, &raw)?;
        }
        if let Some((name, raw)) = read("MAX_DELAY_MS") {
            config.retry.max_delay_ms = parse_number(&name, &raw)?;
        }
        if let Some((name, raw)) = read("CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = parse_timeout(&name, &raw)?;
        }
        if let Some((name, raw)) = read("FRAGMENT_TIMEOUT_MS") {
            config.fragment_timeout_ms = parse_timeout(&name, &raw)?;
        }
        if let Some((name, raw)) = read("SIMULATED_CHUNK_CHARS") {
            config.simulated_chunk_chars = parse_number(&name, &raw)?;
        }
        if let Some((name, raw)) = read("SIMULATED_DELAY_MS") {
            config.simulated_delay_ms = parse_number(&name, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.retry.max_attempts == 0 {
            return Err(SessionError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(SessionError::InvalidConfiguration(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.simulated_chunk_chars == 0 {
            return Err(SessionError::InvalidConfiguration(
                "simulated_chunk_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chunking(&self) -> SimulatedChunking {
        SimulatedChunking {
            chunk_chars: self.simulated_chunk_chars,
            delay_ms: self.simulated_delay_ms,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, SessionError> {
    raw.parse().map_err(|_| {
        SessionError::InvalidConfiguration(format!("{name} must be a non-negative integer, got '{raw}'"))
    })
}

fn parse_timeout(name: &str, raw: &str) -> Result<Option<u64>, SessionError> {
    if raw.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let value: u64 = parse_number(name, raw)?;
    Ok((value > 0).then_some(value))
}
