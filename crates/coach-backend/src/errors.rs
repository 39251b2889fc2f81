//! Error taxonomy shared by every backend adapter.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Classification of a failed model invocation.
///
/// Fatal kinds describe problems a retry cannot fix; everything else is
/// treated as transient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "NO_INPUT")]
    NoInput,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "CONFIG_MISSING")]
    ConfigMissing,
    #[serde(rename = "NETWORK")]
    Network,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "BACKEND_5XX")]
    Backend5xx,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoInput => "NO_INPUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ConfigMissing => "CONFIG_MISSING",
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::Backend5xx => "BACKEND_5XX",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoInput | Self::Unauthorized | Self::ConfigMissing)
    }

    pub fn is_transient(&self) -> bool {
        !self.is_fatal()
    }

    /// Message suitable for showing to the person chatting with the coach.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NoInput => "Please enter a message or attach a file.",
            Self::Unauthorized => "Your session has expired. Please sign in again.",
            Self::ConfigMissing => "The coach is not configured correctly right now.",
            Self::Network => "Connection problem. Check your network and try again.",
            Self::Timeout => "The coach took too long to answer.",
            Self::Backend5xx => "The coach service is having trouble right now.",
            Self::Unknown => "Something went wrong while answering.",
        }
    }

    /// Parse a wire error code (`"BACKEND_5XX"`, `"unauthorized"`, ...).
    pub fn from_code(code: &str) -> Option<Self> {
        let normalized = code.trim().to_ascii_uppercase().replace('-', "_");
        let kind = match normalized.as_str() {
            "NO_INPUT" => Self::NoInput,
            "UNAUTHORIZED" => Self::Unauthorized,
            "CONFIG_MISSING" => Self::ConfigMissing,
            "NETWORK" => Self::Network,
            "TIMEOUT" => Self::Timeout,
            "BACKEND_5XX" => Self::Backend5xx,
            "UNKNOWN" => Self::Unknown,
            _ => return None,
        };
        Some(kind)
    }

    /// Map an HTTP status to a kind, if the status alone is conclusive.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 | 403 => Some(Self::Unauthorized),
            408 => Some(Self::Timeout),
            500..=599 => Some(Self::Backend5xx),
            _ => None,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure reported by a backend invocation or its fragment stream.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigMissing, message)
    }

    pub fn backend_5xx(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend5xx, message).with_status(status)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Classify an HTTP failure. An explicit error code in the body wins
    /// over the status line.
    pub fn from_response(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        let kind = code
            .and_then(ErrorKind::from_code)
            .or_else(|| ErrorKind::from_status(status))
            .unwrap_or(ErrorKind::Unknown);
        Self::new(kind, message).with_status(status)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_and_transient_kinds_are_disjoint() {
        let fatal = [
            ErrorKind::NoInput,
            ErrorKind::Unauthorized,
            ErrorKind::ConfigMissing,
        ];
        let transient = [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::Backend5xx,
            ErrorKind::Unknown,
        ];
        assert!(fatal.iter().all(|kind| kind.is_fatal() && !kind.is_transient()));
        assert!(transient.iter().all(|kind| kind.is_transient()));
    }

    #[test]
    fn error_kind_serializes_as_wire_code() {
        let raw = serde_json::to_string(&ErrorKind::Backend5xx).expect("serialize");
        assert_eq!(raw, "\"BACKEND_5XX\"");
        let parsed: ErrorKind = serde_json::from_str("\"CONFIG_MISSING\"").expect("deserialize");
        assert_eq!(parsed, ErrorKind::ConfigMissing);
    }

    #[test]
    fn from_response_prefers_body_code_over_status() {
        let error = BackendError::from_response(500, Some("config_missing"), "no api key");
        assert_eq!(error.kind(), ErrorKind::ConfigMissing);
        assert_eq!(error.status, Some(500));

        let error = BackendError::from_response(503, None, "overloaded");
        assert_eq!(error.kind(), ErrorKind::Backend5xx);

        let error = BackendError::from_response(403, Some("nonsense"), "denied");
        assert_eq!(error.kind(), ErrorKind::Unauthorized);

        let error = BackendError::from_response(429, None, "slow down");
        assert_eq!(error.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let error = BackendError::timeout("no response in 30000 ms");
        assert_eq!(error.to_string(), "TIMEOUT: no response in 30000 ms");
    }
}
