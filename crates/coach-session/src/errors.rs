use thiserror::Error;

/// Top-level error type for the coach-session crate.
///
/// Backend failures are not errors at this level: they end up in the
/// session snapshot as `last_error`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("session driver stopped before reaching a terminal state")]
    DriverLost,
    #[error("completion hook failed: {0}")]
    Hook(String),
}
