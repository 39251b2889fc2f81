//! Resilient streaming sessions for the coach assistant.
//!
//! A [`StreamSessionController`] drives one user turn against a
//! [`coach_backend::BackendAdapter`]: it connects, streams fragments,
//! retries transient failures with linear backoff, honours cancellation at
//! every suspension point and records a trace event at each transition.
//! [`SessionRegistry`] keeps at most one live session per conversation.

pub mod config;
pub mod errors;
pub mod registry;
pub mod retry;
pub mod session;

pub use config::*;
pub use errors::*;
pub use registry::*;
pub use retry::*;
pub use session::*;
