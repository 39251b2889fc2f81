//! Session controller: one spawned driver task per "ask the coach" turn.

mod runner;
mod types;

pub use types::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use coach_backend::{BackendAdapter, BackendRequest};
use coach_trace::TraceEventLog;
use tokio::sync::{Notify, watch};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::errors::SessionError;
use crate::retry::RetryRecoveryPolicy;
use runner::SessionDriver;

/// Runs after the backend signalled completion and before the session is
/// published as `Completed`. Failures are logged and do not fail the
/// session.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_completed(&self, session: &StreamSession) -> Result<(), SessionError>;
}

/// Cooperative cancellation flag shared between a handle and its driver.
#[derive(Clone, Debug, Default)]
pub struct SessionAbortHandle {
    abort_requested: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
}

impl SessionAbortHandle {
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Resolves once an abort has been requested.
    pub async fn aborted(&self) {
        loop {
            let notified = self.abort_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_abort_requested() {
                return;
            }
            notified.await;
        }
    }
}

pub struct StreamSessionController {
    backend: Arc<dyn BackendAdapter>,
    trace_log: TraceEventLog,
    config: StreamConfig,
    policy: RetryRecoveryPolicy,
    completion_hook: Option<Arc<dyn CompletionHook>>,
}

impl StreamSessionController {
    pub fn new(
        backend: Arc<dyn BackendAdapter>,
        trace_log: TraceEventLog,
        config: StreamConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let policy = RetryRecoveryPolicy::new(config.retry.clone());
        Ok(Self {
            backend,
            trace_log,
            config,
            policy,
            completion_hook: None,
        })
    }

    pub fn with_completion_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.completion_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryRecoveryPolicy {
        &self.policy
    }

    /// Spawn the driver for one turn. Must be called inside a tokio runtime.
    pub fn start(&self, request: BackendRequest) -> StreamHandle {
        let trace_id = request
            .trace_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = StreamSession::new(trace_id.clone());
        let session_id = session.session_id.clone();
        let (publisher, snapshots) = watch::channel(session.clone());
        let abort = SessionAbortHandle::default();

        let driver = SessionDriver {
            backend: self.backend.clone(),
            trace_log: self.trace_log.clone(),
            chunking: self.config.chunking(),
            connect_timeout_ms: self.config.connect_timeout_ms,
            fragment_timeout_ms: self.config.fragment_timeout_ms,
            policy: self.policy.clone(),
            completion_hook: self.completion_hook.clone(),
            abort: abort.clone(),
            publisher,
            request,
            session,
            client_trace_id: trace_id,
            started: tokio::time::Instant::now(),
        };
        let span = tracing::info_span!(
            "coach_session",
            session_id = %session_id,
            backend = %self.backend.name()
        );
        tokio::spawn(driver.run().instrument(span));

        StreamHandle {
            session_id,
            snapshots,
            abort,
            policy: self.policy.clone(),
        }
    }
}

/// Caller-side view of a running session. Cloning shares the session.
#[derive(Clone)]
pub struct StreamHandle {
    session_id: String,
    snapshots: watch::Receiver<StreamSession>,
    abort: SessionAbortHandle,
    policy: RetryRecoveryPolicy,
}

impl StreamHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn trace_id(&self) -> String {
        self.snapshots.borrow().trace_id.clone()
    }

    pub fn snapshot(&self) -> StreamSession {
        self.snapshots.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshots.borrow().is_terminal()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<StreamSession> {
        self.snapshots.clone()
    }

    pub fn can_retry(&self) -> bool {
        self.policy.can_retry(&self.snapshots.borrow())
    }

    pub fn abort_handle(&self) -> SessionAbortHandle {
        self.abort.clone()
    }

    /// Resolves with the terminal snapshot.
    pub async fn wait(&self) -> Result<StreamSession, SessionError> {
        let mut snapshots = self.snapshots.clone();
        loop {
            {
                let current = snapshots.borrow_and_update();
                if current.is_terminal() {
                    return Ok(current.clone());
                }
            }
            if snapshots.changed().await.is_err() {
                let last = snapshots.borrow().clone();
                return if last.is_terminal() {
                    Ok(last)
                } else {
                    Err(SessionError::DriverLost)
                };
            }
        }
    }

    /// Cancel the session and wait for its terminal snapshot. On a session
    /// that already finished this returns the final snapshot unchanged.
    pub async fn stop(&self) -> Result<StreamSession, SessionError> {
        let current = self.snapshot();
        if current.is_terminal() {
            return Ok(current);
        }
        self.abort.request_abort();
        self.wait().await
    }
}
