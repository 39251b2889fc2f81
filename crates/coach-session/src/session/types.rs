use coach_backend::{BackendError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    LoadingContext,
    Streaming,
    Completing,
    Completed,
    Error,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::LoadingContext => "loading_context",
            Self::Streaming => "streaming",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        match self {
            SessionState::Completed | SessionState::Aborted => false,
            _ if *next == SessionState::Aborted => true,
            SessionState::Idle => matches!(next, SessionState::Connecting | SessionState::Error),
            SessionState::Connecting => {
                matches!(next, SessionState::LoadingContext | SessionState::Error)
            }
            SessionState::LoadingContext => matches!(
                next,
                SessionState::Streaming | SessionState::Completing | SessionState::Error
            ),
            SessionState::Streaming => matches!(
                next,
                SessionState::Streaming | SessionState::Completing | SessionState::Error
            ),
            SessionState::Completing => matches!(next, SessionState::Completed),
            SessionState::Error => matches!(next, SessionState::Connecting),
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error a session ended (or is about to retry) with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

impl From<&BackendError> for StreamError {
    fn from(error: &BackendError) -> Self {
        Self::new(error.kind, error.message.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Milliseconds from session start to the first fragment of the
    /// current attempt.
    pub time_to_first_fragment_ms: Option<u64>,
    pub total_duration_ms: Option<u64>,
    pub fragment_count: usize,
    pub fragments_per_second: Option<f64>,
}

/// One "ask the coach" turn as seen from outside the driver task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub session_id: String,
    /// Client-generated until the backend reports its own id.
    pub trace_id: String,
    pub state: SessionState,
    /// Fragments of the current attempt, in arrival order.
    pub fragments: Vec<String>,
    pub attempt_count: u32,
    pub last_error: Option<StreamError>,
    /// Set while an `Error` state is waiting out a retry delay.
    pub retry_pending: bool,
    /// The current attempt's fragments were cut from a buffered answer.
    pub simulated: bool,
    pub metrics: SessionMetrics,
}

pub type SessionSnapshot = StreamSession;

impl StreamSession {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            state: SessionState::Idle,
            fragments: Vec::new(),
            attempt_count: 0,
            last_error: None,
            retry_pending: false,
            simulated: false,
            metrics: SessionMetrics::default(),
        }
    }

    pub fn content(&self) -> String {
        self.fragments.concat()
    }

    /// No further snapshots will follow this one.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            SessionState::Completed | SessionState::Aborted => true,
            SessionState::Error => !self.retry_pending,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        let path = [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::LoadingContext,
            SessionState::Streaming,
            SessionState::Streaming,
            SessionState::Completing,
            SessionState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(&pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn terminal_states_are_final_and_abort_is_reachable_from_live_states() {
        for live in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::LoadingContext,
            SessionState::Streaming,
            SessionState::Completing,
            SessionState::Error,
        ] {
            assert!(live.can_transition_to(&SessionState::Aborted));
        }
        assert!(!SessionState::Completed.can_transition_to(&SessionState::Aborted));
        assert!(!SessionState::Aborted.can_transition_to(&SessionState::Connecting));
        assert!(SessionState::Error.can_transition_to(&SessionState::Connecting));
        assert!(!SessionState::Idle.can_transition_to(&SessionState::Streaming));
        assert!(!SessionState::Completing.can_transition_to(&SessionState::Error));
    }

    #[test]
    fn error_is_terminal_only_without_pending_retry() {
        let mut session = StreamSession::new("t");
        session.state = SessionState::Error;
        session.retry_pending = true;
        assert!(!session.is_terminal());
        session.retry_pending = false;
        assert!(session.is_terminal());
    }

    #[test]
    fn content_joins_fragments_in_order() {
        let mut session = StreamSession::new("t");
        session.fragments = vec!["Du hast ".into(), "1200 kcal ".into(), "übrig.".into()];
        assert_eq!(session.content(), "Du hast 1200 kcal übrig.");
        assert_eq!(session.state.to_string(), "idle");
    }
}
