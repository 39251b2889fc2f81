use std::collections::HashMap;
use std::sync::Arc;

use coach_backend::BackendRequest;
use tokio::sync::Mutex;

use crate::errors::SessionError;
use crate::session::{StreamHandle, StreamSessionController};

/// Live sessions keyed by conversation context. Starting a session for a
/// context first cancels the one already running there and waits for it
/// to publish its terminal snapshot.
pub struct SessionRegistry {
    controller: Arc<StreamSessionController>,
    sessions: Mutex<HashMap<String, StreamHandle>>,
}

impl SessionRegistry {
    pub fn new(controller: Arc<StreamSessionController>) -> Self {
        Self {
            controller,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn controller(&self) -> &Arc<StreamSessionController> {
        &self.controller
    }

    pub async fn start(
        &self,
        context_id: &str,
        request: BackendRequest,
    ) -> Result<StreamHandle, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(context_id) {
            if !previous.is_terminal() {
                tracing::debug!(
                    context_id,
                    session_id = %previous.session_id(),
                    "superseding live session"
                );
                previous.stop().await?;
            }
        }
        let handle = self.controller.start(request);
        sessions.insert(context_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Stop the context's session, if any, and forget it.
    pub async fn stop(&self, context_id: &str) -> Result<(), SessionError> {
        let previous = self.sessions.lock().await.remove(context_id);
        if let Some(previous) = previous {
            previous.stop().await?;
        }
        Ok(())
    }

    pub async fn get(&self, context_id: &str) -> Option<StreamHandle> {
        self.sessions.lock().await.get(context_id).cloned()
    }

    /// Drop handles whose sessions already finished.
    pub async fn prune_terminal(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.is_terminal());
        before - sessions.len()
    }

    pub async fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|handle| !handle.is_terminal())
            .count()
    }
}
