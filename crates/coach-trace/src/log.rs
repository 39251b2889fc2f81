//! Fire-and-forget trace recording.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::store::TraceSink;
use crate::types::TraceEvent;

enum LogCommand {
    Record(TraceEvent),
    Flush(oneshot::Sender<()>),
}

/// Best-effort, ordered recorder in front of a [`TraceSink`].
///
/// `record` only enqueues; a single writer task drains the queue in order
/// and swallows sink failures after logging them. Cloning shares the
/// writer.
#[derive(Clone, Default)]
pub struct TraceEventLog {
    sender: Option<mpsc::UnboundedSender<LogCommand>>,
}

impl TraceEventLog {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn TraceSink>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(sink, receiver));
        Self {
            sender: Some(sender),
        }
    }

    /// A log that drops every event.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn record(&self, event: TraceEvent) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if let Err(mpsc::error::SendError(LogCommand::Record(event))) =
            sender.send(LogCommand::Record(event))
        {
            tracing::debug!(
                trace_id = %event.trace_id,
                stage = %event.stage,
                "trace writer stopped; event dropped"
            );
        }
    }

    /// Resolves once every event recorded before this call has been offered
    /// to the sink.
    pub async fn flush(&self) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if sender.send(LogCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(sink: Arc<dyn TraceSink>, mut receiver: mpsc::UnboundedReceiver<LogCommand>) {
    while let Some(command) = receiver.recv().await {
        match command {
            LogCommand::Record(event) => {
                if let Err(err) = sink.append(&event).await {
                    tracing::warn!(
                        trace_id = %event.trace_id,
                        session_id = %event.session_id,
                        stage = %event.stage,
                        error = %err,
                        "trace sink append failed; event dropped"
                    );
                }
            }
            LogCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTraceSink;
    use crate::store::{TraceStoreError, TraceStoreResult};
    use crate::types::TraceStage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSink {
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TraceSink for FailingSink {
        async fn append(&self, _event: &TraceEvent) -> TraceStoreResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TraceStoreError::Unavailable("collector offline".to_string()))
        }

        async fn events_since(&self, _since_ms: u64) -> TraceStoreResult<Vec<TraceEvent>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn recorded_events_reach_sink_in_order() {
        let sink = MemoryTraceSink::new();
        let log = TraceEventLog::spawn(Arc::new(sink.clone()));
        for stage in [
            TraceStage::Received,
            TraceStage::BackendCallStarted,
            TraceStage::FirstFragment,
            TraceStage::StreamDone,
        ] {
            log.record(TraceEvent::new("t", "s", stage));
        }
        log.flush().await;

        let stages: Vec<_> = sink.snapshot().iter().map(|event| event.stage).collect();
        assert_eq!(
            stages,
            vec![
                TraceStage::Received,
                TraceStage::BackendCallStarted,
                TraceStage::FirstFragment,
                TraceStage::StreamDone,
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sink_failures_are_swallowed() {
        let sink = Arc::new(FailingSink {
            attempts: AtomicUsize::new(0),
        });
        let log = TraceEventLog::spawn(sink.clone());
        log.record(TraceEvent::new("t", "s", TraceStage::Received));
        log.record(TraceEvent::new("t", "s", TraceStage::Error));
        log.flush().await;

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
        log.record(TraceEvent::new("t", "s", TraceStage::Aborted));
        log.flush().await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disabled_log_accepts_and_drops() {
        let log = TraceEventLog::disabled();
        assert!(!log.is_enabled());
        log.record(TraceEvent::new("t", "s", TraceStage::Received));
        log.flush().await;
    }
}
