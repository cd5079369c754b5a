//! Unified session ending.
//!
//! A session ends exactly once, by whichever comes first: a local abort, an
//! engine terminal message, the execution timeout or the engine process
//! exiting. [`AbortCoordinator`] records that end, answers any pending request
//! with `BeamlineAbort` and pushes the stop sentinel to the dispatch loop.
//! Every later attempt is a no-op.

use crate::correlation::{CorrelationRegistry, Reply};
use crate::dispatch::{QueueItem, QueueSender};
use crate::messages::Issue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// Engine sent `WorkflowCompleted`.
    Completed(Vec<Issue>),
    /// Engine sent `WorkflowAborted`.
    EngineAborted(Vec<Issue>),
    /// Engine sent `WorkflowFailed`.
    Failed(Vec<Issue>),
    /// Beamline side aborted, with the logged reason.
    Aborted(String),
}

impl SessionEnd {
    /// Only `WorkflowCompleted` counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, issues) = match self {
            Self::Aborted(reason) => return write!(f, "Aborted: {reason}"),
            Self::Completed(issues) => ("WorkflowCompleted", issues),
            Self::EngineAborted(issues) => ("WorkflowAborted", issues),
            Self::Failed(issues) => ("WorkflowFailed", issues),
        };
        write!(f, "{label}")?;
        for issue in issues {
            write!(f, "; {}: {}", issue.component, issue.message)?;
        }
        Ok(())
    }
}

struct Inner {
    end: Mutex<Option<SessionEnd>>,
    registry: Arc<CorrelationRegistry>,
    queue: QueueSender,
    ended: watch::Sender<bool>,
}

/// Cloneable handle that ends the current session.
#[derive(Clone)]
pub struct AbortCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for AbortCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortCoordinator")
            .field("end", &*self.inner.end.lock())
            .finish()
    }
}

impl AbortCoordinator {
    /// Coordinator for one session.
    pub fn new(registry: Arc<CorrelationRegistry>, queue: QueueSender) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                end: Mutex::new(None),
                registry,
                queue,
                ended,
            }),
        }
    }

    /// Aborts the session from the beamline side.
    ///
    /// Returns `true` if this call ended the session, `false` if it had
    /// already ended.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !self.record(SessionEnd::Aborted(reason.clone())) {
            debug!(%reason, "Abort ignored, session already ended");
            return false;
        }
        warn!(%reason, "Workflow aborted from beamline");
        self.answer_pending(&reason);
        self.stop_dispatch();
        true
    }

    /// Ends the session on an engine terminal message.
    pub fn conclude(&self, end: SessionEnd) -> bool {
        let summary = end.to_string();
        if !self.record(end) {
            debug!(%summary, "Terminal message ignored, session already ended");
            return false;
        }
        info!(%summary, "Workflow engine finished");
        self.answer_pending(&summary);
        self.stop_dispatch();
        true
    }

    /// Whether the session has ended.
    pub fn is_ended(&self) -> bool {
        self.inner.end.lock().is_some()
    }

    /// How the session ended, once it has.
    pub fn end(&self) -> Option<SessionEnd> {
        self.inner.end.lock().clone()
    }

    /// Resolves once the session has ended.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    fn record(&self, end: SessionEnd) -> bool {
        let mut slot = self.inner.end.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(end);
        true
    }

    fn answer_pending(&self, reason: &str) {
        if let Some(pending) = self.inner.registry.unfilled_request() {
            if pending.mailbox.fill(Reply::Abort(reason.to_string())) {
                debug!(
                    correlation_id = %pending.correlation_id,
                    "Pending request answered with BeamlineAbort"
                );
            }
        }
    }

    fn stop_dispatch(&self) {
        // A closed queue means the loop is already gone.
        let _ = self.inner.queue.send(QueueItem::Stop);
        self.inner.ended.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CorrelationId, Response};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    fn coordinator() -> (
        AbortCoordinator,
        Arc<CorrelationRegistry>,
        mpsc::UnboundedReceiver<QueueItem>,
    ) {
        let registry = Arc::new(CorrelationRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (AbortCoordinator::new(registry.clone(), tx), registry, rx)
    }

    #[test]
    fn test_abort_without_pending_pushes_sentinel() {
        let (abort, _registry, mut rx) = coordinator();
        assert!(abort.abort("Timeout"));
        assert!(matches!(rx.try_recv(), Ok(QueueItem::Stop)));
        assert_eq!(abort.end(), Some(SessionEnd::Aborted("Timeout".into())));
    }

    #[test]
    fn test_abort_is_idempotent() {
        let (abort, _registry, mut rx) = coordinator();
        assert!(abort.abort("first"));
        assert!(!abort.abort("second"));
        assert!(!abort.conclude(SessionEnd::Completed(vec![])));
        assert_eq!(abort.end(), Some(SessionEnd::Aborted("first".into())));
        assert!(matches!(rx.try_recv(), Ok(QueueItem::Stop)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_abort_fills_pending_and_discards_late_result() {
        let (abort, registry, _rx) = coordinator();
        let (pending, receiver) = registry.open_request(CorrelationId("c1".into())).unwrap();

        abort.abort("user cancelled");

        let reply = receiver.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(reply, Reply::Abort("user cancelled".into()));
        assert!(!pending.mailbox.fill(Reply::Response(Response::ready_for_centring())));
    }

    #[test]
    fn test_conclusion_wins_over_later_abort() {
        let (abort, _registry, _rx) = coordinator();
        assert!(abort.conclude(SessionEnd::Completed(vec![])));
        assert!(!abort.abort("Workflow process exited"));
        assert!(abort.end().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_abort() {
        let (abort, _registry, _rx) = coordinator();
        let waiter = {
            let abort = abort.clone();
            tokio::spawn(async move { abort.ended().await })
        };
        abort.abort("user cancelled");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("ended() should resolve")
            .unwrap();
    }

    #[test]
    #[traced_test]
    fn test_abort_reason_logged() {
        let (abort, _registry, _rx) = coordinator();
        abort.abort("user cancelled");
        assert!(logs_contain("Workflow aborted from beamline"));
        assert!(logs_contain("user cancelled"));
    }

    #[test]
    fn test_end_display() {
        let end = SessionEnd::Failed(vec![Issue {
            component: "indexing".into(),
            message: "no lattice found".into(),
            code: None,
        }]);
        assert_eq!(end.to_string(), "WorkflowFailed; indexing: no lattice found");
    }
}
