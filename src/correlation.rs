//! Session and request correlation.
//!
//! The registry holds the enactment id adopted for the session and the single
//! request the engine may have outstanding. Each request gets a [`Mailbox`]:
//! a one-slot channel written from the dispatch side and read by the blocked
//! gateway call. The first write wins; later writes are discarded and reported
//! to the caller.

use crate::error::ProtocolError;
use crate::messages::{CorrelationId, EnactmentId, Response};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// What the dispatch side deposits for a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Handler result to translate and return to the engine.
    Response(Response),
    /// Synthetic reply produced by an abort.
    Abort(String),
}

/// Write side of a single-slot mailbox.
#[derive(Debug, Clone)]
pub struct Mailbox {
    slot: Arc<Mutex<Option<Sender<Reply>>>>,
}

/// Read side of a single-slot mailbox, owned by the blocked gateway call.
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: Receiver<Reply>,
}

/// Creates a connected mailbox pair.
pub fn mailbox() -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = bounded(1);
    (
        Mailbox {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        MailboxReceiver { rx },
    )
}

impl Mailbox {
    /// Deposits `reply`. Returns `false` if the mailbox was already filled, in
    /// which case `reply` is dropped.
    pub fn fill(&self, reply: Reply) -> bool {
        match self.slot.lock().take() {
            // A dropped receiver means the gateway call is gone; the slot is
            // still consumed.
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Whether a reply has been put, or the slot consumed.
    pub fn is_filled(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl MailboxReceiver {
    /// Waits at most `timeout` for the reply.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Reply, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// An outstanding request: its correlation id and the mailbox to answer it.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Correlation id of the request.
    pub correlation_id: CorrelationId,
    /// Slot the reply goes into.
    pub mailbox: Mailbox,
}

#[derive(Debug, Default)]
struct RegistryState {
    enactment_id: Option<EnactmentId>,
    pending: Option<PendingRequest>,
}

/// Tracks the session's enactment id and at most one pending request.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    state: Mutex<RegistryState>,
}

impl CorrelationRegistry {
    /// Registry with no enactment adopted yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enactment id adopted for this session, if any message arrived yet.
    pub fn enactment_id(&self) -> Option<EnactmentId> {
        self.state.lock().enactment_id.clone()
    }

    /// Adopts `id` on first call; afterwards requires every id to match.
    pub fn adopt_or_verify(&self, id: &EnactmentId) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        match &state.enactment_id {
            None => {
                state.enactment_id = Some(id.clone());
                Ok(())
            }
            Some(current) if current == id => Ok(()),
            Some(current) => Err(ProtocolError::EnactmentMismatch {
                expected: current.to_string(),
                actual: id.to_string(),
            }),
        }
    }

    /// Registers a new pending request. Fails if one is already outstanding.
    pub fn open_request(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<(PendingRequest, MailboxReceiver), ProtocolError> {
        let mut state = self.state.lock();
        if let Some(pending) = &state.pending {
            return Err(ProtocolError::RequestAlreadyPending {
                pending: pending.correlation_id.to_string(),
                incoming: correlation_id.to_string(),
            });
        }
        let (mailbox, receiver) = mailbox();
        let pending = PendingRequest {
            correlation_id,
            mailbox,
        };
        state.pending = Some(pending.clone());
        Ok((pending, receiver))
    }

    /// Removes the pending request once its reply has been collected.
    pub fn close_request(&self, correlation_id: &CorrelationId) {
        let mut state = self.state.lock();
        if state
            .pending
            .as_ref()
            .is_some_and(|p| &p.correlation_id == correlation_id)
        {
            state.pending = None;
        }
    }

    /// The pending request whose mailbox is still empty, if any.
    pub fn unfilled_request(&self) -> Option<PendingRequest> {
        self.state
            .lock()
            .pending
            .as_ref()
            .filter(|p| !p.mailbox.is_filled())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Response;

    fn eid(s: &str) -> EnactmentId {
        EnactmentId(s.to_string())
    }

    fn cid(s: &str) -> CorrelationId {
        CorrelationId(s.to_string())
    }

    #[test]
    fn test_mailbox_first_write_wins() {
        let (mailbox, receiver) = mailbox();
        assert!(!mailbox.is_filled());
        assert!(mailbox.fill(Reply::Abort("user cancelled".into())));
        assert!(mailbox.is_filled());
        assert!(!mailbox.fill(Reply::Response(Response::ready_for_centring())));

        let reply = receiver.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(reply, Reply::Abort("user cancelled".into()));
        assert!(receiver.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_mailbox_wait_is_bounded() {
        let (_mailbox, receiver) = mailbox();
        let start = std::time::Instant::now();
        let err = receiver.recv_timeout(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, RecvTimeoutError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_mailbox_filled_across_threads() {
        let (mailbox, receiver) = mailbox();
        let handle = std::thread::spawn(move || mailbox.fill(Reply::Response(Response::ready_for_centring())));
        let reply = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(handle.join().unwrap());
        assert_eq!(reply, Reply::Response(Response::ready_for_centring()));
    }

    #[test]
    fn test_enactment_adopted_once() {
        let registry = CorrelationRegistry::new();
        assert_eq!(registry.enactment_id(), None);
        registry.adopt_or_verify(&eid("e1")).unwrap();
        registry.adopt_or_verify(&eid("e1")).unwrap();
        let err = registry.adopt_or_verify(&eid("e2")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::EnactmentMismatch {
                expected: "e1".into(),
                actual: "e2".into()
            }
        );
        assert_eq!(registry.enactment_id(), Some(eid("e1")));
    }

    #[test]
    fn test_single_pending_request() {
        let registry = CorrelationRegistry::new();
        let (pending, _rx) = registry.open_request(cid("c1")).unwrap();
        assert!(matches!(
            registry.open_request(cid("c2")),
            Err(ProtocolError::RequestAlreadyPending { .. })
        ));

        // Closing with a foreign id leaves the pending request in place.
        registry.close_request(&cid("c2"));
        assert!(registry.unfilled_request().is_some());

        pending.mailbox.fill(Reply::Abort("x".into()));
        assert!(registry.unfilled_request().is_none());

        registry.close_request(&cid("c1"));
        assert!(registry.open_request(cid("c2")).is_ok());
    }
}
