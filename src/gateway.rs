//! Inbound gateway: the call surface the workflow engine invokes.
//!
//! Every method here runs in the engine's calling context and may block. A
//! request-type call blocks until the dispatch loop (or an abort) fills its
//! mailbox; the engine issues one call at a time, so at most one such call is
//! ever waiting.

use crate::abort::{AbortCoordinator, SessionEnd};
use crate::correlation::{CorrelationRegistry, MailboxReceiver, PendingRequest, Reply};
use crate::dispatch::{QueueItem, QueueSender};
use crate::error::ProtocolError;
use crate::messages::{CorrelationId, MessageCategory, MessageType, Payload};
use crate::wire::{Message, WireEnvelope};
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Validates, decodes and routes engine calls.
#[derive(Debug, Clone)]
pub struct InboundGateway {
    registry: Arc<CorrelationRegistry>,
    queue: QueueSender,
    abort: AbortCoordinator,
    poll_interval: Duration,
}

impl InboundGateway {
    /// Gateway feeding `queue`; blocked calls wake every `poll_interval`.
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        queue: QueueSender,
        abort: AbortCoordinator,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            abort,
            poll_interval,
        }
    }

    /// Handles one engine call. Returns the reply envelope, or `None` when the
    /// protocol expects no reply.
    pub fn receive(&self, envelope: &WireEnvelope) -> Option<WireEnvelope> {
        let raw_correlation = envelope
            .correlation_id
            .as_ref()
            .map(|id| CorrelationId(id.clone()));

        if self.abort.is_ended() {
            return self.after_end(envelope, raw_correlation.as_ref());
        }

        let message = match envelope.decode() {
            Ok(message) => message,
            Err(e) => return Some(self.reject(e, raw_correlation.as_ref())),
        };
        if let Err(e) = self.registry.adopt_or_verify(&message.enactment_id) {
            return Some(self.reject(e, raw_correlation.as_ref()));
        }

        let message_type = message.message_type();
        debug!(%message_type, enactment_id = %message.enactment_id, "Engine message received");
        match message_type.category() {
            MessageCategory::Info => {
                self.enqueue(QueueItem::Info(message));
                None
            }
            MessageCategory::Request => Some(self.request(message)),
            MessageCategory::Terminal => {
                self.abort.conclude(terminal_end(message.payload));
                None
            }
        }
    }

    /// JSON text variant of [`receive`](Self::receive) for line-based
    /// transports. Unparseable text is treated like any other malformed call.
    pub fn receive_json(&self, text: &str) -> Option<String> {
        match WireEnvelope::from_json(text) {
            Ok(envelope) => self.receive(&envelope).map(|reply| reply.to_json()),
            Err(e) if self.abort.is_ended() => {
                debug!(error = %e, "Ignoring unparseable message after session end");
                None
            }
            Err(e) => Some(self.reject(e, None).to_json()),
        }
    }

    fn request(&self, message: Message) -> WireEnvelope {
        let correlation_id = message
            .correlation_id
            .clone()
            .unwrap_or_else(CorrelationId::generate);

        let (pending, receiver) = match self.registry.open_request(correlation_id.clone()) {
            Ok(opened) => opened,
            Err(e) => return self.reject(e, Some(&correlation_id)),
        };
        self.enqueue(QueueItem::Request(message, pending.clone()));

        let reply = self.await_reply(&pending, &receiver);
        self.registry.close_request(&correlation_id);

        let enactment_id = self.registry.enactment_id();
        match reply {
            Reply::Response(response) => {
                WireEnvelope::reply(enactment_id.as_ref(), Some(&correlation_id), &response)
            }
            Reply::Abort(reason) => {
                debug!(%correlation_id, %reason, "Answering request with BeamlineAbort");
                WireEnvelope::beamline_abort(enactment_id.as_ref(), Some(&correlation_id))
            }
        }
    }

    /// Blocks until the mailbox is filled. Wakes every poll interval to check
    /// whether the session ended without anyone answering this request.
    fn await_reply(&self, pending: &PendingRequest, receiver: &MailboxReceiver) -> Reply {
        loop {
            match receiver.recv_timeout(self.poll_interval) {
                Ok(reply) => return reply,
                Err(RecvTimeoutError::Timeout) if !self.abort.is_ended() => continue,
                Err(_) => {
                    let reason = "Session ended while request was pending";
                    pending.mailbox.fill(Reply::Abort(reason.to_string()));
                    return receiver
                        .recv_timeout(self.poll_interval)
                        .unwrap_or_else(|_| Reply::Abort(reason.to_string()));
                }
            }
        }
    }

    fn enqueue(&self, item: QueueItem) {
        if self.queue.send(item).is_err() {
            self.abort.abort("Dispatch loop is not running");
        }
    }

    fn reject(&self, error: ProtocolError, correlation_id: Option<&CorrelationId>) -> WireEnvelope {
        warn!(%error, "Rejecting engine message");
        self.abort.abort(error.to_string());
        WireEnvelope::beamline_abort(self.registry.enactment_id().as_ref(), correlation_id)
    }

    /// Calls that arrive once the session is over. Requests still need an
    /// answer; everything else, including the engine's own `WorkflowAborted`
    /// closing an abort exchange, is accepted silently.
    fn after_end(
        &self,
        envelope: &WireEnvelope,
        correlation_id: Option<&CorrelationId>,
    ) -> Option<WireEnvelope> {
        let message_type = MessageType::from_tag(&envelope.type_tag);
        debug!(type_tag = %envelope.type_tag, "Engine message after session end");
        match message_type.map(MessageType::category) {
            Some(MessageCategory::Request) => Some(WireEnvelope::beamline_abort(
                self.registry.enactment_id().as_ref(),
                correlation_id,
            )),
            _ => None,
        }
    }
}

fn terminal_end(payload: Payload) -> SessionEnd {
    match payload {
        Payload::WorkflowCompleted(done) => SessionEnd::Completed(done.issues),
        Payload::WorkflowFailed(done) => SessionEnd::Failed(done.issues),
        Payload::WorkflowAborted(done) => SessionEnd::EngineAborted(done.issues),
        other => SessionEnd::Aborted(format!(
            "Unexpected terminal payload {}",
            other.message_type()
        )),
    }
}
