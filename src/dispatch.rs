//! Dispatch loop and handler table.
//!
//! The loop runs as a task on the control application's scheduler. It drains
//! the gateway queue strictly in order and calls the handler registered for
//! each message type. Handlers are async, so they can move motors or wait for
//! a user without blocking anything else on the scheduler.
//!
//! Handlers are supplied through an explicit [`HandlerTable`] built before the
//! session starts; nothing is registered globally.

use crate::abort::AbortCoordinator;
use crate::correlation::{PendingRequest, Reply};
use crate::error::{AppResult, BridgeError};
use crate::messages::{CorrelationId, MessageCategory, MessageType, Payload, Response};
use crate::state::{WorkflowState, WorkflowStateMachine};
use crate::wire::Message;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Item on the gateway → dispatch queue.
#[derive(Debug)]
pub enum QueueItem {
    /// Info message, no reply.
    Info(Message),
    /// Request message together with the mailbox for its reply.
    Request(Message, PendingRequest),
    /// Sentinel: leave the loop.
    Stop,
}

/// Sending half of the gateway queue.
pub type QueueSender = mpsc::UnboundedSender<QueueItem>;
/// Receiving half of the gateway queue, owned by the dispatch loop.
pub type QueueReceiver = mpsc::UnboundedReceiver<QueueItem>;

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panicked".to_string()
    }
}

/// Result of a request handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Reply to send back to the engine.
    Ok(Response),
    /// The beamline does not support this request.
    Unimplemented,
    /// The handler tried and failed.
    Failed(String),
}

/// Handles one request-type message and produces its reply.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produces the reply to one request.
    async fn handle(&self, payload: Payload, correlation_id: Option<CorrelationId>)
        -> HandlerOutcome;
}

/// Handles one info-type message.
#[async_trait]
pub trait InfoHandler: Send + Sync {
    /// Consumes one info message.
    async fn handle(&self, payload: Payload, correlation_id: Option<CorrelationId>);
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Payload, Option<CorrelationId>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle(
        &self,
        payload: Payload,
        correlation_id: Option<CorrelationId>,
    ) -> HandlerOutcome {
        (self)(payload, correlation_id).await
    }
}

#[async_trait]
impl<F, Fut> InfoHandler for F
where
    F: Fn(Payload, Option<CorrelationId>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, payload: Payload, correlation_id: Option<CorrelationId>) {
        (self)(payload, correlation_id).await
    }
}

/// Immutable message-type → handler mapping for one session.
#[derive(Clone, Default)]
pub struct HandlerTable {
    requests: HashMap<MessageType, Arc<dyn RequestHandler>>,
    info: HashMap<MessageType, Arc<dyn InfoHandler>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut requests: Vec<_> = self.requests.keys().collect();
        requests.sort();
        let mut info: Vec<_> = self.info.keys().collect();
        info.sort();
        f.debug_struct("HandlerTable")
            .field("requests", &requests)
            .field("info", &info)
            .finish()
    }
}

impl HandlerTable {
    /// Empty builder.
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder {
            table: Self::default(),
        }
    }

    /// Builder seeded with this table's entries.
    pub fn extend(self) -> HandlerTableBuilder {
        HandlerTableBuilder { table: self }
    }

    /// Handler registered for a request type.
    pub fn request_handler(&self, message_type: MessageType) -> Option<Arc<dyn RequestHandler>> {
        self.requests.get(&message_type).cloned()
    }

    /// Handler registered for an info type.
    pub fn info_handler(&self, message_type: MessageType) -> Option<Arc<dyn InfoHandler>> {
        self.info.get(&message_type).cloned()
    }

    /// Whether any handler is registered for `message_type`.
    pub fn handles(&self, message_type: MessageType) -> bool {
        self.requests.contains_key(&message_type) || self.info.contains_key(&message_type)
    }
}

/// Builder for [`HandlerTable`]. Registration checks the message category.
pub struct HandlerTableBuilder {
    table: HandlerTable,
}

impl HandlerTableBuilder {
    /// Registers (or replaces) the handler for a request-type message.
    pub fn request(
        mut self,
        message_type: MessageType,
        handler: impl RequestHandler + 'static,
    ) -> AppResult<Self> {
        if message_type.category() != MessageCategory::Request {
            return Err(BridgeError::InvalidHandler(format!(
                "{message_type} is not a request message"
            )));
        }
        self.table.requests.insert(message_type, Arc::new(handler));
        Ok(self)
    }

    /// Registers (or replaces) the handler for an info-type message.
    pub fn info(
        mut self,
        message_type: MessageType,
        handler: impl InfoHandler + 'static,
    ) -> AppResult<Self> {
        if message_type.category() != MessageCategory::Info {
            return Err(BridgeError::InvalidHandler(format!(
                "{message_type} is not an info message"
            )));
        }
        self.table.info.insert(message_type, Arc::new(handler));
        Ok(self)
    }

    /// Finishes the table.
    pub fn build(self) -> HandlerTable {
        self.table
    }
}

/// Consumes the gateway queue on the control scheduler.
pub struct DispatchLoop {
    queue: QueueReceiver,
    table: HandlerTable,
    machine: Arc<WorkflowStateMachine>,
    abort: AbortCoordinator,
    poll_interval: Duration,
}

impl DispatchLoop {
    /// Loop over `queue`; nothing runs until [`DispatchLoop::run`].
    pub fn new(
        queue: QueueReceiver,
        table: HandlerTable,
        machine: Arc<WorkflowStateMachine>,
        abort: AbortCoordinator,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            table,
            machine,
            abort,
            poll_interval,
        }
    }

    /// Runs until the stop sentinel is received.
    ///
    /// Moves the state machine ON → RUNNING on entry and leaves it RUNNING on
    /// return; the caller performs the final RUNNING → OFF after teardown.
    pub async fn run(mut self) -> AppResult<()> {
        self.machine.transition(WorkflowState::Running)?;
        info!("Dispatch loop started");

        loop {
            let item = match tokio::time::timeout(self.poll_interval, self.queue.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    self.abort.abort("Message queue closed");
                    break;
                }
                Err(_) => {
                    trace!("Dispatch queue idle");
                    continue;
                }
            };

            match item {
                QueueItem::Stop => {
                    debug!("Stop sentinel received");
                    break;
                }
                QueueItem::Info(message) => self.dispatch_info(message).await,
                QueueItem::Request(message, pending) => {
                    self.dispatch_request(message, pending).await?
                }
            }
        }

        info!("Dispatch loop finished");
        Ok(())
    }

    async fn dispatch_info(&self, message: Message) {
        let message_type = message.message_type();
        let Some(handler) = self.table.info_handler(message_type) else {
            debug!(%message_type, "No handler registered for info message");
            return;
        };
        let call = AssertUnwindSafe(handler.handle(message.payload, message.correlation_id))
            .catch_unwind();
        tokio::select! {
            finished = call => {
                if let Err(panic) = finished {
                    let reason = panic_message(panic.as_ref());
                    error!(%message_type, %reason, "Info handler panicked");
                    self.abort
                        .abort(format!("Handler for {message_type} failed: {reason}"));
                }
            }
            _ = self.abort.ended() => {
                debug!(%message_type, "Info handler interrupted by session end");
            }
        }
    }

    async fn dispatch_request(&self, message: Message, pending: PendingRequest) -> AppResult<()> {
        let message_type = message.message_type();
        self.machine.transition(WorkflowState::Open)?;
        debug!(%message_type, correlation_id = %pending.correlation_id, "Dispatching request");

        let outcome = match self.table.request_handler(message_type) {
            Some(handler) => {
                let call = AssertUnwindSafe(
                    handler.handle(message.payload, Some(pending.correlation_id.clone())),
                )
                .catch_unwind();
                tokio::select! {
                    outcome = call => Some(outcome.unwrap_or_else(|panic| {
                        HandlerOutcome::Failed(format!("panicked: {}", panic_message(panic.as_ref())))
                    })),
                    _ = self.abort.ended() => None,
                }
            }
            None => Some(HandlerOutcome::Unimplemented),
        };

        match outcome {
            None => debug!(%message_type, "Request handler interrupted by session end"),
            Some(HandlerOutcome::Ok(response)) => self.deliver(message_type, &pending, response),
            Some(HandlerOutcome::Unimplemented) => {
                warn!(%message_type, "Request not implemented on this beamline");
                self.abort.abort(format!(
                    "Processing of message {message_type} not implemented"
                ));
            }
            Some(HandlerOutcome::Failed(reason)) => {
                error!(%message_type, %reason, "Request handler failed");
                self.abort
                    .abort(format!("Handler for {message_type} failed: {reason}"));
            }
        }

        self.machine.transition(WorkflowState::Running)
    }

    fn deliver(&self, message_type: MessageType, pending: &PendingRequest, response: Response) {
        let actual = response.response_type();
        if message_type.expected_response() != Some(actual) {
            error!(%message_type, %actual, "Request handler returned the wrong reply type");
            self.abort.abort(format!(
                "Reply ({actual}) to {message_type} request out of context"
            ));
            return;
        }
        if !pending.mailbox.fill(Reply::Response(response)) {
            debug!(
                %message_type,
                correlation_id = %pending.correlation_id,
                "Discarding late handler result, request already answered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::SessionEnd;
    use crate::correlation::CorrelationRegistry;
    use crate::messages::{EnactmentId, TextInfo};
    use parking_lot::Mutex;
    use tokio::task::JoinHandle;

    struct Harness {
        tx: QueueSender,
        registry: Arc<CorrelationRegistry>,
        abort: AbortCoordinator,
        machine: Arc<WorkflowStateMachine>,
        task: JoinHandle<AppResult<()>>,
    }

    fn start(table: HandlerTable) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(CorrelationRegistry::new());
        let abort = AbortCoordinator::new(registry.clone(), tx.clone());
        let machine = Arc::new(WorkflowStateMachine::new());
        machine.transition(WorkflowState::On).unwrap();
        let dispatch = DispatchLoop::new(
            rx,
            table,
            machine.clone(),
            abort.clone(),
            Duration::from_millis(10),
        );
        let task = tokio::spawn(dispatch.run());
        Harness {
            tx,
            registry,
            abort,
            machine,
            task,
        }
    }

    fn message(payload: Payload, correlation: &str) -> Message {
        Message {
            enactment_id: EnactmentId("e1".into()),
            correlation_id: Some(CorrelationId(correlation.into())),
            payload,
        }
    }

    fn request(h: &Harness, payload: Payload, correlation: &str) -> crate::correlation::MailboxReceiver {
        let (pending, rx) = h
            .registry
            .open_request(CorrelationId(correlation.into()))
            .unwrap();
        h.tx.send(QueueItem::Request(message(payload, correlation), pending))
            .unwrap();
        rx
    }

    #[test]
    fn test_registration_checks_category() {
        let handler = |_p: Payload, _c: Option<CorrelationId>| async { HandlerOutcome::Unimplemented };
        assert!(matches!(
            HandlerTable::builder().request(MessageType::String, handler),
            Err(BridgeError::InvalidHandler(_))
        ));
        let info = |_p: Payload, _c: Option<CorrelationId>| async {};
        assert!(matches!(
            HandlerTable::builder().info(MessageType::WorkflowCompleted, info),
            Err(BridgeError::InvalidHandler(_))
        ));
        let table = HandlerTable::builder()
            .request(MessageType::PrepareForCentring, handler)
            .unwrap()
            .build();
        assert!(table.handles(MessageType::PrepareForCentring));
        assert!(!table.handles(MessageType::RequestCentring));
    }

    #[tokio::test]
    async fn test_request_reply_and_state_path() {
        let table = HandlerTable::builder()
            .request(MessageType::PrepareForCentring, |_p: Payload, _c: Option<CorrelationId>| async {
                HandlerOutcome::Ok(Response::ready_for_centring())
            })
            .unwrap()
            .build();
        let h = start(table);
        let mut states = h.machine.subscribe();

        let rx = request(&h, Payload::PrepareForCentring, "c1");
        let reply = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Reply::Response(Response::ready_for_centring()));

        states
            .wait_for(|s| *s == WorkflowState::Running)
            .await
            .unwrap();
        h.abort.conclude(SessionEnd::Completed(vec![]));
        h.task.await.unwrap().unwrap();
        assert_eq!(h.machine.state(), WorkflowState::Running);
    }

    #[tokio::test]
    async fn test_messages_dispatched_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let table = HandlerTable::builder()
            .info(MessageType::String, move |p: Payload, _c: Option<CorrelationId>| {
                let log = log.clone();
                async move {
                    if let Payload::Text(info) = p {
                        log.lock().push(info.text);
                    }
                }
            })
            .unwrap()
            .build();
        let h = start(table);
        for text in ["one", "two", "three"] {
            h.tx.send(QueueItem::Info(message(
                Payload::Text(TextInfo { text: text.into() }),
                "c0",
            )))
            .unwrap();
        }
        h.tx.send(QueueItem::Stop).unwrap();
        h.task.await.unwrap().unwrap();
        assert_eq!(*seen.lock(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_missing_handler_aborts_session() {
        let h = start(HandlerTable::default());
        let rx = request(&h, Payload::ObtainPriorInformation, "c1");
        let reply = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reply, Reply::Abort(reason) if reason.contains("not implemented")));
        h.task.await.unwrap().unwrap();
        assert!(matches!(h.abort.end(), Some(SessionEnd::Aborted(_))));
    }

    #[tokio::test]
    async fn test_wrong_reply_type_aborts_session() {
        let table = HandlerTable::builder()
            .request(MessageType::RequestConfiguration, |_p: Payload, _c: Option<CorrelationId>| async {
                HandlerOutcome::Ok(Response::ready_for_centring())
            })
            .unwrap()
            .build();
        let h = start(table);
        let rx = request(&h, Payload::RequestConfiguration, "c1");
        let reply = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reply, Reply::Abort(reason) if reason.contains("out of context")));
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abort_interrupts_running_handler() {
        let table = HandlerTable::builder()
            .request(MessageType::RequestCentring, |_p: Payload, _c: Option<CorrelationId>| async {
                std::future::pending::<()>().await;
                HandlerOutcome::Failed("unreachable".into())
            })
            .unwrap()
            .build();
        let h = start(table);
        let mut states = h.machine.subscribe();
        let rx = request(
            &h,
            Payload::RequestCentring(crate::messages::RequestCentring {
                current_setting_no: 1,
                total_rotations: 2,
                goniostat_rotation: None,
            }),
            "c1",
        );
        states.wait_for(|s| *s == WorkflowState::Open).await.unwrap();

        h.abort.abort("user cancelled");
        let reply = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Reply::Abort("user cancelled".into()));
        h.task.await.unwrap().unwrap();
        assert_eq!(h.machine.state(), WorkflowState::Running);
    }

    #[tokio::test]
    async fn test_panicking_request_handler_aborts_session() {
        let table = HandlerTable::builder()
            .request(MessageType::PrepareForCentring, |_p: Payload, _c: Option<CorrelationId>| async {
                if true {
                    panic!("goniostat offline");
                }
                HandlerOutcome::Unimplemented
            })
            .unwrap()
            .build();
        let h = start(table);
        let rx = request(&h, Payload::PrepareForCentring, "c1");
        let reply = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(&reply, Reply::Abort(reason) if reason.contains("failed") && reason.contains("goniostat offline")),
            "{reply:?}"
        );
        // The loop survives the panic and leaves by the stop sentinel.
        h.task.await.unwrap().unwrap();
        assert_eq!(h.machine.state(), WorkflowState::Running);
    }

    #[tokio::test]
    async fn test_panicking_info_handler_aborts_session() {
        let table = HandlerTable::builder()
            .info(MessageType::String, |_p: Payload, _c: Option<CorrelationId>| async {
                panic!("log sink gone");
            })
            .unwrap()
            .build();
        let h = start(table);
        h.tx.send(QueueItem::Info(message(
            Payload::Text(TextInfo { text: "hello".into() }),
            "c0",
        )))
        .unwrap();
        h.task.await.unwrap().unwrap();
        assert!(matches!(
            h.abort.end(),
            Some(SessionEnd::Aborted(reason)) if reason.contains("log sink gone")
        ));
    }

    #[tokio::test]
    async fn test_abort_interrupts_hung_info_handler() {
        let table = HandlerTable::builder()
            .info(MessageType::String, |_p: Payload, _c: Option<CorrelationId>| async {
                std::future::pending::<()>().await;
            })
            .unwrap()
            .build();
        let h = start(table);
        h.tx.send(QueueItem::Info(message(
            Payload::Text(TextInfo { text: "hello".into() }),
            "c0",
        )))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.abort.abort("Timeout");
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
