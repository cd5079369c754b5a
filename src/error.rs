//! Custom error types for the bridge.
//!
//! `BridgeError` is the crate-wide error. Errors that can only arise while
//! decoding or validating an engine call are grouped in [`ProtocolError`]; the
//! gateway never propagates those to a caller, it turns them into a
//! `BeamlineAbort` reply and aborts the session.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: loading or validating the figment configuration failed.
//! - **`Spawn`**: the engine process could not be created. The state machine
//!   stays OFF.
//! - **`SessionAlreadyActive`**: a session was started while another one is not
//!   yet OFF.
//! - **`InvalidStateTransition`**: a caller tried a transition outside
//!   OFF→ON→RUNNING→(OPEN→RUNNING)*→OFF.
//! - **`Protocol`**: a malformed or out-of-sequence engine call.
//! - **`InvalidHandler`**: a handler was registered for a message type of the
//!   wrong category.
//!
//! By using `#[from]`, `BridgeError` can be created from the underlying error
//! types with the `?` operator.

use crate::config::ConfigError;
use crate::state::WorkflowState;
use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type AppResult<T> = std::result::Result<T, BridgeError>;

/// Crate-wide error.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener or file system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine process could not be created.
    #[error("Failed to spawn workflow process `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Error from the operating system.
        #[source]
        source: std::io::Error,
    },

    /// `start` was called while the bridge was not OFF.
    #[error("A workflow session is already active (state {0})")]
    SessionAlreadyActive(WorkflowState),

    /// Transition not allowed by the state machine.
    #[error("Invalid workflow state transition {from} -> {to}")]
    InvalidStateTransition {
        /// State at the time of the call.
        from: WorkflowState,
        /// Requested state.
        to: WorkflowState,
    },

    /// Malformed or out-of-sequence engine call.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No workflow of that name is configured.
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Handler registered for a message of the wrong category.
    #[error("Invalid handler registration: {0}")]
    InvalidHandler(String),

    /// The session task panicked or was cancelled.
    #[error("Session task failed: {0}")]
    SessionTask(String),
}

/// Failures detected while decoding or sequencing an inbound engine call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The envelope is not valid JSON of the expected shape.
    #[error("Malformed message envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope has no enactment id.
    #[error("Received message with empty enactment id")]
    MissingEnactmentId,

    /// Request or info message without a payload.
    #[error("Payload missing for message {0}")]
    MissingPayload(String),

    /// Tag outside the message catalogue.
    #[error("Unknown message type from server: {0}")]
    UnknownMessageType(String),

    /// Payload does not match the schema of its tag.
    #[error("Payload could not be decoded for message {tag}: {reason}")]
    PayloadDecode {
        /// Tag of the message.
        tag: String,
        /// Decoder error.
        reason: String,
    },

    /// The message belongs to another session.
    #[error("Workflow enactment id {expected} != message enactment id {actual}")]
    EnactmentMismatch {
        /// Enactment id adopted by the session.
        expected: String,
        /// Enactment id of the message.
        actual: String,
    },

    /// A second request arrived before the first was answered.
    #[error("Request {incoming} received while request {pending} is still pending")]
    RequestAlreadyPending {
        /// Correlation id of the open request.
        pending: String,
        /// Correlation id of the new request.
        incoming: String,
    },
}
