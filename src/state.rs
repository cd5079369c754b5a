//! Workflow session state machine.
//!
//! ```text
//! OFF ──start──▶ ON ──loop active──▶ RUNNING ◀──reply sent── OPEN
//!  ▲                                   │  └──request received──▶ ▲
//!  └────── terminal / abort / exit ────┘
//! ```
//!
//! OPEN means the engine is waiting on the beamline; RUNNING means the engine
//! has control. Every transition is published on a `watch` channel so that
//! observers (UI panels, tests) can follow the session.

use crate::error::{AppResult, BridgeError};
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Externally visible state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowState {
    /// No session.
    Off,
    /// Engine process launched, dispatch loop not yet active.
    On,
    /// Engine has control and will produce the next message.
    Running,
    /// Engine is waiting for a reply from the beamline.
    Open,
}

impl WorkflowState {
    /// Whether `self -> next` is one of the legal transitions.
    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Off, On) | (On, Running) | (Running, Open) | (Open, Running) | (Running, Off)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::On => write!(f, "ON"),
            Self::Running => write!(f, "RUNNING"),
            Self::Open => write!(f, "OPEN"),
        }
    }
}

/// Owner of the current [`WorkflowState`].
#[derive(Debug)]
pub struct WorkflowStateMachine {
    tx: watch::Sender<WorkflowState>,
}

impl Default for WorkflowStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowStateMachine {
    /// Creates a state machine in state OFF.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(WorkflowState::Off);
        Self { tx }
    }

    /// Returns the current state.
    pub fn state(&self) -> WorkflowState {
        *self.tx.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.tx.subscribe()
    }

    /// Moves to `next`, failing with `InvalidStateTransition` if the move is
    /// not legal from the current state. Check and update are atomic.
    pub fn transition(&self, next: WorkflowState) -> AppResult<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!(from = %state, to = %next, "Workflow state transition");
                *state = next;
                true
            } else {
                outcome = Err(BridgeError::InvalidStateTransition {
                    from: *state,
                    to: next,
                });
                false
            }
        });
        outcome
    }
}
