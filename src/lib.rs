//! Bridge between a beamline control application and an external workflow
//! engine process.
//!
//! The engine runs as a child process and drives the experiment: it sends
//! info messages, requests the beamline must answer, and finally a terminal
//! message. This crate launches the engine, accepts its calls, dispatches them
//! to handlers on the control application's scheduler and routes every way a
//! session can end through one idempotent abort path.
//!
//! ```no_run
//! use workflow_bridge::{config::BridgeConfig, handlers, session::WorkflowBridge};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = BridgeConfig::load()?;
//! let bridge = WorkflowBridge::from_config(&config);
//! let table = handlers::builtin(&config)?.build();
//! let session = bridge
//!     .start(config.launch_spec("TranslationalCalibration")?, table)
//!     .await?;
//! let outcome = session.wait().await?;
//! println!("{}", outcome.end);
//! # Ok(())
//! # }
//! ```

pub mod abort;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod launcher;
pub mod messages;
pub mod session;
pub mod state;
pub mod transport;
pub mod wire;

pub use abort::{AbortCoordinator, SessionEnd};
pub use dispatch::{HandlerOutcome, HandlerTable};
pub use error::{AppResult, BridgeError, ProtocolError};
pub use session::{RunningSession, SessionOutcome, WorkflowBridge};
pub use state::WorkflowState;
