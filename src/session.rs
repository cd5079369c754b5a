//! Session orchestration.
//!
//! [`WorkflowBridge`] owns the state machine and starts one session at a
//! time. A session wires the gateway, dispatch loop and abort coordinator
//! around a freshly launched engine process, then tears everything down
//! again once the session has ended:
//!
//! ```text
//! OFF ──start──▶ ON ──loop──▶ RUNNING ⇄ OPEN
//!                                │
//!                 end ──▶ stop process ──▶ OFF
//! ```

use crate::abort::{AbortCoordinator, SessionEnd};
use crate::config::BridgeConfig;
use crate::correlation::CorrelationRegistry;
use crate::dispatch::{panic_message, DispatchLoop, HandlerTable};
use crate::error::{AppResult, BridgeError};
use crate::gateway::InboundGateway;
use crate::launcher::{LaunchSpec, ProcessHandle, ProcessLauncher, StopReport};
use crate::messages::EnactmentId;
use crate::state::{WorkflowState, WorkflowStateMachine};
use crate::transport::{EngineListener, ADDRESS_ENV};
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Per-session timing and transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Bounded wait of the dispatch loop and of blocked engine calls.
    pub poll_interval: Duration,
    /// Abort the session with reason "Timeout" after this long.
    pub execution_timeout: Option<Duration>,
    /// Engine listener address. `None` runs without a transport; the caller
    /// then drives [`RunningSession::gateway`] directly.
    pub listen: Option<SocketAddr>,
    /// How long engine connections keep being answered after the session
    /// ended, before the engine process is stopped.
    pub drain_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            execution_timeout: None,
            listen: None,
            drain_grace: Duration::from_millis(500),
        }
    }
}

impl From<&BridgeConfig> for SessionSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            poll_interval: config.session.poll_interval,
            execution_timeout: config.session.execution_timeout,
            listen: Some(config.listen_addr()),
            drain_grace: config.session.drain_grace,
        }
    }
}

/// How a finished session went.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// Enactment id adopted during the session, if any message arrived.
    pub enactment_id: Option<EnactmentId>,
    /// How the session ended.
    pub end: SessionEnd,
    /// What stopping the engine took.
    pub stop: StopReport,
}

impl SessionOutcome {
    /// Whether the engine completed the workflow.
    pub fn is_success(&self) -> bool {
        self.end.is_success()
    }
}

/// Entry point for control applications.
#[derive(Debug)]
pub struct WorkflowBridge {
    settings: SessionSettings,
    launcher: ProcessLauncher,
    machine: Arc<WorkflowStateMachine>,
}

impl WorkflowBridge {
    /// Bridge in state OFF.
    pub fn new(settings: SessionSettings, launcher: ProcessLauncher) -> Self {
        Self {
            settings,
            launcher,
            machine: Arc::new(WorkflowStateMachine::new()),
        }
    }

    /// Bridge with settings and stop policy from `config`.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            SessionSettings::from(config),
            ProcessLauncher::new(config.stop_policy()),
        )
    }

    /// Session settings.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Current workflow state.
    pub fn state(&self) -> WorkflowState {
        self.machine.state()
    }

    /// Watch channel publishing every state change.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.machine.subscribe()
    }

    /// Launches the engine and starts a session serving it with `table`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::SessionAlreadyActive`] unless the bridge is OFF
    /// - [`BridgeError::Spawn`] if the engine cannot be started (state stays OFF)
    /// - [`BridgeError::Io`] if the engine listener cannot be bound
    pub async fn start(&self, mut spec: LaunchSpec, table: HandlerTable) -> AppResult<RunningSession> {
        let state = self.machine.state();
        if state != WorkflowState::Off {
            return Err(BridgeError::SessionAlreadyActive(state));
        }

        let listener = match self.settings.listen {
            Some(addr) => {
                let listener = EngineListener::bind(addr).await?;
                spec.environment
                    .insert(ADDRESS_ENV.to_string(), listener.local_addr().to_string());
                Some(listener)
            }
            None => None,
        };
        let local_addr = listener.as_ref().map(EngineListener::local_addr);

        let process = self.launcher.start(&spec)?;
        if self.machine.transition(WorkflowState::On).is_err() {
            // Another start won the race.
            self.launcher.stop(&process).await;
            return Err(BridgeError::SessionAlreadyActive(self.machine.state()));
        }

        let poll_interval = self.settings.poll_interval;
        let registry = Arc::new(CorrelationRegistry::new());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let abort = AbortCoordinator::new(registry.clone(), queue_tx.clone());
        let gateway = InboundGateway::new(registry.clone(), queue_tx, abort.clone(), poll_interval);

        let transport = listener.map(|listener| {
            tokio::spawn(listener.serve(
                gateway.clone(),
                abort.clone(),
                self.settings.drain_grace,
            ))
        });
        let mut helpers = JoinSet::new();
        helpers.spawn(watch_process(process.clone(), abort.clone(), poll_interval));
        if let Some(limit) = self.settings.execution_timeout {
            let abort = abort.clone();
            helpers.spawn(async move {
                tokio::time::sleep(limit).await;
                abort.abort("Timeout");
            });
        }

        let dispatch = DispatchLoop::new(
            queue_rx,
            table,
            self.machine.clone(),
            abort.clone(),
            poll_interval,
        );
        let teardown = Teardown {
            launcher: self.launcher.clone(),
            machine: self.machine.clone(),
            registry,
            abort: abort.clone(),
            process: process.clone(),
            transport,
        };
        let task = tokio::spawn(async move {
            let run = AssertUnwindSafe(dispatch.run())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(BridgeError::SessionTask(format!(
                        "dispatch loop panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            helpers.shutdown().await;
            teardown.finish(run).await
        });

        info!(pid = process.pid(), ?local_addr, "Workflow session started");
        Ok(RunningSession {
            gateway,
            abort,
            pid: process.pid(),
            local_addr,
            task,
        })
    }
}

struct Teardown {
    launcher: ProcessLauncher,
    machine: Arc<WorkflowStateMachine>,
    registry: Arc<CorrelationRegistry>,
    abort: AbortCoordinator,
    process: ProcessHandle,
    transport: Option<JoinHandle<()>>,
}

impl Teardown {
    async fn finish(self, run: AppResult<()>) -> AppResult<SessionOutcome> {
        if let Err(e) = &run {
            self.abort.abort(format!("Dispatch loop failed: {e}"));
        }
        // Replies to the ending call must reach the engine before it is stopped.
        if let Some(transport) = self.transport {
            if let Err(e) = transport.await {
                warn!(error = %e, "Engine transport task failed");
            }
        }
        let stop = self.launcher.stop(&self.process).await;

        if self.machine.state() == WorkflowState::Open {
            self.machine.transition(WorkflowState::Running)?;
        }
        self.machine.transition(WorkflowState::Off)?;
        run?;

        let end = self
            .abort
            .end()
            .unwrap_or_else(|| SessionEnd::Aborted("Dispatch loop stopped".to_string()));
        info!(%end, signals = ?stop.signals, "Workflow session finished");
        Ok(SessionOutcome {
            enactment_id: self.registry.enactment_id(),
            end,
            stop,
        })
    }
}

/// Aborts the session if the engine exits before it has ended.
async fn watch_process(process: ProcessHandle, abort: AbortCoordinator, poll_interval: Duration) {
    loop {
        tokio::select! {
            _ = abort.ended() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
        if let Some(status) = process.exit_status() {
            // Let a terminal message written just before exit land first.
            tokio::time::sleep(poll_interval).await;
            if !abort.is_ended() {
                warn!(pid = process.pid(), %status, "Workflow process exited before the session ended");
                abort.abort(format!("Workflow process exited unexpectedly ({status})"));
            }
            return;
        }
        debug!(pid = process.pid(), "Workflow process alive");
    }
}

/// Handle on a started session.
#[derive(Debug)]
pub struct RunningSession {
    gateway: InboundGateway,
    abort: AbortCoordinator,
    pid: u32,
    local_addr: Option<SocketAddr>,
    task: JoinHandle<AppResult<SessionOutcome>>,
}

impl RunningSession {
    /// Gateway serving this session's engine calls.
    pub fn gateway(&self) -> InboundGateway {
        self.gateway.clone()
    }

    /// Cloneable abort handle, e.g. for a Ctrl-C handler.
    pub fn aborter(&self) -> AbortCoordinator {
        self.abort.clone()
    }

    /// Aborts the session. `false` if it had already ended.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.abort.abort(reason)
    }

    /// Process id of the engine.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Address the engine connects to, when a transport is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether teardown has completed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for teardown to complete.
    pub async fn wait(self) -> AppResult<SessionOutcome> {
        self.task
            .await
            .map_err(|e| BridgeError::SessionTask(e.to_string()))?
    }
}
