//! Workflow engine process launcher.
//!
//! Builds the engine command line from property and option maps, spawns it,
//! and stops it with an escalating signal cascade:
//!
//! 1. `SIGINT`, wait `interrupt_grace`
//! 2. `SIGTERM`, wait `terminate_grace`
//! 3. `SIGKILL`, wait `kill_grace` for the process to be reaped
//!
//! The cascade stops as soon as the process has exited.

use crate::error::{AppResult, BridgeError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Renders Java system properties: `-Dkey=value`, or `-Dkey` for an empty value.
pub fn property_args(properties: &BTreeMap<String, String>) -> Vec<String> {
    properties
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                format!("-D{key}")
            } else {
                format!("-D{key}={value}")
            }
        })
        .collect()
}

/// Renders command options: `-key value`, or the bare flag `-key` for an
/// empty value.
pub fn option_args(options: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(options.len() * 2);
    for (key, value) in options {
        args.push(format!("-{key}"));
        if !value.is_empty() {
            args.push(value.clone());
        }
    }
    args
}

/// Everything needed to start one engine process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Program to run.
    pub executable: String,
    /// `-Dkey=value` options before the entry reference.
    #[serde(default)]
    pub invocation_properties: BTreeMap<String, String>,
    /// `-key value` options before the entry reference.
    #[serde(default)]
    pub invocation_options: BTreeMap<String, String>,
    /// Entry class (or script) the executable runs.
    pub entry_reference: String,
    /// `-Dkey=value` arguments after the entry reference.
    #[serde(default)]
    pub workflow_properties: BTreeMap<String, String>,
    /// `-key value` arguments after the entry reference.
    #[serde(default)]
    pub workflow_options: BTreeMap<String, String>,
    /// Working directory, created if missing.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Variables added to the inherited environment.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Full argument vector, executable first.
    pub fn command_line(&self) -> Vec<String> {
        let mut command = vec![self.executable.clone()];
        command.extend(property_args(&self.invocation_properties));
        command.extend(option_args(&self.invocation_options));
        command.push(self.entry_reference.clone());
        command.extend(property_args(&self.workflow_properties));
        command.extend(option_args(&self.workflow_options));
        command
    }

    /// Absolute paths among the property and option values that do not exist.
    pub fn missing_paths(&self) -> Vec<PathBuf> {
        [
            &self.invocation_properties,
            &self.invocation_options,
            &self.workflow_properties,
            &self.workflow_options,
        ]
        .into_iter()
        .flat_map(|map| map.values())
        .map(Path::new)
        .filter(|path| path.is_absolute() && !path.exists())
        .map(Path::to_path_buf)
        .collect()
    }
}

/// Signal sent while stopping a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// What [`ProcessLauncher::stop`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    /// Signals sent, in order.
    pub signals: Vec<StopSignal>,
    /// Exit status, if the process was reaped.
    pub exit_status: Option<ExitStatus>,
}

impl StopReport {
    /// Whether the process is known to have exited.
    pub fn exited(&self) -> bool {
        self.exit_status.is_some()
    }
}

/// Grace periods of the stop cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    /// Wait after SIGINT.
    pub interrupt_grace: Duration,
    /// Wait after SIGTERM.
    pub terminate_grace: Duration,
    /// Wait after SIGKILL before giving up.
    pub kill_grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            interrupt_grace: Duration::from_secs(3),
            terminate_grace: Duration::from_secs(9),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// A running (or finished) engine process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    command: Vec<String>,
    environment: BTreeMap<String, String>,
    child: Arc<Mutex<Child>>,
}

impl ProcessHandle {
    /// Operating system process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Command line the process was started with.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Variables added to the inherited environment.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Exit status if the process has exited. Never blocks.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.child.lock().try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Could not query workflow process status");
                None
            }
        }
    }

    /// Whether the process has exited. Never blocks.
    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    fn send(&self, signal: StopSignal) -> std::io::Result<()> {
        match signal {
            StopSignal::Kill => self.child.lock().start_kill(),
            #[cfg(unix)]
            other => {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let sig = match other {
                    StopSignal::Interrupt => Signal::SIGINT,
                    _ => Signal::SIGTERM,
                };
                #[allow(clippy::cast_possible_wrap)]
                let pid = Pid::from_raw(self.pid as i32);
                kill(pid, sig).map_err(std::io::Error::from)
            }
            // Only force-kill is available; the cascade escalates to it.
            #[cfg(not(unix))]
            _ => Ok(()),
        }
    }

    async fn wait_for_exit(&self, grace: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.exit_status() {
                return Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep(EXIT_POLL.min(deadline - now)).await;
        }
    }
}

/// Spawns and stops workflow engine processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    policy: StopPolicy,
}

impl ProcessLauncher {
    /// Launcher stopping processes with `policy`.
    pub fn new(policy: StopPolicy) -> Self {
        Self { policy }
    }

    /// Stop cascade timings.
    pub fn policy(&self) -> StopPolicy {
        self.policy
    }

    /// Spawns the process described by `spec`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, spec: &LaunchSpec) -> AppResult<ProcessHandle> {
        let command_line = spec.command_line();
        let printable = command_line.join(" ");

        if let Some(dir) = &spec.working_directory {
            if !dir.exists() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "Could not create working directory");
                }
            }
        }
        for path in spec.missing_paths() {
            warn!(path = %path.display(), "Workflow launch argument refers to a missing path");
        }

        let mut command = Command::new(&command_line[0]);
        command
            .args(&command_line[1..])
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| BridgeError::Spawn {
            command: printable.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!(pid, command = %printable, "Workflow process started");

        Ok(ProcessHandle {
            pid,
            command: command_line,
            environment: spec.environment.clone(),
            child: Arc::new(Mutex::new(child)),
        })
    }

    /// Stops the process with the interrupt → terminate → kill cascade.
    /// A no-op for a process that has already exited.
    pub async fn stop(&self, handle: &ProcessHandle) -> StopReport {
        let mut report = StopReport::default();
        if let Some(status) = handle.exit_status() {
            debug!(pid = handle.pid, %status, "Workflow process already exited");
            report.exit_status = Some(status);
            return report;
        }

        let cascade = [
            (StopSignal::Interrupt, self.policy.interrupt_grace),
            (StopSignal::Terminate, self.policy.terminate_grace),
            (StopSignal::Kill, self.policy.kill_grace),
        ];
        for (signal, grace) in cascade {
            debug!(pid = handle.pid, ?signal, ?grace, "Signalling workflow process");
            if let Err(e) = handle.send(signal) {
                warn!(pid = handle.pid, ?signal, error = %e, "Failed to signal workflow process");
            }
            report.signals.push(signal);
            if let Some(status) = handle.wait_for_exit(grace).await {
                info!(pid = handle.pid, %status, ?signal, "Workflow process stopped");
                report.exit_status = Some(status);
                return report;
            }
        }

        error!(pid = handle.pid, "Workflow process survived SIGKILL");
        report
    }
}
