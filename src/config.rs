//! Bridge configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `WFBRIDGE_`, nested keys separated
//!    by `__`
//!
//! ```text
//! WFBRIDGE_APPLICATION__LOG_LEVEL=debug
//! WFBRIDGE_CONNECTION__PORT=7000
//! WFBRIDGE_SESSION__EXECUTION_TIMEOUT="2h"
//! ```

use crate::error::{AppResult, BridgeError};
use crate::launcher::{LaunchSpec, StopPolicy};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The figment providers could not be read or merged.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of range or inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Application identity and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where the engine reaches the bridge
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Session timing
    #[serde(default)]
    pub session: SessionConfig,
    /// How the engine process is started
    #[serde(default)]
    pub engine: EngineConfig,
    /// Workflows the engine can run
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Display name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "workflow_bridge".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Engine listener address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Interface the listener binds
    #[serde(default = "default_address")]
    pub address: IpAddr,
    /// 0 picks a free port
    #[serde(default)]
    pub port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: 0,
        }
    }
}

/// Session timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bounded wait used by the dispatch loop and blocked engine calls
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Abort the session with reason "Timeout" after this long
    #[serde(default, with = "humantime_serde")]
    pub execution_timeout: Option<Duration>,
    /// Wait after SIGINT before escalating to SIGTERM
    #[serde(default = "default_interrupt_grace", with = "humantime_serde")]
    pub interrupt_grace: Duration,
    /// Wait after SIGTERM before killing the engine
    #[serde(default = "default_terminate_grace", with = "humantime_serde")]
    pub terminate_grace: Duration,
    /// Engine connections are still answered this long after the session ended
    #[serde(default = "default_drain_grace", with = "humantime_serde")]
    pub drain_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            execution_timeout: None,
            interrupt_grace: default_interrupt_grace(),
            terminate_grace: default_terminate_grace(),
            drain_grace: default_drain_grace(),
        }
    }
}

/// Engine process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Program started for every workflow
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Working directory, created if missing
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Returned to the engine on `RequestConfiguration`
    #[serde(default)]
    pub beamline_config_dir: Option<PathBuf>,
    /// Extra environment for the engine process
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            working_directory: None,
            beamline_config_dir: None,
            environment: BTreeMap::new(),
        }
    }
}

/// One runnable workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Name used to select the workflow
    pub name: String,
    /// Free text shown by `list`
    #[serde(default)]
    pub documentation: String,
    /// Entry class passed to the engine executable
    pub entry_reference: String,
    /// `-Dkey=value` options for the executable
    #[serde(default)]
    pub invocation_properties: BTreeMap<String, String>,
    /// `-key value` options for the executable
    #[serde(default)]
    pub invocation_options: BTreeMap<String, String>,
    /// `-Dkey=value` arguments after the entry reference
    #[serde(default)]
    pub workflow_properties: BTreeMap<String, String>,
    /// `-key value` arguments after the entry reference
    #[serde(default)]
    pub workflow_options: BTreeMap<String, String>,
}

impl WorkflowDefinition {
    /// Launch description for this workflow on `engine`.
    pub fn launch_spec(&self, engine: &EngineConfig) -> LaunchSpec {
        LaunchSpec {
            executable: engine.executable.clone(),
            invocation_properties: self.invocation_properties.clone(),
            invocation_options: self.invocation_options.clone(),
            entry_reference: self.entry_reference.clone(),
            workflow_properties: self.workflow_properties.clone(),
            workflow_options: self.workflow_options.clone(),
            working_directory: engine.working_directory.clone(),
            environment: engine.environment.clone(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_interrupt_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_terminate_grace() -> Duration {
    Duration::from_secs(9)
}

fn default_drain_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_executable() -> String {
    "java".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BridgeConfig {
    /// Load configuration from `config/bridge.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/bridge.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WFBRIDGE_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Poll interval is non-zero
    /// - Engine executable is set
    /// - Workflow names are unique and every workflow has an entry reference
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "session.poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.engine.executable.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "engine.executable cannot be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for workflow in &self.workflows {
            if workflow.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Workflow name cannot be empty".to_string(),
                ));
            }
            if !names.insert(&workflow.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate workflow name: '{}'",
                    workflow.name
                )));
            }
            if workflow.entry_reference.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Workflow '{}': 'entry_reference' cannot be empty",
                    workflow.name
                )));
            }
        }

        Ok(())
    }

    /// Looks up a configured workflow by name.
    pub fn workflow(&self, name: &str) -> AppResult<&WorkflowDefinition> {
        self.workflows
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| BridgeError::UnknownWorkflow(name.to_string()))
    }

    /// Launch description of the named workflow.
    pub fn launch_spec(&self, name: &str) -> AppResult<LaunchSpec> {
        Ok(self.workflow(name)?.launch_spec(&self.engine))
    }

    /// Address the engine listener binds.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.connection.address, self.connection.port)
    }

    /// Stop cascade timings.
    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            interrupt_grace: self.session.interrupt_grace,
            terminate_grace: self.session.terminate_grace,
            ..StopPolicy::default()
        }
    }
}
