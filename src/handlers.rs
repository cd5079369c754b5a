//! Handlers every beamline gets for free.
//!
//! Control applications extend the table from [`builtin`] with their own
//! handlers for the requests that move hardware (centring, collection,
//! lattice choice and so on).

use crate::config::BridgeConfig;
use crate::dispatch::{HandlerOutcome, HandlerTable, HandlerTableBuilder, InfoHandler, RequestHandler};
use crate::error::AppResult;
use crate::messages::{ConfigurationData, CorrelationId, MessageType, Payload, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Echoes engine info messages to the log.
///
/// Text from a subprocess is prefixed with that subprocess's name, tracked
/// by correlation id between `SubprocessStarted` and `SubprocessStopped`.
#[derive(Debug, Clone, Default)]
pub struct InfoEcho {
    subprocesses: Arc<Mutex<HashMap<CorrelationId, String>>>,
}

impl InfoEcho {
    /// Echo with no subprocesses tracked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the running subprocess with this correlation id.
    pub fn subprocess_name(&self, correlation_id: &CorrelationId) -> Option<String> {
        self.subprocesses.lock().get(correlation_id).cloned()
    }
}

#[async_trait]
impl InfoHandler for InfoEcho {
    async fn handle(&self, payload: Payload, correlation_id: Option<CorrelationId>) {
        match payload {
            Payload::Text(info) => {
                match correlation_id.and_then(|id| self.subprocess_name(&id)) {
                    Some(name) => info!("{name}: {}", info.text),
                    None => info!("{}", info.text),
                }
            }
            Payload::SubprocessStarted(started) => {
                if let Some(id) = correlation_id {
                    self.subprocesses.lock().insert(id, started.name.clone());
                }
                info!("{} : STARTING", started.name);
            }
            Payload::SubprocessStopped => {
                let name = correlation_id
                    .and_then(|id| self.subprocesses.lock().remove(&id))
                    .unwrap_or_else(|| "Unknown process".to_string());
                info!("{name} : FINISHED");
            }
            other => debug!(message_type = %other.message_type(), "Ignoring non-info payload"),
        }
    }
}

/// Answers `RequestConfiguration` with the beamline configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigurationProvider {
    location: PathBuf,
}

impl ConfigurationProvider {
    /// Provider answering with `location`.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

#[async_trait]
impl RequestHandler for ConfigurationProvider {
    async fn handle(&self, _payload: Payload, _correlation_id: Option<CorrelationId>) -> HandlerOutcome {
        HandlerOutcome::Ok(Response::ConfigurationData(ConfigurationData {
            location: self.location.clone(),
        }))
    }
}

/// Table with the info echo, `PrepareForCentring` and, when a beamline
/// configuration directory is set, `RequestConfiguration`.
pub fn builtin(config: &BridgeConfig) -> AppResult<HandlerTableBuilder> {
    let echo = InfoEcho::new();
    let mut builder = HandlerTable::builder()
        .info(MessageType::String, echo.clone())?
        .info(MessageType::SubprocessStarted, echo.clone())?
        .info(MessageType::SubprocessStopped, echo)?
        .request(
            MessageType::PrepareForCentring,
            |_payload: Payload, _correlation_id: Option<CorrelationId>| async {
                HandlerOutcome::Ok(Response::ready_for_centring())
            },
        )?;
    if let Some(dir) = &config.engine.beamline_config_dir {
        builder = builder.request(
            MessageType::RequestConfiguration,
            ConfigurationProvider::new(dir.clone()),
        )?;
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{SubprocessStarted, TextInfo};

    #[tokio::test]
    async fn test_subprocess_names_tracked_by_correlation() {
        let echo = InfoEcho::new();
        let id = CorrelationId("c7".into());

        echo.handle(
            Payload::SubprocessStarted(SubprocessStarted {
                name: "XDS".into(),
            }),
            Some(id.clone()),
        )
        .await;
        assert_eq!(echo.subprocess_name(&id).as_deref(), Some("XDS"));

        echo.handle(
            Payload::Text(TextInfo {
                text: "indexing".into(),
            }),
            Some(id.clone()),
        )
        .await;
        echo.handle(Payload::SubprocessStopped, Some(id.clone())).await;
        assert_eq!(echo.subprocess_name(&id), None);
    }

    #[tokio::test]
    async fn test_builtin_table() {
        let mut config = BridgeConfig::default();
        let table = builtin(&config).unwrap().build();
        assert!(table.handles(MessageType::String));
        assert!(table.handles(MessageType::PrepareForCentring));
        assert!(!table.handles(MessageType::RequestConfiguration));

        config.engine.beamline_config_dir = Some(PathBuf::from("/opt/beamline/config"));
        let table = builtin(&config).unwrap().build();
        let handler = table
            .request_handler(MessageType::RequestConfiguration)
            .unwrap();
        let outcome = handler.handle(Payload::RequestConfiguration, None).await;
        assert_eq!(
            outcome,
            HandlerOutcome::Ok(Response::ConfigurationData(ConfigurationData {
                location: PathBuf::from("/opt/beamline/config"),
            }))
        );
    }
}
