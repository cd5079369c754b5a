//! Line-delimited JSON transport between the engine process and the gateway.
//!
//! The engine connects to the address exported in [`ADDRESS_ENV`] and writes
//! one envelope per line. Each line gets exactly one line back: the reply
//! envelope, or `null`. Lines are handed to the gateway on the blocking pool,
//! since a request call blocks until the beamline has answered. When the
//! session ends, the listener stops accepting and open connections are
//! drained rather than dropped.

use crate::abort::AbortCoordinator;
use crate::error::AppResult;
use crate::gateway::InboundGateway;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Environment variable carrying the bridge address to the engine process.
pub const ADDRESS_ENV: &str = "WORKFLOW_BRIDGE_ADDRESS";

const NO_REPLY: &str = "null";

/// Bound, not yet serving, engine listener.
#[derive(Debug)]
pub struct EngineListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl EngineListener {
    /// Binds `addr`; port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Engine listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Bound address, with the actual port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts engine connections until the session ends, then stops
    /// accepting and waits for the open connections to close.
    ///
    /// A connection keeps answering lines for `drain_grace` after the end, so
    /// the `BeamlineAbort` reply produced by the ending call, and the replies
    /// to the engine's closing calls, still reach the engine.
    pub async fn serve(self, gateway: InboundGateway, ended: AbortCoordinator, drain_grace: Duration) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = ended.ended() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Engine connected");
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            gateway.clone(),
                            ended.clone(),
                            drain_grace,
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept engine connection"),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    log_finished(finished);
                }
            }
        }

        drop(self.listener);
        debug!(open = connections.len(), "Engine listener closed, draining connections");
        while let Some(finished) = connections.join_next().await {
            log_finished(finished);
        }
    }
}

fn log_finished(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        warn!(error = %e, "Engine connection task failed");
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: InboundGateway,
    ended: AbortCoordinator,
    drain_grace: Duration,
) {
    if let Err(e) = handle_lines(stream, gateway, ended, drain_grace).await {
        warn!(%peer, error = %e, "Engine connection closed with error");
    } else {
        debug!(%peer, "Engine disconnected");
    }
}

async fn handle_lines(
    stream: TcpStream,
    gateway: InboundGateway,
    ended: AbortCoordinator,
    drain_grace: Duration,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let closing = async {
        ended.ended().await;
        tokio::time::sleep(drain_grace).await;
    };
    tokio::pin!(closing);

    loop {
        // `next_line` is cancel safe; a line being answered is never cut off.
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut closing => {
                debug!("Session over, closing engine connection");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let gateway = gateway.clone();
        let reply = tokio::task::spawn_blocking(move || gateway.receive_json(&line))
            .await
            .map_err(io::Error::other)?;

        let mut out = reply.unwrap_or_else(|| NO_REPLY.to_string());
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationRegistry;
    use crate::dispatch::QueueItem;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn serving(
        drain_grace: Duration,
    ) -> (
        SocketAddr,
        mpsc::UnboundedReceiver<QueueItem>,
        tokio::task::JoinHandle<()>,
    ) {
        let registry = Arc::new(CorrelationRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let abort = AbortCoordinator::new(registry.clone(), tx.clone());
        let gateway = InboundGateway::new(registry, tx, abort.clone(), Duration::from_millis(20));

        let listener = EngineListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(listener.serve(gateway, abort, drain_grace));
        (addr, rx, server)
    }

    #[tokio::test]
    async fn test_info_line_gets_null() {
        let (addr, mut rx, server) = serving(Duration::from_millis(100)).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"enactmentId\":\"e1\",\"typeTag\":\"String\",\"payload\":{\"text\":\"hello\"}}\n")
            .await
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("null"));
        assert!(matches!(rx.recv().await, Some(QueueItem::Info(_))));

        server.abort();
    }

    #[tokio::test]
    async fn test_ending_reply_written_before_close() {
        let (addr, _rx, server) = serving(Duration::from_millis(200)).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        // Malformed call: the reply is BeamlineAbort and the session ends.
        writer.write_all(b"garbage\n").await.unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.contains("\"typeTag\":\"BeamlineAbort\""));

        // Closing calls within the grace period are still answered.
        writer
            .write_all(b"{\"enactmentId\":\"e1\",\"typeTag\":\"WorkflowAborted\",\"payload\":{}}\n")
            .await
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("null"));

        // Then the connection is closed and the listener finishes by itself.
        assert_eq!(lines.next_line().await.unwrap(), None);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
