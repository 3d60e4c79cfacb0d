//! Command endpoint listener
//!
//! The session hosts the TCP endpoint and the engine node dials in after it
//! receives `open_connection`. One listener serves one connection attempt.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use rexec_core::SessionError;
use rexec_protocol::{NodeId, OpenConnectionData};

/// A bound listener waiting for a node to connect
pub struct CommandListener {
    listener: TcpListener,
    advertised: SocketAddr,
}

impl CommandListener {
    /// Bind to `endpoint`. Port 0 picks a free port.
    pub async fn bind(endpoint: SocketAddr) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(endpoint).await.map_err(|e| {
            SessionError::CommandChannel(format!(
                "Failed to bind command endpoint {}: {}",
                endpoint, e
            ))
        })?;
        let local = listener.local_addr().map_err(|e| {
            SessionError::CommandChannel(format!("Failed to read command endpoint: {}", e))
        })?;

        // Nodes dial the configured address; only the port may differ
        let advertised = SocketAddr::new(endpoint.ip(), local.port());
        tracing::debug!("Command listener bound on {}", local);

        Ok(Self {
            listener,
            advertised,
        })
    }

    /// Endpoint to send in `open_connection`
    pub fn advertised(&self) -> OpenConnectionData {
        OpenConnectionData {
            command_ip: self.advertised.ip().to_string(),
            command_port: self.advertised.port(),
        }
    }

    /// Address nodes are told to dial
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    /// Wait up to `timeout` for `node_id` to connect. The listener is closed
    /// afterwards either way.
    pub async fn accept(
        self,
        node_id: &NodeId,
        timeout: Duration,
    ) -> Result<(TcpStream, SocketAddr), SessionError> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                }
                tracing::debug!("Node {} connected from {}", node_id, peer);
                Ok((stream, peer))
            }
            Ok(Err(e)) => Err(SessionError::CommandChannel(format!(
                "Failed to accept command connection: {}",
                e
            ))),
            Err(_) => Err(SessionError::Timeout(format!(
                "Timed out waiting for node {} to open a command connection",
                node_id
            ))),
        }
    }
}
