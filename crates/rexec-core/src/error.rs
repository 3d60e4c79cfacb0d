//! Core error types for remote execution

use std::net::SocketAddr;
use std::path::PathBuf;

use rexec_protocol::{NodeId, ProtocolError};
use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum RexecError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while setting up or using the discovery socket
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The UDP socket could not be created or bound
    #[error("Failed to bind discovery socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Joining the multicast group or setting a socket option failed
    #[error("Failed to configure multicast group {group}: {source}")]
    Multicast {
        group: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Discovery has not been started
    #[error("Discovery is not running")]
    NotRunning,

    /// A message could not be sent on the discovery socket
    #[error("Failed to send discovery message: {0}")]
    Send(#[source] std::io::Error),

    /// A message could not be encoded
    #[error("Failed to encode discovery message: {0}")]
    Encode(#[from] ProtocolError),
}

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// A discovery or connection deadline elapsed
    #[error("{0}")]
    Timeout(String),

    /// Another node already holds the command connection
    #[error("Already connected to node {node_id}")]
    AlreadyConnected { node_id: NodeId },

    /// An operation requiring an open command connection was called without one
    #[error("No command connection is open")]
    NotConnected,

    /// The command connection failed; it is now closed
    #[error("Command channel error: {0}")]
    CommandChannel(String),

    /// The remote node reported that the command failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The session was stopped while the connection was being opened
    #[error("Session stopped while opening the command connection")]
    Stopped,

    /// A concurrent connection attempt this call was waiting on failed
    #[error("Connection attempt failed: {0}")]
    ConnectionAttemptFailed(String),

    /// Discovery error
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
