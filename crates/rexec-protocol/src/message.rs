//! Message types for the remote execution protocol
//!
//! Every datagram on the discovery group and every frame on the command
//! connection is one JSON envelope:
//!
//! ```text
//! { "version": 1, "magic": "ue_py", "type": "ping", "source": "<id>", "dest": "<id>", "data": { ... } }
//! ```
//!
//! `dest` and `data` are optional and are omitted from the wire when absent.
//!
//! # Message Flow
//!
//! 1. Session multicasts `Ping` every ping interval
//! 2. Engine nodes answer with `Pong` (dest = session), carrying project info
//! 3. Session opens a TCP listener and multicasts `OpenConnection` (dest = node)
//! 4. Node dials the advertised endpoint; `Command` / `CommandResult` flow over TCP
//! 5. Session multicasts `CloseConnection` (dest = node) and drops the socket

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::node::NodeId;
use crate::payload::{CommandData, CommandResultData, ExecMode, OpenConnectionData};

/// Protocol version number understood by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic identifier of the protocol family.
pub const PROTOCOL_MAGIC: &str = "ue_py";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Service discovery request (UDP)
    Ping,
    /// Service discovery response (UDP)
    Pong,
    /// Ask a node to dial a TCP command connection (UDP)
    OpenConnection,
    /// Ask a node to drop its TCP command connection (UDP)
    CloseConnection,
    /// Execute a remote Python command (TCP)
    Command,
    /// Result of executing a remote Python command (TCP)
    CommandResult,
}

impl MessageType {
    /// Wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::OpenConnection => "open_connection",
            MessageType::CloseConnection => "close_connection",
            MessageType::Command => "command",
            MessageType::CommandResult => "command_result",
        }
    }

    /// Parse a wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "open_connection" => Some(Self::OpenConnection),
            "close_connection" => Some(Self::CloseConnection),
            "command" => Some(Self::Command),
            "command_result" => Some(Self::CommandResult),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message (version and magic are implied)
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Kind of message
    pub message_type: MessageType,
    /// Node that sent the message
    pub source: NodeId,
    /// Intended recipient; `None` addresses every node
    pub dest: Option<NodeId>,
    /// Type-specific payload
    pub data: Option<Value>,
}

impl Message {
    /// Create a new message
    pub fn new(
        message_type: MessageType,
        source: NodeId,
        dest: Option<NodeId>,
        data: Option<Value>,
    ) -> Self {
        Self {
            message_type,
            source,
            dest,
            data,
        }
    }

    /// Discovery ping addressed to every node
    pub fn ping(source: NodeId) -> Self {
        Self::new(MessageType::Ping, source, None, None)
    }

    /// Discovery answer carrying node metadata
    pub fn pong(source: NodeId, dest: NodeId, data: Value) -> Self {
        Self::new(MessageType::Pong, source, Some(dest), Some(data))
    }

    /// Ask `dest` to connect to the advertised command endpoint
    pub fn open_connection(source: NodeId, dest: NodeId, endpoint: OpenConnectionData) -> Self {
        Self::new(
            MessageType::OpenConnection,
            source,
            Some(dest),
            Some(to_value(&endpoint)),
        )
    }

    /// Ask `dest` to drop its command connection
    pub fn close_connection(source: NodeId, dest: NodeId) -> Self {
        Self::new(MessageType::CloseConnection, source, Some(dest), None)
    }

    /// Python command to execute
    pub fn command(
        source: NodeId,
        command: impl Into<String>,
        unattended: bool,
        exec_mode: ExecMode,
    ) -> Self {
        let data = CommandData {
            command: command.into(),
            unattended,
            exec_mode,
        };
        Self::new(MessageType::Command, source, None, Some(to_value(&data)))
    }

    /// Result of a command, as sent by an engine node
    pub fn command_result(
        source: NodeId,
        dest: Option<NodeId>,
        result: &CommandResultData,
    ) -> Self {
        Self::new(
            MessageType::CommandResult,
            source,
            dest,
            Some(to_value(result)),
        )
    }

    /// Test whether this message should be received by `local`: it was not
    /// sent by `local` and is either broadcast or addressed to `local`.
    pub fn passes_receive_filter(&self, local: &NodeId) -> bool {
        &self.source != local && self.dest.as_ref().map_or(true, |dest| dest == local)
    }

    /// Parse the payload into a typed structure
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| {
            ProtocolError::Malformed(format!("invalid \"{}\" payload: {}", self.message_type, e))
        })
    }
}

// Payload structs contain only strings, bools, integers and enums.
fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}
