//! Core domain types

use std::fmt;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use rexec_protocol::{CommandOutput, CommandResultData, NodeId, OutputType};

use crate::error::SessionError;

/// An engine instance found through discovery
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNode {
    /// Identifier assigned by the engine process
    pub node_id: NodeId,
    /// Metadata from the node's latest announcement
    pub data: Map<String, Value>,
    /// When the node was first discovered
    pub first_seen: Instant,
    /// When the node last announced itself
    pub last_seen: Instant,
}

impl RemoteNode {
    /// Create a node from its first announcement
    pub fn new(node_id: NodeId, data: Map<String, Value>, now: Instant) -> Self {
        Self {
            node_id,
            data,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Record a later announcement
    pub fn refresh(&mut self, data: Map<String, Value>, now: Instant) {
        self.data = data;
        self.last_seen = now;
    }

    /// Whether the node has been silent for longer than `timeout`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    /// String metadata field
    pub fn field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn project_name(&self) -> Option<&str> {
        self.field("project_name")
    }

    pub fn project_root(&self) -> Option<&str> {
        self.field("project_root")
    }

    pub fn engine_version(&self) -> Option<&str> {
        self.field("engine_version")
    }

    pub fn engine_root(&self) -> Option<&str> {
        self.field("engine_root")
    }

    pub fn user(&self) -> Option<&str> {
        self.field("user")
    }

    pub fn machine(&self) -> Option<&str> {
        self.field("machine")
    }
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.project_name() {
            Some(name) => write!(f, "{} ({})", name, self.node_id),
            None => write!(f, "{}", self.node_id),
        }
    }
}

/// Lifecycle state of the command connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in progress
    Closed,
    /// Listening for the node to dial in
    Opening,
    /// Commands can be sent
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Opening => write!(f, "opening"),
            ConnectionState::Open => write!(f, "open"),
        }
    }
}

/// Outcome of a command executed on a remote node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    /// Whether the command ran without raising
    pub success: bool,
    /// Evaluated value, or the error text when `success` is false
    pub result: String,
    /// Output records captured while the command ran
    pub output: Vec<CommandOutput>,
}

impl CommandResult {
    /// Whether any output record has error severity
    pub fn has_errors(&self) -> bool {
        self.output
            .iter()
            .any(|record| record.output_type == OutputType::Error)
    }

    /// Turn a reported failure into an error
    pub fn into_checked(self) -> Result<Self, SessionError> {
        if self.success {
            Ok(self)
        } else {
            Err(SessionError::CommandFailed(self.result))
        }
    }
}

impl From<CommandResultData> for CommandResult {
    fn from(data: CommandResultData) -> Self {
        Self {
            success: data.success,
            result: data.result,
            output: data.output,
        }
    }
}
