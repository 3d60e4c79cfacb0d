//! Typed payloads carried in the `data` field of a message

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a command payload is interpreted by the engine
///
/// The names must match the engine's `EPythonCommandExecutionMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecMode {
    /// Run as a file: a literal script with multiple statements, or a file
    /// path with optional arguments
    ExecuteFile,
    /// Run a single statement and print its result
    #[default]
    ExecuteStatement,
    /// Evaluate a single expression and return its value
    EvaluateStatement,
}

impl ExecMode {
    /// Wire name of this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::ExecuteFile => "ExecuteFile",
            ExecMode::ExecuteStatement => "ExecuteStatement",
            ExecMode::EvaluateStatement => "EvaluateStatement",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMode {
    type Err = String;

    /// Accepts the wire names as well as the short forms `file`,
    /// `statement` and `eval`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ExecuteFile" | "file" => Ok(ExecMode::ExecuteFile),
            "ExecuteStatement" | "statement" => Ok(ExecMode::ExecuteStatement),
            "EvaluateStatement" | "eval" => Ok(ExecMode::EvaluateStatement),
            other => Err(format!("unknown exec mode: {}", other)),
        }
    }
}

/// `open_connection` payload: where the node should dial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConnectionData {
    pub command_ip: String,
    pub command_port: u16,
}

/// `command` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandData {
    /// Python source, statement or file path (depending on `exec_mode`)
    pub command: String,
    /// Suppress modal UI on the engine side
    pub unattended: bool,
    pub exec_mode: ExecMode,
}

/// Severity of one captured output record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Info,
    Warning,
    Error,
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputType::Info => write!(f, "info"),
            OutputType::Warning => write!(f, "warning"),
            OutputType::Error => write!(f, "error"),
        }
    }
}

/// One line (or block) of output produced while running a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(rename = "type")]
    pub output_type: OutputType,
    pub output: String,
}

/// `command_result` payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResultData {
    pub success: bool,
    /// Value of an evaluated expression, or the error text on failure
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub output: Vec<CommandOutput>,
}
