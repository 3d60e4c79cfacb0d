//! rexec-core: Core abstractions and configuration for remote execution
//!
//! This crate provides the domain types, configuration structures, error
//! taxonomy and event registry shared by the session layer and the CLI.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use error::{ConfigError, DiscoveryError, RexecError, SessionError};
pub use events::{CloseReason, EventKind, EventRegistry, SessionEvent, SubscriptionId};
pub use types::{CommandResult, ConnectionState, RemoteNode};
