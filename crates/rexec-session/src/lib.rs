//! rexec-session: Discovery and command connections to engine nodes
//!
//! A [`Session`] owns three pieces:
//!
//! - **Discovery** ([`discovery`]): a UDP multicast channel that pings the
//!   group, tracks the nodes that answer, and expires silent ones
//! - **Command channel** ([`command`]): a TCP connection dialed by one node,
//!   over which commands run strictly one at a time
//! - **Events**: callbacks for node and connection lifecycle changes
//!
//! ```ignore
//! let session = Session::new(RemoteExecutionConfig::default());
//! session.start()?;
//! let node = session
//!     .get_first_remote_node(NODE_PING_INTERVAL, Duration::from_secs(5))
//!     .await?;
//! session.open_command_connection(&node, false, DEFAULT_CONNECT_TIMEOUT).await?;
//! let result = session
//!     .run_command("1+1", true, ExecMode::EvaluateStatement)
//!     .await?;
//! assert_eq!(result.result, "2");
//! session.stop().await;
//! ```

pub mod command;
pub mod discovery;
mod session;

pub use command::{CommandChannel, CommandListener};
pub use discovery::{
    DiscoveryChannel, DiscoveryTransport, MulticastTransport, MulticastTransportFactory,
    NodeRegistry, TransportFactory,
};
pub use session::Session;
