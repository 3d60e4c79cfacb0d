//! TCP command connection
//!
//! [`CommandListener`] hosts the endpoint a node dials after `open_connection`;
//! [`CommandChannel`] serves commands over the accepted stream.

mod channel;
mod listener;

pub use channel::CommandChannel;
pub use listener::CommandListener;
