//! rexec-protocol: Wire protocol for Unreal Engine remote Python execution
//!
//! This crate defines the JSON envelope exchanged between an editor-side
//! session and engine nodes, both over UDP multicast (discovery) and over the
//! TCP command connection.

pub mod codec;
pub mod error;
pub mod message;
pub mod node;
pub mod payload;

pub use codec::{decode, encode, JsonFrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::{Message, MessageType, PROTOCOL_MAGIC, PROTOCOL_VERSION};
pub use node::NodeId;
pub use payload::{
    CommandData, CommandOutput, CommandResultData, ExecMode, OpenConnectionData, OutputType,
};
