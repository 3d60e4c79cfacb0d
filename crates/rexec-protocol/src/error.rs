//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding, decoding or framing messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A message violates a required-field contract and cannot be encoded
    #[error("Invalid message: {0}")]
    Validation(String),

    /// The peer speaks a different protocol version or family
    #[error("Protocol mismatch: \"{field}\" is incorrect (got {got}, expected {expected})")]
    ProtocolMismatch {
        field: &'static str,
        expected: String,
        got: String,
    },

    /// The bytes are not a well-formed message
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Buffered stream data exceeds the frame limit without completing a frame
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error comes from a peer that should simply be ignored
    /// (bad JSON, wrong version/magic) rather than a local failure.
    pub fn is_foreign(&self) -> bool {
        matches!(
            self,
            ProtocolError::ProtocolMismatch { .. } | ProtocolError::Malformed(_)
        )
    }
}
