//! Length-prefixed JSON protocol spoken between the gateway, the dispatcher
//! and its worker processes.
//!
//! Frame layout: `[4 bytes: big-endian payload length][payload: UTF-8 JSON]`.

pub mod codec;
pub mod message;

use thiserror::Error;

// Re-export common types
pub use codec::{read_message, write_message};
pub use message::{Message, TaskType};

/// Errors raised while framing, parsing or validating a message
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed after {received}/{expected} bytes")]
    ConnectionClosed { received: usize, expected: usize },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    Invalid(String),
}

impl ProtocolError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ProtocolError::Invalid(message.into())
    }
}
