//! Streaming protocol
//!
//! Wire framing for the long-lived response and the form-encoded control
//! requests clients send alongside it.

pub mod frame;
mod request;

pub use request::*;

use thiserror::Error;

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Invalid frame length: {0}")]
    InvalidLength(String),

    #[error("Frame of {0} bytes exceeds the decoder limit")]
    FrameTooLarge(usize),

    #[error("Frame payload is not followed by a delimiter")]
    MissingDelimiter,

    #[error("Invalid preamble: {0}")]
    InvalidPreamble(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
