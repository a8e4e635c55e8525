//! Protocol error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Payload too large: maximum {max}, got {actual}")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}
