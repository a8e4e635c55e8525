//! NDT Protocol Library
//!
//! Wire-level definitions for the NDT control channel: message types, queue
//! status codes, test kinds, message framing and server version checks.
//! Nothing in this crate performs I/O.

pub mod constants;
pub mod error;
pub mod framer;
pub mod message;
pub mod version;

pub use constants::*;
pub use error::ProtocolError;
pub use framer::Framer;
pub use message::Message;

/// Control message header: 1 type byte + 2 length bytes (big-endian)
pub const MSG_HEADER_LENGTH: usize = 3;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Token sent by servers ahead of the first frame to kick off legacy clients
pub const KICK_OFF: &[u8; 13] = b"123456 654321";
