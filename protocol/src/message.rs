//! Control channel messages
//!
//! ```text
//! +------+--------+--------+---------------------+
//! | type | len hi | len lo | payload (len bytes) |
//! +------+--------+--------+---------------------+
//! ```
//!
//! The payload is text or raw bytes depending on the message type; the frame
//! itself does not say which.

use crate::constants::{MessageType, TestSuite};
use crate::error::ProtocolError;
use crate::{MAX_PAYLOAD_SIZE, MSG_HEADER_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// One framed control message
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    type_code: u8,
    payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self::from_raw(kind.to_u8(), payload)
    }

    /// Build a message from a type byte that may not be a known [`MessageType`]
    pub fn from_raw(type_code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            type_code,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Login request: a single byte holding the requested test mask
    pub fn login(suite: TestSuite) -> Self {
        Self::new(MessageType::Login, vec![suite.bits()])
    }

    /// Empty waiting reply to a queue heartbeat
    pub fn waiting() -> Self {
        Self::empty(MessageType::Waiting)
    }

    pub fn test_data(text: impl Into<String>) -> Self {
        Self::new(MessageType::TestData, text.into().into_bytes())
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.type_code)
    }

    /// Like [`kind`](Self::kind), but an unknown type byte is an error
    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        self.kind()
            .ok_or(ProtocolError::UnknownMessageType(self.type_code))
    }

    pub fn type_code(&self) -> u8 {
        self.type_code
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Parse the payload as a single decimal value, ignoring surrounding whitespace
    pub fn parse_number<T: FromStr>(&self) -> Result<T, ProtocolError> {
        let text = self.payload_str();
        text.trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidPayload(format!("expected a number, got '{}'", text)))
    }

    /// Encode header + payload
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }

        let mut buf = BytesMut::with_capacity(MSG_HEADER_LENGTH + self.payload.len());
        buf.put_u8(self.type_code);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        match self.kind() {
            Some(kind) => s.field("kind", &kind),
            None => s.field("type_code", &self.type_code),
        };
        s.field("len", &self.payload.len()).finish()
    }
}
