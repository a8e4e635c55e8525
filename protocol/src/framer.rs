//! Control stream reassembly
//!
//! TCP delivers the control stream in arbitrary segments. The [`Framer`]
//! accumulates bytes and hands out complete messages in arrival order; a
//! trailing partial frame stays buffered until the rest arrives.

use crate::error::ProtocolError;
use crate::message::Message;
use crate::{KICK_OFF, MAX_PAYLOAD_SIZE, MSG_HEADER_LENGTH};
use bytes::{Buf, BytesMut};

/// Stateful byte queue that yields `(type, payload)` messages
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    /// Set once the legacy kick-off token was stripped or ruled out
    past_preamble: bool,
    max_payload: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Reject frames declaring a payload longer than `max_payload`
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            past_preamble: false,
            max_payload,
        }
    }

    /// Append `bytes` and invoke `on_message` for every complete message.
    ///
    /// Messages completed before an oversized frame header are still delivered.
    /// After an error the framer must not be fed again.
    pub fn feed<F>(&mut self, bytes: &[u8], mut on_message: F) -> Result<(), ProtocolError>
    where
        F: FnMut(Message),
    {
        self.buf.extend_from_slice(bytes);

        if !self.past_preamble && !self.strip_preamble() {
            return Ok(());
        }

        while self.buf.len() >= MSG_HEADER_LENGTH {
            let type_code = self.buf[0];
            let len = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
            if len > self.max_payload {
                return Err(ProtocolError::PayloadTooLarge {
                    max: self.max_payload,
                    actual: len,
                });
            }

            // Partial frame: wait for more bytes
            if self.buf.len() < MSG_HEADER_LENGTH + len {
                break;
            }

            self.buf.advance(MSG_HEADER_LENGTH);
            let payload = self.buf.split_to(len).freeze();
            on_message(Message::from_raw(type_code, payload));
        }

        Ok(())
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.past_preamble = false;
    }

    /// Returns true once framing may proceed.
    fn strip_preamble(&mut self) -> bool {
        let n = self.buf.len().min(KICK_OFF.len());
        if self.buf[..n] != KICK_OFF[..n] {
            // Not a kick-off token; the bytes are a regular frame
            self.past_preamble = true;
            return true;
        }
        if n < KICK_OFF.len() {
            return false;
        }

        self.buf.advance(KICK_OFF.len());
        self.past_preamble = true;
        true
    }
}
