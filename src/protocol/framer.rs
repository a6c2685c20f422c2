//! Backend stream framing
//!
//! TCP hands the client arbitrary chunks; a backend message is
//! `tag(1) | length(4, big-endian, inclusive of itself) | body(length-4)`.
//! The framer buffers unconsumed bytes between reads and yields one typed
//! message per complete frame, in stream order. Bytes are never dropped or
//! duplicated, whatever the chunk boundaries.

use super::decode::decode_body;
use super::message::BackendMessage;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};

/// Maximum message length (1 GiB), matching PostgreSQL's own
/// `PQ_LARGE_MESSAGE_LIMIT`. Length fields beyond it are rejected before any
/// allocation happens.
const MAX_MESSAGE_LENGTH: usize = 1_073_741_824;

/// Header = tag + length word
const HEADER_LEN: usize = 5;

/// Incremental backend-message reassembler.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
    /// Parsed header of the frame in progress: (tag, body length)
    header: Option<(u8, usize)>,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            header: None,
        }
    }

    /// Append a chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete message, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed; call again after `extend`.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>> {
        if self.header.is_none() {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let tag = self.buf[0];
            let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
            if len < 4 {
                return Err(Error::Protocol(format!(
                    "message length {} below minimum for tag 0x{:02X}",
                    len, tag
                )));
            }
            let body_len = len as usize - 4;
            if body_len > MAX_MESSAGE_LENGTH {
                return Err(Error::Protocol(format!(
                    "message length {} exceeds maximum allowed {}",
                    len, MAX_MESSAGE_LENGTH
                )));
            }
            self.buf.advance(HEADER_LEN);
            self.header = Some((tag, body_len));
        }

        let (tag, body_len) = self.header.expect("header parsed above");
        if self.buf.len() < body_len {
            return Ok(None);
        }

        let body = self.buf.split_to(body_len);
        self.header = None;
        decode_body(tag, &body).map(Some)
    }

    /// Bytes buffered but not yet assembled into a message.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len() + if self.header.is_some() { HEADER_LEN } else { 0 }
    }
}
