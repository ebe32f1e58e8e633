//! Frame header.
//!
//! ```text
//! ┌────────────┬────────────┬─────────────┬────────────┐
//! │ Length     │ Request ID │ Response To │ Op Code    │
//! │ int32 LE   │ int32 LE   │ int32 LE    │ int32 LE   │
//! └────────────┴────────────┴─────────────┴────────────┘
//! ```
//!
//! The length counts the whole frame, header included.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{DriverError, DriverResult};

/// Header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Default largest frame accepted from a server (48 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Next process-wide request id.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Frame operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Legacy reply to a query.
    Reply = 1,
    /// Legacy query.
    Query = 2004,
    /// Extensible message.
    Message = 2013,
}

impl OpCode {
    /// Map a raw code.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Reply),
            2004 => Some(Self::Query),
            2013 => Some(Self::Message),
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame length including the header.
    pub length: i32,
    /// Sender-assigned id.
    pub request_id: i32,
    /// Id of the request this frame answers; 0 for requests.
    pub response_to: i32,
    /// Raw operation code.
    pub op_code: i32,
}

impl Header {
    /// Encode to bytes.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        buf
    }

    /// Decode from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> DriverResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(DriverError::protocol(format!(
                "frame header needs {} bytes, got {}",
                HEADER_LEN,
                buf.len()
            )));
        }
        let word = |i: usize| i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            length: word(0),
            request_id: word(4),
            response_to: word(8),
            op_code: word(12),
        })
    }

    /// Check the declared length against the header size and `max_message_size`.
    pub fn validate_length(&self, max_message_size: usize) -> DriverResult<usize> {
        match usize::try_from(self.length) {
            Ok(len) if (HEADER_LEN..=max_message_size).contains(&len) => Ok(len),
            _ => Err(DriverError::protocol(format!(
                "frame length {} outside [{}, {}]",
                self.length, HEADER_LEN, max_message_size
            ))),
        }
    }
}
