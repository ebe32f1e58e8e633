//! Wire command protocol.
//!
//! A [`WireProtocol`] turns a command document into one frame, writes it,
//! reads exactly one reply frame and validates it against the request.

pub mod header;
pub mod message;
mod protocol;

pub use header::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, Header, OpCode, next_request_id};
pub use protocol::{CommandRequest, ReplyFrame, WireProtocol, read_frame};
