//! Frame bodies for the extensible message and the legacy query/reply pair.
//!
//! Every builder returns a complete frame, header included. Every parser
//! takes the bytes that follow the header.

use lodestar_bson::codec::peek_document_length;

use super::header::{HEADER_LEN, Header, OpCode};
use crate::error::{DriverError, DriverResult};

/// Extensible message flag: a CRC-32C checksum trails the sections.
pub const MSG_CHECKSUM_PRESENT: u32 = 1 << 0;
/// Extensible message flag: more frames follow without a reply.
pub const MSG_MORE_TO_COME: u32 = 1 << 1;

/// Legacy query flag: the query may run on a secondary.
pub const QUERY_SECONDARY_OK: i32 = 1 << 2;

/// Legacy reply flag: the query failed and the single document holds `$err`.
pub const REPLY_QUERY_FAILURE: i32 = 1 << 1;

const SECTION_BODY: u8 = 0;
const SECTION_SEQUENCE: u8 = 1;

/// Build an extensible message frame carrying one body section.
pub fn encode_op_msg(request_id: i32, flags: u32, body: &[u8]) -> DriverResult<Vec<u8>> {
    let length = HEADER_LEN + 4 + 1 + body.len();
    let mut frame = Vec::with_capacity(length);
    frame.extend_from_slice(&header(length, request_id, OpCode::Message)?.encode());
    frame.extend_from_slice(&flags.to_le_bytes());
    frame.push(SECTION_BODY);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Build a legacy query frame against `<database>.$cmd`.
pub fn encode_op_query(
    request_id: i32,
    flags: i32,
    database: &str,
    query: &[u8],
) -> DriverResult<Vec<u8>> {
    let namespace = format!("{}.$cmd", database);
    let length = HEADER_LEN + 4 + namespace.len() + 1 + 4 + 4 + query.len();
    let mut frame = Vec::with_capacity(length);
    frame.extend_from_slice(&header(length, request_id, OpCode::Query)?.encode());
    frame.extend_from_slice(&flags.to_le_bytes());
    frame.extend_from_slice(namespace.as_bytes());
    frame.push(0);
    frame.extend_from_slice(&0i32.to_le_bytes());
    frame.extend_from_slice(&(-1i32).to_le_bytes());
    frame.extend_from_slice(query);
    Ok(frame)
}

fn header(length: usize, request_id: i32, op_code: OpCode) -> DriverResult<Header> {
    let length = i32::try_from(length)
        .map_err(|_| DriverError::protocol(format!("frame of {} bytes is too large", length)))?;
    Ok(Header {
        length,
        request_id,
        response_to: 0,
        op_code: op_code as i32,
    })
}

/// Parsed extensible message.
#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg<'a> {
    /// Flag bits.
    pub flags: u32,
    /// Raw bytes of the body section document.
    pub body: &'a [u8],
}

/// Parse an extensible message body. Exactly one body section is required;
/// document sequence sections are skipped.
pub fn parse_op_msg(bytes: &[u8]) -> DriverResult<OpMsg<'_>> {
    let mut cursor = Cursor::new(bytes);
    let flags = cursor.u32()?;
    let end = if flags & MSG_CHECKSUM_PRESENT != 0 {
        bytes
            .len()
            .checked_sub(4)
            .ok_or_else(|| DriverError::protocol("message too short for its checksum"))?
    } else {
        bytes.len()
    };

    let mut body = None;
    while cursor.position < end {
        match cursor.u8()? {
            SECTION_BODY => {
                let document = cursor.document()?;
                if body.replace(document).is_some() {
                    return Err(DriverError::protocol("message carries two body sections"));
                }
            }
            SECTION_SEQUENCE => {
                let size = cursor.i32()?;
                let size = usize::try_from(size)
                    .ok()
                    .filter(|s| *s >= 4)
                    .ok_or_else(|| DriverError::protocol("invalid document sequence size"))?;
                cursor.skip(size - 4)?;
            }
            kind => {
                return Err(DriverError::protocol(format!(
                    "unknown message section kind {}",
                    kind
                )));
            }
        }
    }
    if cursor.position != end {
        return Err(DriverError::protocol("message sections overrun the frame"));
    }

    let body = body.ok_or_else(|| DriverError::protocol("message has no body section"))?;
    Ok(OpMsg { flags, body })
}

/// Parsed legacy reply.
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply<'a> {
    /// Response flags.
    pub flags: i32,
    /// Cursor id, 0 when exhausted.
    pub cursor_id: i64,
    /// Position of the first returned document in the cursor.
    pub starting_from: i32,
    /// Raw bytes of each returned document.
    pub documents: Vec<&'a [u8]>,
}

impl OpReply<'_> {
    /// Whether the query failed.
    pub fn query_failure(&self) -> bool {
        self.flags & REPLY_QUERY_FAILURE != 0
    }
}

/// Parse a legacy reply body.
pub fn parse_op_reply(bytes: &[u8]) -> DriverResult<OpReply<'_>> {
    let mut cursor = Cursor::new(bytes);
    let flags = cursor.i32()?;
    let cursor_id = cursor.i64()?;
    let starting_from = cursor.i32()?;
    let number_returned = cursor.i32()?;
    let number_returned = usize::try_from(number_returned)
        .map_err(|_| DriverError::protocol("negative document count in reply"))?;

    let mut documents = Vec::with_capacity(number_returned.min(16));
    for _ in 0..number_returned {
        documents.push(cursor.document()?);
    }
    if cursor.position != bytes.len() {
        return Err(DriverError::protocol(format!(
            "reply declares {} documents but has {} trailing bytes",
            number_returned,
            bytes.len() - cursor.position
        )));
    }
    Ok(OpReply {
        flags,
        cursor_id,
        starting_from,
        documents,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, n: usize) -> DriverResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| DriverError::protocol("frame body is truncated"))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> DriverResult<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> DriverResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> DriverResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> DriverResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> DriverResult<i64> {
        let b = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(i64::from_le_bytes(word))
    }

    fn document(&mut self) -> DriverResult<&'a [u8]> {
        let rest = &self.bytes[self.position..];
        let length = peek_document_length(rest)
            .map_err(|e| DriverError::protocol(format!("malformed document in frame: {}", e)))?;
        self.take(length)
    }
}
