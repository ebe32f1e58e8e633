//! Request/response exchange over one channel.

use std::fmt;

use lodestar_bson::codec::decode_document;
use lodestar_bson::raw::BsonWriter;
use lodestar_bson::{BsonError, BsonSerializer, Document};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::header::{HEADER_LEN, Header, OpCode};
use super::message::{self, QUERY_SECONDARY_OK};
use crate::error::{DriverError, DriverResult};
use crate::read_preference::ReadPreference;

/// Frame format used to carry a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireProtocol {
    /// Extensible message (opcode 2013).
    #[default]
    OpMsg,
    /// Legacy query against `<db>.$cmd` (opcode 2004), answered by a legacy
    /// reply (opcode 1).
    LegacyQuery,
}

impl WireProtocol {
    fn reply_op_code(&self) -> OpCode {
        match self {
            Self::OpMsg => OpCode::Message,
            Self::LegacyQuery => OpCode::Reply,
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpMsg => f.write_str("OP_MSG"),
            Self::LegacyQuery => f.write_str("OP_QUERY"),
        }
    }
}

/// What to send.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    /// Target database.
    pub database: &'a str,
    /// Command document; its first key names the command.
    pub command: &'a Document,
    /// Read preference the server should apply.
    pub read_preference: &'a ReadPreference,
    /// Whether the command only reads.
    pub is_query: bool,
}

impl CommandRequest<'_> {
    /// The command name, taken from the first key.
    pub fn command_name(&self) -> &str {
        self.command.first_key().unwrap_or_default()
    }
}

/// A validated reply frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    /// Id of the request this frame answers.
    pub response_to: i32,
    /// Raw reply document.
    pub document: Vec<u8>,
    /// Legacy reply carried the query failure flag.
    pub query_failure: bool,
}

impl ReplyFrame {
    /// Check the reply status and decode the result.
    ///
    /// Returns the reply document alongside the decoded value so observers
    /// can see what the server sent.
    pub fn into_result<R>(
        self,
        serializer: &dyn BsonSerializer<R>,
    ) -> DriverResult<(Document, R)> {
        let reply = decode_document(&self.document)?;
        if self.query_failure || !reply_ok(&reply) {
            return Err(DriverError::command(reply));
        }
        let mut reader = lodestar_bson::raw::BsonReader::new(&self.document);
        let value = serializer.deserialize(&mut reader)?;
        Ok((reply, value))
    }
}

/// A reply without `ok` counts as success; a numeric `ok` must equal 1.
fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        None => true,
        Some(value) => match value.as_number() {
            Some(ok) => ok == 1.0,
            None => value.as_bool().unwrap_or(false),
        },
    }
}

impl WireProtocol {
    /// Encode `request` as a complete frame.
    pub fn encode(&self, request_id: i32, request: &CommandRequest<'_>) -> DriverResult<Vec<u8>> {
        match self {
            Self::OpMsg => {
                let body = encode_command(request.command, |writer| {
                    writer.write_name("$db")?;
                    writer.write_string(request.database)?;
                    if !request.read_preference.is_primary() {
                        writer.write_name("$readPreference")?;
                        writer.write_document(&request.read_preference.to_document())?;
                    }
                    Ok(())
                })?;
                message::encode_op_msg(request_id, 0, &body)
            }
            Self::LegacyQuery => {
                let body = encode_command(request.command, |_| Ok(()))?;
                let flags = if request.is_query && !request.read_preference.is_primary() {
                    QUERY_SECONDARY_OK
                } else {
                    0
                };
                message::encode_op_query(request_id, flags, request.database, &body)
            }
        }
    }

    /// Write one request and read its reply.
    ///
    /// A request that is too large to send fails before anything is written.
    /// Any later error leaves the stream in an unknown state; the caller must
    /// not reuse it.
    pub async fn exchange<S>(
        &self,
        stream: &mut S,
        request_id: i32,
        request: &CommandRequest<'_>,
        max_message_size: usize,
    ) -> DriverResult<ReplyFrame>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let frame = self.encode(request_id, request)?;
        if frame.len() > max_message_size {
            return Err(BsonError::invalid_length(format!(
                "request of {} bytes exceeds the maximum message size of {}",
                frame.len(),
                max_message_size
            ))
            .into());
        }
        stream.write_all(&frame).await?;
        stream.flush().await?;
        trace!(request_id, bytes = frame.len(), protocol = %self, "request written");

        let (header, body) = read_frame(stream, max_message_size).await?;
        if header.response_to != request_id {
            return Err(DriverError::protocol(format!(
                "reply answers request {} but {} was sent",
                header.response_to, request_id
            )));
        }
        let expected = self.reply_op_code();
        match OpCode::from_i32(header.op_code) {
            Some(op_code) if op_code == expected => {}
            Some(op_code) => {
                return Err(DriverError::protocol(format!(
                    "expected {:?} in reply, got {:?}",
                    expected, op_code
                )));
            }
            None => {
                return Err(DriverError::protocol(format!(
                    "unknown reply opcode {}",
                    header.op_code
                )));
            }
        }

        match self {
            Self::OpMsg => {
                let msg = message::parse_op_msg(&body)?;
                Ok(ReplyFrame {
                    response_to: header.response_to,
                    document: msg.body.to_vec(),
                    query_failure: false,
                })
            }
            Self::LegacyQuery => {
                let reply = message::parse_op_reply(&body)?;
                let first = reply
                    .documents
                    .first()
                    .ok_or_else(|| DriverError::protocol("legacy reply carries no document"))?;
                Ok(ReplyFrame {
                    response_to: header.response_to,
                    document: first.to_vec(),
                    query_failure: reply.query_failure(),
                })
            }
        }
    }

    /// Exchange one command and decode its result with `serializer`.
    pub async fn execute<S, R>(
        &self,
        stream: &mut S,
        request_id: i32,
        request: &CommandRequest<'_>,
        serializer: &dyn BsonSerializer<R>,
        max_message_size: usize,
    ) -> DriverResult<R>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let frame = self
            .exchange(stream, request_id, request, max_message_size)
            .await?;
        frame.into_result(serializer).map(|(_, value)| value)
    }
}

/// Write `command` minus any routing fields, then let `extra` append its own.
fn encode_command<F>(command: &Document, extra: F) -> DriverResult<Vec<u8>>
where
    F: FnOnce(&mut BsonWriter) -> lodestar_bson::BsonResult<()>,
{
    let mut writer = BsonWriter::new();
    writer.write_start_document()?;
    for (name, value) in command.iter() {
        if name == "$db" || name == "$readPreference" {
            continue;
        }
        writer.write_name(name)?;
        writer.write_value(value)?;
    }
    extra(&mut writer)?;
    writer.write_end_document()?;
    Ok(writer.into_bytes()?)
}

/// Read one frame: header, then the rest of the declared length.
pub async fn read_frame<S>(stream: &mut S, max_message_size: usize) -> DriverResult<(Header, Vec<u8>)>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; HEADER_LEN];
    stream.read_exact(&mut head).await?;
    let header = Header::decode(&head)?;
    let length = header.validate_length(max_message_size)?;

    let mut body = vec![0u8; length - HEADER_LEN];
    stream.read_exact(&mut body).await.map_err(|e| {
        DriverError::connection_closed(format!(
            "stream ended inside a {}-byte frame: {}",
            length, e
        ))
    })?;
    Ok((header, body))
}
