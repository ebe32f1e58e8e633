//! Stateful binary reader.

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::oid::ObjectId;
use crate::value::{Binary, BinarySubtype, Bson, DateTime, ElementType, Regex, Timestamp};

use super::{ContextKind, DEFAULT_MAX_DOCUMENT_SIZE};

/// What the reader expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Before the top-level document.
    Initial,
    /// Positioned at an element type tag (or a terminator).
    Type,
    /// Positioned at an element name.
    Name,
    /// Positioned at an element value.
    Value,
    /// At the terminator of the innermost document.
    EndOfDocument,
    /// At the terminator of the innermost array.
    EndOfArray,
    /// The top-level document has been consumed.
    Done,
}

#[derive(Debug)]
struct Context {
    kind: ContextKind,
    end: usize,
}

/// Reads one document from a byte slice, one element at a time.
#[derive(Debug)]
pub struct BsonReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    state: ReaderState,
    stack: Vec<Context>,
    current_type: Option<ElementType>,
    max_document_size: usize,
}

impl<'a> BsonReader<'a> {
    /// Create a reader over `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            state: ReaderState::Initial,
            stack: Vec::new(),
            current_type: None,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
        }
    }

    /// Override the document size limit.
    pub fn with_max_document_size(mut self, max_document_size: usize) -> Self {
        self.max_document_size = max_document_size;
        self
    }

    /// Current state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Type of the element whose name or value is next.
    pub fn current_type(&self) -> Option<ElementType> {
        self.current_type
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Open the top-level document or an embedded document value.
    pub fn read_start_document(&mut self) -> BsonResult<()> {
        match self.state {
            ReaderState::Initial => {}
            ReaderState::Value if self.current_type == Some(ElementType::EmbeddedDocument) => {}
            state => {
                return Err(BsonError::invalid_state(format!(
                    "cannot start a document in state {:?} (current type {:?})",
                    state, self.current_type
                )));
            }
        }
        self.open(ContextKind::Document)
    }

    /// Close the innermost document; the terminator must be next.
    pub fn read_end_document(&mut self) -> BsonResult<()> {
        if self.state == ReaderState::Type {
            self.read_terminator()?;
        }
        if self.state != ReaderState::EndOfDocument {
            return Err(BsonError::invalid_state(format!(
                "cannot end a document in state {:?}",
                self.state
            )));
        }
        self.close()
    }

    /// Open an array value.
    pub fn read_start_array(&mut self) -> BsonResult<()> {
        if self.state != ReaderState::Value || self.current_type != Some(ElementType::Array) {
            return Err(BsonError::invalid_state(format!(
                "cannot start an array in state {:?} (current type {:?})",
                self.state, self.current_type
            )));
        }
        self.open(ContextKind::Array)
    }

    /// Close the innermost array; the terminator must be next.
    pub fn read_end_array(&mut self) -> BsonResult<()> {
        if self.state == ReaderState::Type {
            self.read_terminator()?;
        }
        if self.state != ReaderState::EndOfArray {
            return Err(BsonError::invalid_state(format!(
                "cannot end an array in state {:?}",
                self.state
            )));
        }
        self.close()
    }

    /// Read the next element type, or `None` at the end of the innermost
    /// document or array.
    pub fn read_element_type(&mut self) -> BsonResult<Option<ElementType>> {
        if self.state != ReaderState::Type {
            return Err(BsonError::invalid_state(format!(
                "cannot read an element type in state {:?}",
                self.state
            )));
        }
        let end = self.stack.last().map(|c| c.end).unwrap_or(self.bytes.len());
        if self.pos + 1 == end {
            self.read_terminator()?;
            return Ok(None);
        }
        let tag = self.take_u8("element type")?;
        if tag == 0 {
            return Err(BsonError::invalid_length(format!(
                "terminator at offset {} before declared end {}",
                self.pos - 1,
                end
            )));
        }
        let ty = ElementType::from_u8(tag).ok_or(BsonError::InvalidElementType(tag))?;
        self.current_type = Some(ty);
        self.state = ReaderState::Name;
        Ok(Some(ty))
    }

    /// Read the current element's name.
    pub fn read_name(&mut self) -> BsonResult<&'a str> {
        if self.state != ReaderState::Name {
            return Err(BsonError::invalid_state(format!(
                "cannot read a name in state {:?}",
                self.state
            )));
        }
        let name = self.take_cstring("field name")?;
        self.state = ReaderState::Value;
        Ok(name)
    }

    /// Read a double.
    pub fn read_double(&mut self) -> BsonResult<f64> {
        self.expect_value(ElementType::Double)?;
        let v = f64::from_le_bytes(self.take_array("double")?);
        self.value_read();
        Ok(v)
    }

    /// Read a string.
    pub fn read_string(&mut self) -> BsonResult<String> {
        self.expect_value(ElementType::String)?;
        let v = self.take_string("string")?;
        self.value_read();
        Ok(v)
    }

    /// Read a binary blob.
    pub fn read_binary(&mut self) -> BsonResult<Binary> {
        self.expect_value(ElementType::Binary)?;
        let len = self.take_len("binary")?;
        let subtype = BinarySubtype::from(self.take_u8("binary subtype")?);
        let bytes = if subtype == BinarySubtype::BinaryOld {
            let inner = self.take_len("old binary")?;
            if inner + 4 != len {
                return Err(BsonError::invalid_length(format!(
                    "old binary inner length {} disagrees with outer length {}",
                    inner, len
                )));
            }
            self.take(inner, "binary")?.to_vec()
        } else {
            self.take(len, "binary")?.to_vec()
        };
        self.value_read();
        Ok(Binary { subtype, bytes })
    }

    /// Read an object id.
    pub fn read_object_id(&mut self) -> BsonResult<ObjectId> {
        self.expect_value(ElementType::ObjectId)?;
        let v = ObjectId::from_bytes(self.take_array("object id")?);
        self.value_read();
        Ok(v)
    }

    /// Read a boolean.
    pub fn read_bool(&mut self) -> BsonResult<bool> {
        self.expect_value(ElementType::Boolean)?;
        let v = match self.take_u8("boolean")? {
            0 => false,
            1 => true,
            other => {
                return Err(BsonError::serialization(format!(
                    "invalid boolean byte {}",
                    other
                )));
            }
        };
        self.value_read();
        Ok(v)
    }

    /// Read a datetime.
    pub fn read_datetime(&mut self) -> BsonResult<DateTime> {
        self.expect_value(ElementType::DateTime)?;
        let v = DateTime::from_millis(i64::from_le_bytes(self.take_array("datetime")?));
        self.value_read();
        Ok(v)
    }

    /// Read a null.
    pub fn read_null(&mut self) -> BsonResult<()> {
        self.expect_value(ElementType::Null)?;
        self.value_read();
        Ok(())
    }

    /// Read a regular expression.
    pub fn read_regex(&mut self) -> BsonResult<Regex> {
        self.expect_value(ElementType::RegularExpression)?;
        let pattern = self.take_cstring("regex pattern")?.to_string();
        let options = self.take_cstring("regex options")?;
        self.value_read();
        Ok(Regex::new(pattern, options))
    }

    /// Read JavaScript code.
    pub fn read_javascript(&mut self) -> BsonResult<String> {
        self.expect_value(ElementType::JavaScriptCode)?;
        let v = self.take_string("javascript")?;
        self.value_read();
        Ok(v)
    }

    /// Read a 32-bit integer.
    pub fn read_int32(&mut self) -> BsonResult<i32> {
        self.expect_value(ElementType::Int32)?;
        let v = i32::from_le_bytes(self.take_array("int32")?);
        self.value_read();
        Ok(v)
    }

    /// Read a replication timestamp.
    pub fn read_timestamp(&mut self) -> BsonResult<Timestamp> {
        self.expect_value(ElementType::Timestamp)?;
        let increment = u32::from_le_bytes(self.take_array("timestamp")?);
        let time = u32::from_le_bytes(self.take_array("timestamp")?);
        self.value_read();
        Ok(Timestamp { time, increment })
    }

    /// Read a 64-bit integer.
    pub fn read_int64(&mut self) -> BsonResult<i64> {
        self.expect_value(ElementType::Int64)?;
        let v = i64::from_le_bytes(self.take_array("int64")?);
        self.value_read();
        Ok(v)
    }

    /// Read a min key.
    pub fn read_min_key(&mut self) -> BsonResult<()> {
        self.expect_value(ElementType::MinKey)?;
        self.value_read();
        Ok(())
    }

    /// Read a max key.
    pub fn read_max_key(&mut self) -> BsonResult<()> {
        self.expect_value(ElementType::MaxKey)?;
        self.value_read();
        Ok(())
    }

    /// Read a whole document at the current position.
    ///
    /// When a field name repeats, the first occurrence is kept.
    pub fn read_document(&mut self) -> BsonResult<Document> {
        self.read_start_document()?;
        let mut document = Document::new();
        while self.read_element_type()?.is_some() {
            let name = self.read_name()?.to_string();
            let value = self.read_value()?;
            document.insert_if_absent(name, value);
        }
        self.read_end_document()?;
        Ok(document)
    }

    /// Read the current value, recursing into containers.
    pub fn read_value(&mut self) -> BsonResult<Bson> {
        let ty = match (self.state, self.current_type) {
            (ReaderState::Value, Some(ty)) => ty,
            (ReaderState::Initial, _) => return self.read_document().map(Bson::Document),
            (state, _) => {
                return Err(BsonError::invalid_state(format!(
                    "cannot read a value in state {:?}",
                    state
                )));
            }
        };
        Ok(match ty {
            ElementType::Double => Bson::Double(self.read_double()?),
            ElementType::String => Bson::String(self.read_string()?),
            ElementType::EmbeddedDocument => Bson::Document(self.read_document()?),
            ElementType::Array => {
                self.read_start_array()?;
                let mut items = Vec::new();
                while self.read_element_type()?.is_some() {
                    self.read_name()?;
                    items.push(self.read_value()?);
                }
                self.read_end_array()?;
                Bson::Array(items)
            }
            ElementType::Binary => Bson::Binary(self.read_binary()?),
            ElementType::ObjectId => Bson::ObjectId(self.read_object_id()?),
            ElementType::Boolean => Bson::Boolean(self.read_bool()?),
            ElementType::DateTime => Bson::DateTime(self.read_datetime()?),
            ElementType::Null => {
                self.read_null()?;
                Bson::Null
            }
            ElementType::RegularExpression => Bson::RegularExpression(self.read_regex()?),
            ElementType::JavaScriptCode => Bson::JavaScriptCode(self.read_javascript()?),
            ElementType::Int32 => Bson::Int32(self.read_int32()?),
            ElementType::Timestamp => Bson::Timestamp(self.read_timestamp()?),
            ElementType::Int64 => Bson::Int64(self.read_int64()?),
            ElementType::MaxKey => {
                self.read_max_key()?;
                Bson::MaxKey
            }
            ElementType::MinKey => {
                self.read_min_key()?;
                Bson::MinKey
            }
        })
    }

    fn open(&mut self, kind: ContextKind) -> BsonResult<()> {
        let start = self.pos;
        let len = self.take_len("document length")?;
        if len < 5 {
            return Err(BsonError::invalid_length(format!(
                "document length {} is below the 5 byte minimum",
                len
            )));
        }
        if len > self.max_document_size {
            return Err(BsonError::invalid_length(format!(
                "document length {} exceeds the {} byte limit",
                len, self.max_document_size
            )));
        }
        let end = start + len;
        let limit = self.stack.last().map(|c| c.end - 1).unwrap_or(self.bytes.len());
        if end > limit {
            return Err(if end > self.bytes.len() {
                BsonError::UnexpectedEof("document")
            } else {
                BsonError::invalid_length(format!(
                    "embedded document ends at {} past its parent's end {}",
                    end, limit
                ))
            });
        }
        self.stack.push(Context { kind, end });
        self.state = ReaderState::Type;
        self.current_type = None;
        Ok(())
    }

    fn read_terminator(&mut self) -> BsonResult<()> {
        let ctx = self
            .stack
            .last()
            .ok_or_else(|| BsonError::invalid_state("no open context"))?;
        let (end, kind) = (ctx.end, ctx.kind);
        if self.pos + 1 != end {
            return Err(BsonError::invalid_length(format!(
                "expected terminator at offset {}, reader is at {}",
                end - 1,
                self.pos
            )));
        }
        if self.take_u8("terminator")? != 0 {
            return Err(BsonError::invalid_length("document is not zero terminated"));
        }
        self.state = match kind {
            ContextKind::Document => ReaderState::EndOfDocument,
            ContextKind::Array => ReaderState::EndOfArray,
        };
        Ok(())
    }

    fn close(&mut self) -> BsonResult<()> {
        self.stack.pop();
        self.current_type = None;
        self.state = if self.stack.is_empty() {
            ReaderState::Done
        } else {
            ReaderState::Type
        };
        Ok(())
    }

    fn expect_value(&self, ty: ElementType) -> BsonResult<()> {
        if self.state != ReaderState::Value || self.current_type != Some(ty) {
            return Err(BsonError::invalid_state(format!(
                "cannot read {:?} in state {:?} (current type {:?})",
                ty, self.state, self.current_type
            )));
        }
        Ok(())
    }

    fn value_read(&mut self) {
        self.state = ReaderState::Type;
    }

    fn take(&mut self, n: usize, what: &'static str) -> BsonResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BsonError::UnexpectedEof(what))?;
        let slice = self.bytes.get(self.pos..end).ok_or(BsonError::UnexpectedEof(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, what: &'static str) -> BsonResult<[u8; N]> {
        let slice = self.take(N, what)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_u8(&mut self, what: &'static str) -> BsonResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn take_len(&mut self, what: &'static str) -> BsonResult<usize> {
        let raw = i32::from_le_bytes(self.take_array(what)?);
        usize::try_from(raw)
            .map_err(|_| BsonError::invalid_length(format!("negative {} {}", what, raw)))
    }

    fn take_cstring(&mut self, what: &'static str) -> BsonResult<&'a str> {
        let rest = self.bytes.get(self.pos..).ok_or(BsonError::UnexpectedEof(what))?;
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(BsonError::UnexpectedEof(what))?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| BsonError::InvalidUtf8(what))?;
        self.pos += nul + 1;
        Ok(s)
    }

    fn take_string(&mut self, what: &'static str) -> BsonResult<String> {
        let len = self.take_len(what)?;
        if len == 0 {
            return Err(BsonError::invalid_length(format!("{} length must include the terminator", what)));
        }
        let raw = self.take(len, what)?;
        if raw[len - 1] != 0 {
            return Err(BsonError::invalid_length(format!("{} is not zero terminated", what)));
        }
        std::str::from_utf8(&raw[..len - 1])
            .map(str::to_string)
            .map_err(|_| BsonError::InvalidUtf8(what))
    }
}
