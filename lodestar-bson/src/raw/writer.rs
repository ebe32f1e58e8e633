//! Stateful binary writer.

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::oid::ObjectId;
use crate::value::{Binary, BinarySubtype, Bson, DateTime, ElementType, Regex, Timestamp};

use super::{ContextKind, DEFAULT_MAX_DOCUMENT_SIZE};

/// What the writer expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Nothing written yet; only a top-level document may start.
    Initial,
    /// Inside a document, a field name (or the end of the document) is expected.
    Name,
    /// A value is expected: after a name, or anywhere inside an array.
    Value,
    /// The top-level document has been closed.
    Done,
}

#[derive(Debug)]
struct Context {
    kind: ContextKind,
    start: usize,
    index: usize,
}

/// Writes one document in the binary format, one element at a time.
///
/// The writer keeps an explicit stack of open documents and arrays. Calls
/// that do not fit the current state (a value where a name is expected, an
/// `end_array` inside a document, …) fail with [`BsonError::InvalidState`].
#[derive(Debug)]
pub struct BsonWriter {
    buffer: Vec<u8>,
    state: WriterState,
    stack: Vec<Context>,
    pending_name: Option<String>,
    max_document_size: usize,
}

impl BsonWriter {
    /// Create a writer with the default document size limit.
    pub fn new() -> Self {
        Self::with_max_document_size(DEFAULT_MAX_DOCUMENT_SIZE)
    }

    /// Create a writer with a custom document size limit.
    pub fn with_max_document_size(max_document_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            state: WriterState::Initial,
            stack: Vec::new(),
            pending_name: None,
            max_document_size,
        }
    }

    /// Current state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Number of open documents and arrays.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Take the encoded bytes. Fails unless the top-level document is closed.
    pub fn into_bytes(self) -> BsonResult<Vec<u8>> {
        if self.state != WriterState::Done {
            return Err(BsonError::invalid_state(format!(
                "cannot take bytes in state {:?} with {} open context(s)",
                self.state,
                self.stack.len()
            )));
        }
        Ok(self.buffer)
    }

    /// Write a field name. Only valid inside a document.
    pub fn write_name(&mut self, name: &str) -> BsonResult<()> {
        if self.state != WriterState::Name {
            return Err(BsonError::invalid_state(format!(
                "write_name('{}') called in state {:?}",
                name, self.state
            )));
        }
        if name.as_bytes().contains(&0) {
            return Err(BsonError::serialization(format!(
                "field name '{}' contains a NUL byte",
                name.escape_default()
            )));
        }
        self.pending_name = Some(name.to_string());
        self.state = WriterState::Value;
        Ok(())
    }

    /// Open a document: the top-level one, or an embedded one after a name.
    pub fn write_start_document(&mut self) -> BsonResult<()> {
        match self.state {
            WriterState::Initial => {}
            WriterState::Value => self.write_element_header(ElementType::EmbeddedDocument)?,
            state => {
                return Err(BsonError::invalid_state(format!(
                    "cannot start a document in state {:?}",
                    state
                )));
            }
        }
        self.open(ContextKind::Document);
        self.state = WriterState::Name;
        Ok(())
    }

    /// Close the innermost document.
    pub fn write_end_document(&mut self) -> BsonResult<()> {
        if self.state != WriterState::Name {
            return Err(BsonError::invalid_state(format!(
                "cannot end a document in state {:?}",
                self.state
            )));
        }
        self.close(ContextKind::Document)
    }

    /// Open an array after a name (or as an array element).
    pub fn write_start_array(&mut self) -> BsonResult<()> {
        self.write_element_header(ElementType::Array)?;
        self.open(ContextKind::Array);
        self.state = WriterState::Value;
        Ok(())
    }

    /// Close the innermost array.
    pub fn write_end_array(&mut self) -> BsonResult<()> {
        if self.state != WriterState::Value || self.current_kind() != Some(ContextKind::Array) {
            return Err(BsonError::invalid_state(format!(
                "cannot end an array in state {:?}",
                self.state
            )));
        }
        self.close(ContextKind::Array)
    }

    /// Write a double.
    pub fn write_double(&mut self, value: f64) -> BsonResult<()> {
        self.write_element_header(ElementType::Double)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self.value_written();
        Ok(())
    }

    /// Write a string.
    pub fn write_string(&mut self, value: &str) -> BsonResult<()> {
        self.write_element_header(ElementType::String)?;
        self.put_string(value)?;
        self.value_written();
        Ok(())
    }

    /// Write a binary blob.
    pub fn write_binary(&mut self, value: &Binary) -> BsonResult<()> {
        self.write_element_header(ElementType::Binary)?;
        let subtype: u8 = value.subtype.into();
        if value.subtype == BinarySubtype::BinaryOld {
            let inner = len_i32(value.bytes.len())?;
            self.buffer.extend_from_slice(&(inner + 4).to_le_bytes());
            self.buffer.push(subtype);
            self.buffer.extend_from_slice(&inner.to_le_bytes());
        } else {
            self.buffer
                .extend_from_slice(&len_i32(value.bytes.len())?.to_le_bytes());
            self.buffer.push(subtype);
        }
        self.buffer.extend_from_slice(&value.bytes);
        self.value_written();
        Ok(())
    }

    /// Write an object id.
    pub fn write_object_id(&mut self, value: ObjectId) -> BsonResult<()> {
        self.write_element_header(ElementType::ObjectId)?;
        self.buffer.extend_from_slice(&value.bytes());
        self.value_written();
        Ok(())
    }

    /// Write a boolean.
    pub fn write_bool(&mut self, value: bool) -> BsonResult<()> {
        self.write_element_header(ElementType::Boolean)?;
        self.buffer.push(u8::from(value));
        self.value_written();
        Ok(())
    }

    /// Write a datetime.
    pub fn write_datetime(&mut self, value: DateTime) -> BsonResult<()> {
        self.write_element_header(ElementType::DateTime)?;
        self.buffer
            .extend_from_slice(&value.timestamp_millis().to_le_bytes());
        self.value_written();
        Ok(())
    }

    /// Write a null.
    pub fn write_null(&mut self) -> BsonResult<()> {
        self.write_element_header(ElementType::Null)?;
        self.value_written();
        Ok(())
    }

    /// Write a regular expression.
    pub fn write_regex(&mut self, value: &Regex) -> BsonResult<()> {
        self.write_element_header(ElementType::RegularExpression)?;
        self.put_cstring(&value.pattern)?;
        self.put_cstring(&value.options)?;
        self.value_written();
        Ok(())
    }

    /// Write JavaScript code.
    pub fn write_javascript(&mut self, code: &str) -> BsonResult<()> {
        self.write_element_header(ElementType::JavaScriptCode)?;
        self.put_string(code)?;
        self.value_written();
        Ok(())
    }

    /// Write a 32-bit integer.
    pub fn write_int32(&mut self, value: i32) -> BsonResult<()> {
        self.write_element_header(ElementType::Int32)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self.value_written();
        Ok(())
    }

    /// Write a replication timestamp.
    pub fn write_timestamp(&mut self, value: Timestamp) -> BsonResult<()> {
        self.write_element_header(ElementType::Timestamp)?;
        self.buffer.extend_from_slice(&value.increment.to_le_bytes());
        self.buffer.extend_from_slice(&value.time.to_le_bytes());
        self.value_written();
        Ok(())
    }

    /// Write a 64-bit integer.
    pub fn write_int64(&mut self, value: i64) -> BsonResult<()> {
        self.write_element_header(ElementType::Int64)?;
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self.value_written();
        Ok(())
    }

    /// Write a min key.
    pub fn write_min_key(&mut self) -> BsonResult<()> {
        self.write_element_header(ElementType::MinKey)?;
        self.value_written();
        Ok(())
    }

    /// Write a max key.
    pub fn write_max_key(&mut self) -> BsonResult<()> {
        self.write_element_header(ElementType::MaxKey)?;
        self.value_written();
        Ok(())
    }

    /// Write a whole document at the current position.
    pub fn write_document(&mut self, document: &Document) -> BsonResult<()> {
        self.write_start_document()?;
        for (name, value) in document {
            self.write_name(name)?;
            self.write_value(value)?;
        }
        self.write_end_document()
    }

    /// Write any value at the current position, recursing into containers.
    pub fn write_value(&mut self, value: &Bson) -> BsonResult<()> {
        match value {
            Bson::Double(v) => self.write_double(*v),
            Bson::String(v) => self.write_string(v),
            Bson::Document(v) => self.write_document(v),
            Bson::Array(items) => {
                self.write_start_array()?;
                for item in items {
                    self.write_value(item)?;
                }
                self.write_end_array()
            }
            Bson::Binary(v) => self.write_binary(v),
            Bson::ObjectId(v) => self.write_object_id(*v),
            Bson::Boolean(v) => self.write_bool(*v),
            Bson::DateTime(v) => self.write_datetime(*v),
            Bson::Null => self.write_null(),
            Bson::RegularExpression(v) => self.write_regex(v),
            Bson::JavaScriptCode(v) => self.write_javascript(v),
            Bson::Int32(v) => self.write_int32(*v),
            Bson::Timestamp(v) => self.write_timestamp(*v),
            Bson::Int64(v) => self.write_int64(*v),
            Bson::MaxKey => self.write_max_key(),
            Bson::MinKey => self.write_min_key(),
        }
    }

    fn current_kind(&self) -> Option<ContextKind> {
        self.stack.last().map(|c| c.kind)
    }

    /// Emit the type tag and element name for the next value.
    fn write_element_header(&mut self, ty: ElementType) -> BsonResult<()> {
        if self.state != WriterState::Value {
            return Err(BsonError::invalid_state(format!(
                "cannot write a {:?} value in state {:?}",
                ty, self.state
            )));
        }
        self.buffer.push(ty as u8);
        let array_index = match self.stack.last_mut() {
            Some(ctx) if ctx.kind == ContextKind::Array => {
                ctx.index += 1;
                Some(ctx.index - 1)
            }
            _ => None,
        };
        match array_index {
            Some(index) => self.put_cstring(&index.to_string()),
            None => {
                let name = self.pending_name.take().ok_or_else(|| {
                    BsonError::invalid_state("value written without a field name")
                })?;
                self.put_cstring(&name)
            }
        }
    }

    fn value_written(&mut self) {
        self.state = match self.current_kind() {
            Some(ContextKind::Array) => WriterState::Value,
            _ => WriterState::Name,
        };
    }

    fn open(&mut self, kind: ContextKind) {
        let start = self.buffer.len();
        self.buffer.extend_from_slice(&[0u8; 4]);
        self.stack.push(Context {
            kind,
            start,
            index: 0,
        });
    }

    fn close(&mut self, kind: ContextKind) -> BsonResult<()> {
        match self.stack.last() {
            Some(ctx) if ctx.kind == kind => {}
            other => {
                return Err(BsonError::invalid_state(format!(
                    "cannot close {:?}: innermost context is {:?}",
                    kind,
                    other.map(|c| c.kind)
                )));
            }
        }
        let ctx = self.stack.pop().ok_or_else(|| BsonError::invalid_state("no open context"))?;
        self.buffer.push(0);
        let size = self.buffer.len() - ctx.start;
        if size > self.max_document_size {
            return Err(BsonError::invalid_length(format!(
                "document of {} bytes exceeds the {} byte limit",
                size, self.max_document_size
            )));
        }
        let size = len_i32(size)?;
        self.buffer[ctx.start..ctx.start + 4].copy_from_slice(&size.to_le_bytes());

        self.state = match self.current_kind() {
            None => WriterState::Done,
            Some(ContextKind::Document) => WriterState::Name,
            Some(ContextKind::Array) => WriterState::Value,
        };
        Ok(())
    }

    fn put_cstring(&mut self, s: &str) -> BsonResult<()> {
        if s.as_bytes().contains(&0) {
            return Err(BsonError::serialization(format!(
                "'{}' contains a NUL byte",
                s.escape_default()
            )));
        }
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
        Ok(())
    }

    fn put_string(&mut self, s: &str) -> BsonResult<()> {
        let len = len_i32(s.len() + 1)?;
        self.buffer.extend_from_slice(&len.to_le_bytes());
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
        Ok(())
    }
}

impl Default for BsonWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn len_i32(len: usize) -> BsonResult<i32> {
    i32::try_from(len).map_err(|_| BsonError::invalid_length(format!("{} does not fit in int32", len)))
}
