//! Typed value to [`Bson`] tree.

use serde::ser::{self, Serialize};

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::value::{Binary, Bson};

use super::{EXTENDED, from_extended_document};

/// Serializes any `Serialize` value into a [`Bson`] tree.
///
/// Integer widths follow the source type: `i8`, `i16`, `i32`, `u8` and `u16`
/// become int32; `i64` and `u32` become int64; `u64` becomes int64 when it
/// fits and is an error otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serializer;

impl Serializer {
    /// Create a serializer.
    pub fn new() -> Self {
        Self
    }
}

impl ser::Serializer for Serializer {
    type Ok = Bson;
    type Error = BsonError;

    type SerializeSeq = ArraySerializer;
    type SerializeTuple = ArraySerializer;
    type SerializeTupleStruct = ArraySerializer;
    type SerializeTupleVariant = VariantSerializer<ArraySerializer>;
    type SerializeMap = DocumentSerializer;
    type SerializeStruct = DocumentSerializer;
    type SerializeStructVariant = VariantSerializer<DocumentSerializer>;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, v: bool) -> BsonResult<Bson> {
        Ok(Bson::Boolean(v))
    }

    fn serialize_i8(self, v: i8) -> BsonResult<Bson> {
        Ok(Bson::Int32(v.into()))
    }

    fn serialize_i16(self, v: i16) -> BsonResult<Bson> {
        Ok(Bson::Int32(v.into()))
    }

    fn serialize_i32(self, v: i32) -> BsonResult<Bson> {
        Ok(Bson::Int32(v))
    }

    fn serialize_i64(self, v: i64) -> BsonResult<Bson> {
        Ok(Bson::Int64(v))
    }

    fn serialize_u8(self, v: u8) -> BsonResult<Bson> {
        Ok(Bson::Int32(v.into()))
    }

    fn serialize_u16(self, v: u16) -> BsonResult<Bson> {
        Ok(Bson::Int32(v.into()))
    }

    fn serialize_u32(self, v: u32) -> BsonResult<Bson> {
        Ok(Bson::Int64(v.into()))
    }

    fn serialize_u64(self, v: u64) -> BsonResult<Bson> {
        i64::try_from(v)
            .map(Bson::Int64)
            .map_err(|_| BsonError::serialization(format!("u64 {} does not fit in int64", v)))
    }

    fn serialize_f32(self, v: f32) -> BsonResult<Bson> {
        Ok(Bson::Double(v.into()))
    }

    fn serialize_f64(self, v: f64) -> BsonResult<Bson> {
        Ok(Bson::Double(v))
    }

    fn serialize_char(self, v: char) -> BsonResult<Bson> {
        Ok(Bson::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> BsonResult<Bson> {
        Ok(Bson::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> BsonResult<Bson> {
        Ok(Bson::Binary(Binary::generic(v)))
    }

    fn serialize_none(self) -> BsonResult<Bson> {
        Ok(Bson::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> BsonResult<Bson> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> BsonResult<Bson> {
        Ok(Bson::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> BsonResult<Bson> {
        Ok(Bson::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> BsonResult<Bson> {
        Ok(Bson::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        value: &T,
    ) -> BsonResult<Bson> {
        let inner = value.serialize(self)?;
        if name == EXTENDED {
            if let Bson::Document(doc) = inner {
                return Ok(from_extended_document(doc));
            }
        }
        Ok(inner)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> BsonResult<Bson> {
        let mut doc = Document::new();
        doc.insert(variant, value.serialize(self)?);
        Ok(Bson::Document(doc))
    }

    fn serialize_seq(self, len: Option<usize>) -> BsonResult<ArraySerializer> {
        Ok(ArraySerializer {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> BsonResult<ArraySerializer> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> BsonResult<ArraySerializer> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> BsonResult<VariantSerializer<ArraySerializer>> {
        Ok(VariantSerializer {
            variant,
            inner: self.serialize_seq(Some(len))?,
        })
    }

    fn serialize_map(self, len: Option<usize>) -> BsonResult<DocumentSerializer> {
        Ok(DocumentSerializer {
            doc: Document::with_capacity(len.unwrap_or(0)),
            pending_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> BsonResult<DocumentSerializer> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> BsonResult<VariantSerializer<DocumentSerializer>> {
        Ok(VariantSerializer {
            variant,
            inner: self.serialize_map(Some(len))?,
        })
    }
}

#[doc(hidden)]
pub struct ArraySerializer {
    items: Vec<Bson>,
}

impl ser::SerializeSeq for ArraySerializer {
    type Ok = Bson;
    type Error = BsonError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> BsonResult<()> {
        self.items.push(value.serialize(Serializer)?);
        Ok(())
    }

    fn end(self) -> BsonResult<Bson> {
        Ok(Bson::Array(self.items))
    }
}

impl ser::SerializeTuple for ArraySerializer {
    type Ok = Bson;
    type Error = BsonError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> BsonResult<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> BsonResult<Bson> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for ArraySerializer {
    type Ok = Bson;
    type Error = BsonError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> BsonResult<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> BsonResult<Bson> {
        ser::SerializeSeq::end(self)
    }
}

#[doc(hidden)]
pub struct DocumentSerializer {
    doc: Document,
    pending_key: Option<String>,
}

impl ser::SerializeMap for DocumentSerializer {
    type Ok = Bson;
    type Error = BsonError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> BsonResult<()> {
        let key = match key.serialize(Serializer)? {
            Bson::String(s) => s,
            Bson::Int32(n) => n.to_string(),
            Bson::Int64(n) => n.to_string(),
            Bson::Boolean(b) => b.to_string(),
            other => {
                return Err(BsonError::serialization(format!(
                    "map keys must be strings, got {:?}",
                    other.element_type()
                )));
            }
        };
        self.pending_key = Some(key);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> BsonResult<()> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| BsonError::serialization("map value serialized before its key"))?;
        self.doc.insert(key, value.serialize(Serializer)?);
        Ok(())
    }

    fn end(self) -> BsonResult<Bson> {
        Ok(Bson::Document(self.doc))
    }
}

impl ser::SerializeStruct for DocumentSerializer {
    type Ok = Bson;
    type Error = BsonError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> BsonResult<()> {
        self.doc.insert(key, value.serialize(Serializer)?);
        Ok(())
    }

    fn end(self) -> BsonResult<Bson> {
        Ok(Bson::Document(self.doc))
    }
}

/// Wraps a tuple or struct variant as `{ variant: payload }`.
#[doc(hidden)]
pub struct VariantSerializer<S> {
    variant: &'static str,
    inner: S,
}

impl<S> VariantSerializer<S> {
    fn wrap(variant: &'static str, payload: Bson) -> Bson {
        let mut doc = Document::new();
        doc.insert(variant, payload);
        Bson::Document(doc)
    }
}

impl ser::SerializeTupleVariant for VariantSerializer<ArraySerializer> {
    type Ok = Bson;
    type Error = BsonError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> BsonResult<()> {
        ser::SerializeSeq::serialize_element(&mut self.inner, value)
    }

    fn end(self) -> BsonResult<Bson> {
        let payload = ser::SerializeSeq::end(self.inner)?;
        Ok(Self::wrap(self.variant, payload))
    }
}

impl ser::SerializeStructVariant for VariantSerializer<DocumentSerializer> {
    type Ok = Bson;
    type Error = BsonError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> BsonResult<()> {
        ser::SerializeStruct::serialize_field(&mut self.inner, key, value)
    }

    fn end(self) -> BsonResult<Bson> {
        let payload = ser::SerializeStruct::end(self.inner)?;
        Ok(Self::wrap(self.variant, payload))
    }
}
