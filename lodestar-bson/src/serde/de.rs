//! [`Bson`] tree to typed value.

use serde::de::{self, DeserializeSeed, IntoDeserializer, Visitor};
use serde::forward_to_deserialize_any;

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::value::{BinarySubtype, Bson};

use super::{EXTENDED, to_extended_document};

/// Deserializes a typed value out of an owned [`Bson`] tree.
///
/// Width checks are left to the target type: an int32 is accepted wherever an
/// `i64` is expected, an int64 is accepted as `i32` only when it fits.
#[derive(Debug)]
pub struct Deserializer {
    value: Bson,
}

impl Deserializer {
    /// Wrap a value.
    pub fn new(value: Bson) -> Self {
        Self { value }
    }
}

impl<'de> de::Deserializer<'de> for Deserializer {
    type Error = BsonError;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> BsonResult<V::Value> {
        match self.value {
            Bson::Double(v) => visitor.visit_f64(v),
            Bson::String(s) => visitor.visit_string(s),
            Bson::Document(doc) => visit_document(doc, visitor),
            Bson::Array(items) => visitor.visit_seq(ArrayAccess {
                iter: items.into_iter(),
            }),
            Bson::Boolean(b) => visitor.visit_bool(b),
            Bson::Null => visitor.visit_unit(),
            Bson::Int32(v) => visitor.visit_i32(v),
            Bson::Int64(v) => visitor.visit_i64(v),
            Bson::Binary(b) if b.subtype == BinarySubtype::Generic => {
                visitor.visit_byte_buf(b.bytes)
            }
            other => match to_extended_document(&other) {
                Some(wrapper) => {
                    let mut marked = Document::new();
                    marked.insert(EXTENDED, wrapper);
                    visit_document(marked, visitor)
                }
                None => Err(BsonError::serialization(format!(
                    "cannot deserialize {:?}",
                    other.element_type()
                ))),
            },
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> BsonResult<V::Value> {
        match self.value {
            Bson::Null => visitor.visit_none(),
            value => visitor.visit_some(Deserializer::new(value)),
        }
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> BsonResult<V::Value> {
        match self.value {
            Bson::Binary(b) => visitor.visit_byte_buf(b.bytes),
            value => Deserializer::new(value).deserialize_any(visitor),
        }
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> BsonResult<V::Value> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> BsonResult<V::Value> {
        if name == EXTENDED {
            self.deserialize_any(visitor)
        } else {
            visitor.visit_newtype_struct(self)
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> BsonResult<V::Value> {
        match self.value {
            Bson::String(variant) => visitor.visit_enum(variant.into_deserializer()),
            Bson::Document(doc) if doc.len() == 1 => {
                let mut iter = doc.into_iter();
                match iter.next() {
                    Some((variant, value)) => visitor.visit_enum(EnumAccess { variant, value }),
                    None => Err(BsonError::serialization(format!("empty enum {}", name))),
                }
            }
            other => Err(BsonError::serialization(format!(
                "expected a string or single-field document for enum {}, got {:?}",
                name,
                other.element_type()
            ))),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> BsonResult<V::Value> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        unit unit_struct seq tuple tuple_struct map struct identifier
    }
}

fn visit_document<'de, V: Visitor<'de>>(doc: Document, visitor: V) -> BsonResult<V::Value> {
    let len = doc.len();
    let mut access = DocumentAccess {
        iter: doc.into_iter(),
        pending: None,
    };
    let value = visitor.visit_map(&mut access)?;
    if access.iter.len() != 0 {
        return Err(de::Error::invalid_length(len, &"fewer fields"));
    }
    Ok(value)
}

struct ArrayAccess {
    iter: std::vec::IntoIter<Bson>,
}

impl<'de> de::SeqAccess<'de> for ArrayAccess {
    type Error = BsonError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> BsonResult<Option<T::Value>> {
        self.iter
            .next()
            .map(|value| seed.deserialize(Deserializer::new(value)))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct DocumentAccess {
    iter: indexmap::map::IntoIter<String, Bson>,
    pending: Option<Bson>,
}

impl<'de> de::MapAccess<'de> for DocumentAccess {
    type Error = BsonError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> BsonResult<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                seed.deserialize(Deserializer::new(Bson::String(key))).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> BsonResult<V::Value> {
        let value = self
            .pending
            .take()
            .ok_or_else(|| BsonError::serialization("map value requested before its key"))?;
        seed.deserialize(Deserializer::new(value))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct EnumAccess {
    variant: String,
    value: Bson,
}

impl<'de> de::EnumAccess<'de> for EnumAccess {
    type Error = BsonError;
    type Variant = VariantAccess;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> BsonResult<(V::Value, VariantAccess)> {
        let variant = seed.deserialize(Deserializer::new(Bson::String(self.variant)))?;
        Ok((variant, VariantAccess { value: self.value }))
    }
}

struct VariantAccess {
    value: Bson,
}

impl<'de> de::VariantAccess<'de> for VariantAccess {
    type Error = BsonError;

    fn unit_variant(self) -> BsonResult<()> {
        match self.value {
            Bson::Null => Ok(()),
            other => Err(BsonError::serialization(format!(
                "expected no payload for unit variant, got {:?}",
                other.element_type()
            ))),
        }
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> BsonResult<T::Value> {
        seed.deserialize(Deserializer::new(self.value))
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> BsonResult<V::Value> {
        de::Deserializer::deserialize_seq(Deserializer::new(self.value), visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> BsonResult<V::Value> {
        de::Deserializer::deserialize_map(Deserializer::new(self.value), visitor)
    }
}
