//! Structural mapping between `serde` types and the value tree.
//!
//! Extended values (object ids, datetimes, regexes, ...) travel through the
//! serde data model in their strict-dialect form, e.g. `{ "$oid": "..." }`,
//! wrapped in a private newtype marker. The tree serializer recognizes the
//! marker and restores the native value, so `ObjectId` fields round-trip as
//! object ids while other formats such as JSON see the plain wrapper map.
//!
//! Going the other way, the tree deserializer hands extended values to
//! visitors as a single-entry map keyed by the same marker. Ordinary
//! documents that merely look like a wrapper, e.g. `{ "$minKey": 1 }` in a
//! server reply, stay documents. Only [`ObjectId`] and [`DateTime`] accept
//! a bare wrapper map, so they still read back from JSON.

mod de;
mod ser;

use std::fmt;

use serde::de::{DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize};

pub use de::Deserializer;
pub use ser::Serializer;

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::oid::ObjectId;
use crate::value::{Binary, BinarySubtype, Bson, DateTime, Regex, Timestamp};

pub(crate) const EXTENDED: &str = "$__lodestar_extended";

/// Serialize a value into a [`Bson`] tree.
pub fn to_bson<T: Serialize + ?Sized>(value: &T) -> BsonResult<Bson> {
    value.serialize(Serializer::new())
}

/// Serialize a value that must map to a document (a struct or a map).
pub fn to_document<T: Serialize + ?Sized>(value: &T) -> BsonResult<Document> {
    match to_bson(value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(BsonError::serialization(format!(
            "expected a document, value serialized to {:?}",
            other.element_type()
        ))),
    }
}

/// Deserialize a typed value out of a [`Bson`] tree.
pub fn from_bson<T: DeserializeOwned>(value: Bson) -> BsonResult<T> {
    T::deserialize(Deserializer::new(value))
}

/// Deserialize a typed value out of a document.
pub fn from_document<T: DeserializeOwned>(document: Document) -> BsonResult<T> {
    from_bson(Bson::Document(document))
}

/// Strict-dialect wrapper document for values the serde data model lacks.
pub(crate) fn to_extended_document(value: &Bson) -> Option<Document> {
    let mut doc = Document::new();
    match value {
        Bson::ObjectId(oid) => {
            doc.insert("$oid", oid.to_hex());
        }
        Bson::DateTime(dt) => {
            doc.insert("$date", dt.timestamp_millis());
        }
        Bson::Binary(b) => {
            let subtype: u8 = b.subtype.into();
            doc.insert("$binary", hex::encode(&b.bytes));
            doc.insert("$type", format!("{:02x}", subtype));
        }
        Bson::RegularExpression(re) => {
            doc.insert("$regex", re.pattern.as_str());
            doc.insert("$options", re.options.as_str());
        }
        Bson::JavaScriptCode(code) => {
            doc.insert("$code", code.as_str());
        }
        Bson::Timestamp(ts) => {
            let mut inner = Document::new();
            inner.insert("t", i64::from(ts.time));
            inner.insert("i", i64::from(ts.increment));
            doc.insert("$timestamp", inner);
        }
        Bson::MinKey => {
            doc.insert("$minKey", 1);
        }
        Bson::MaxKey => {
            doc.insert("$maxKey", 1);
        }
        _ => return None,
    }
    Some(doc)
}

/// Inverse of [`to_extended_document`]. Documents that are not a well-formed
/// wrapper are returned unchanged.
pub(crate) fn from_extended_document(doc: Document) -> Bson {
    let parsed = match doc.first_key() {
        Some("$oid") if doc.len() == 1 => doc
            .get_str("$oid")
            .and_then(|s| ObjectId::parse_str(s).ok())
            .map(Bson::ObjectId),
        Some("$date") if doc.len() == 1 => doc
            .get("$date")
            .and_then(integer)
            .map(|ms| Bson::DateTime(DateTime::from_millis(ms))),
        Some("$binary") if doc.len() == 2 => {
            let bytes = doc.get_str("$binary").and_then(|s| hex::decode(s).ok());
            let subtype = doc
                .get_str("$type")
                .and_then(|s| u8::from_str_radix(s, 16).ok());
            bytes.zip(subtype).map(|(bytes, subtype)| {
                Bson::Binary(Binary {
                    subtype: BinarySubtype::from(subtype),
                    bytes,
                })
            })
        }
        Some("$regex") if doc.len() == 2 => doc
            .get_str("$regex")
            .zip(doc.get_str("$options"))
            .map(|(p, o)| Bson::RegularExpression(Regex::new(p, o))),
        Some("$code") if doc.len() == 1 => doc
            .get_str("$code")
            .map(|c| Bson::JavaScriptCode(c.to_string())),
        Some("$timestamp") if doc.len() == 1 => doc.get_document("$timestamp").and_then(|ts| {
            let time = ts.get("t").and_then(integer)?;
            let increment = ts.get("i").and_then(integer)?;
            Some(Bson::Timestamp(Timestamp {
                time: u32::try_from(time).ok()?,
                increment: u32::try_from(increment).ok()?,
            }))
        }),
        Some("$minKey") if doc.len() == 1 => Some(Bson::MinKey),
        Some("$maxKey") if doc.len() == 1 => Some(Bson::MaxKey),
        _ => None,
    };
    parsed.unwrap_or(Bson::Document(doc))
}

impl Bson {
    /// Restore a strict-dialect wrapper document to its native value, for
    /// targets that are known to expect one.
    fn into_extended(self) -> Bson {
        match self {
            Bson::Document(doc) => from_extended_document(doc),
            other => other,
        }
    }
}

fn integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some((*v).into()),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

struct Extended<'a>(&'a Document);

impl Serialize for Extended<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(EXTENDED, self.0)
    }
}

impl Serialize for Bson {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Bson::Double(v) => serializer.serialize_f64(*v),
            Bson::String(s) => serializer.serialize_str(s),
            Bson::Document(doc) => doc.serialize(serializer),
            Bson::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Bson::Boolean(b) => serializer.serialize_bool(*b),
            Bson::Null => serializer.serialize_unit(),
            Bson::Int32(v) => serializer.serialize_i32(*v),
            Bson::Int64(v) => serializer.serialize_i64(*v),
            Bson::Binary(b) if b.subtype == BinarySubtype::Generic => {
                serializer.serialize_bytes(&b.bytes)
            }
            other => match to_extended_document(other) {
                Some(doc) => Extended(&doc).serialize(serializer),
                None => serializer.serialize_unit(),
            },
        }
    }
}

impl Serialize for Document {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct BsonVisitor;

impl<'de> Visitor<'de> for BsonVisitor {
    type Value = Bson;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a document value")
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Bson, E> {
        Ok(Bson::Boolean(v))
    }

    fn visit_i8<E: serde::de::Error>(self, v: i8) -> Result<Bson, E> {
        Ok(Bson::Int32(v.into()))
    }

    fn visit_i16<E: serde::de::Error>(self, v: i16) -> Result<Bson, E> {
        Ok(Bson::Int32(v.into()))
    }

    fn visit_i32<E: serde::de::Error>(self, v: i32) -> Result<Bson, E> {
        Ok(Bson::Int32(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Bson, E> {
        Ok(Bson::Int64(v))
    }

    fn visit_u8<E: serde::de::Error>(self, v: u8) -> Result<Bson, E> {
        Ok(Bson::Int32(v.into()))
    }

    fn visit_u16<E: serde::de::Error>(self, v: u16) -> Result<Bson, E> {
        Ok(Bson::Int32(v.into()))
    }

    fn visit_u32<E: serde::de::Error>(self, v: u32) -> Result<Bson, E> {
        Ok(Bson::Int64(v.into()))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Bson, E> {
        i64::try_from(v)
            .map(Bson::Int64)
            .map_err(|_| E::custom(format!("u64 {} does not fit in int64", v)))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Bson, E> {
        Ok(Bson::Double(v))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Bson, E> {
        Ok(Bson::String(v.to_string()))
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Bson, E> {
        Ok(Bson::String(v))
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Bson, E> {
        Ok(Bson::Binary(Binary::generic(v)))
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Bson, E> {
        Ok(Bson::Binary(Binary::generic(v)))
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<Bson, E> {
        Ok(Bson::Null)
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Bson, E> {
        Ok(Bson::Null)
    }

    fn visit_some<D: serde::Deserializer<'de>>(self, d: D) -> Result<Bson, D::Error> {
        Bson::deserialize(d)
    }

    fn visit_newtype_struct<D: serde::Deserializer<'de>>(self, d: D) -> Result<Bson, D::Error> {
        Bson::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bson, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Bson>()? {
            items.push(item);
        }
        Ok(Bson::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Bson, A::Error> {
        let mut doc = Document::new();
        let Some(first) = map.next_key::<String>()? else {
            return Ok(Bson::Document(doc));
        };
        if first == EXTENDED {
            let wrapper: Document = map.next_value()?;
            return Ok(from_extended_document(wrapper));
        }
        doc.insert(first, map.next_value::<Bson>()?);
        while let Some((key, value)) = map.next_entry::<String, Bson>()? {
            doc.insert_if_absent(key, value);
        }
        Ok(Bson::Document(doc))
    }
}

impl<'de> Deserialize<'de> for Bson {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(BsonVisitor)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Bson::deserialize(deserializer)? {
            Bson::Document(doc) => Ok(doc),
            other => Err(serde::de::Error::custom(format!(
                "expected a document, got {:?}",
                other.element_type()
            ))),
        }
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Bson::ObjectId(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Bson::deserialize(deserializer)?.into_extended() {
            Bson::ObjectId(oid) => Ok(oid),
            Bson::String(s) => ObjectId::parse_str(&s).map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!(
                "expected an object id, got {:?}",
                other.element_type()
            ))),
        }
    }
}

impl Serialize for DateTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Bson::DateTime(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DateTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Bson::deserialize(deserializer)?.into_extended() {
            Bson::DateTime(dt) => Ok(dt),
            Bson::Int64(ms) => Ok(DateTime::from_millis(ms)),
            other => Err(serde::de::Error::custom(format!(
                "expected a datetime, got {:?}",
                other.element_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Widths {
        a: i8,
        b: i16,
        c: i32,
        d: i64,
        e: u8,
        f: u16,
        g: u32,
        h: u64,
        x: f32,
        y: f64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Empty,
        Circle(f64),
        Rect { w: i32, h: i32 },
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        #[serde(rename = "_id")]
        id: ObjectId,
        name: String,
        tags: Vec<String>,
        created: DateTime,
        nickname: Option<String>,
        shapes: Vec<Shape>,
        extra: Document,
    }

    #[test]
    fn test_numeric_widths_follow_type() {
        let w = Widths {
            a: -1,
            b: 2,
            c: 3,
            d: 4,
            e: 5,
            f: 6,
            g: 7,
            h: 8,
            x: 0.5,
            y: 1.5,
        };
        let doc = to_document(&w).unwrap();
        assert_eq!(doc.get("a"), Some(&Bson::Int32(-1)));
        assert_eq!(doc.get("d"), Some(&Bson::Int64(4)));
        assert_eq!(doc.get("e"), Some(&Bson::Int32(5)));
        assert_eq!(doc.get("g"), Some(&Bson::Int64(7)));
        assert_eq!(doc.get("h"), Some(&Bson::Int64(8)));
        assert_eq!(doc.get("x"), Some(&Bson::Double(0.5)));
        let back: Widths = from_document(doc).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_u64_overflow_is_error() {
        assert!(to_bson(&u64::MAX).unwrap_err().is_serialization());
    }

    #[test]
    fn test_reading_does_not_narrow_by_magnitude() {
        let widened: i64 = from_bson(Bson::Int32(7)).unwrap();
        assert_eq!(widened, 7);
        let fits: i32 = from_bson(Bson::Int64(7)).unwrap();
        assert_eq!(fits, 7);
        assert!(from_bson::<i32>(Bson::Int64(i64::from(i32::MAX) + 1)).is_err());
        assert!(from_bson::<i32>(Bson::Double(1.0)).is_err());
    }

    #[test]
    fn test_record_round_trip_keeps_native_types() {
        let record = Record {
            id: ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap(),
            name: "widget".into(),
            tags: vec!["a".into(), "b".into()],
            created: DateTime::from_millis(1_000),
            nickname: None,
            shapes: vec![Shape::Empty, Shape::Circle(1.0), Shape::Rect { w: 2, h: 3 }],
            extra: doc! { "n" => 5i64, "re" => Regex::new("x", "i") },
        };
        let doc = to_document(&record).unwrap();
        assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
        assert!(matches!(doc.get("created"), Some(Bson::DateTime(_))));
        assert_eq!(doc.get("nickname"), Some(&Bson::Null));
        assert_eq!(
            doc.get_array("shapes").unwrap()[2],
            Bson::Document(doc! { "Rect" => doc! { "w" => 2, "h" => 3 } })
        );
        assert!(matches!(
            doc.get_document("extra").and_then(|e| e.get("re")),
            Some(Bson::RegularExpression(_))
        ));

        let bytes = doc.to_vec().unwrap();
        let back: Record = from_document(Document::from_slice(&bytes).unwrap()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_bson_round_trips_through_itself() {
        let value = Bson::Document(doc! {
            "ts" => Timestamp { time: 1, increment: 2 },
            "min" => Bson::MinKey,
            "js" => Bson::JavaScriptCode("f()".into()),
            "bin" => Binary { subtype: BinarySubtype::Md5, bytes: vec![1; 4] },
        });
        let copy: Bson = from_bson(to_bson(&value).unwrap()).unwrap();
        assert_eq!(copy, value);
    }

    #[test]
    fn test_json_sees_wrapper_maps() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        let json = serde_json::to_string(&oid).unwrap();
        assert_eq!(json, r#"{"$oid":"507f1f77bcf86cd799439011"}"#);
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, oid);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reply {
        cursor: Document,
        bound: Bson,
    }

    #[test]
    fn test_wrapper_shaped_documents_stay_documents() {
        let doc = doc! {
            "cursor" => doc! { "min" => doc! { "$minKey" => 1 }, "at" => doc! { "$date" => 5 } },
            "bound" => doc! { "$oid" => "507f1f77bcf86cd799439011" },
        };
        let reply: Reply = from_document(doc.clone()).unwrap();
        assert_eq!(
            reply.cursor.get_document("min"),
            Some(&doc! { "$minKey" => 1 })
        );
        assert_eq!(reply.cursor.get_document("at"), Some(&doc! { "$date" => 5 }));
        assert!(matches!(reply.bound, Bson::Document(_)));
        assert_eq!(to_document(&reply).unwrap(), doc);
    }

    #[test]
    fn test_native_values_survive_next_to_wrapper_shapes() {
        let doc = doc! {
            "cursor" => doc! { "min" => Bson::MinKey, "fake" => doc! { "$maxKey" => 1 } },
            "bound" => DateTime::from_millis(5),
        };
        let reply: Reply = from_document(doc.clone()).unwrap();
        assert_eq!(reply.cursor.get("min"), Some(&Bson::MinKey));
        assert_eq!(
            reply.cursor.get("fake"),
            Some(&Bson::Document(doc! { "$maxKey" => 1 }))
        );
        assert_eq!(reply.bound, Bson::DateTime(DateTime::from_millis(5)));
    }

    #[test]
    fn test_map_keys_must_be_stringish() {
        let mut ok = BTreeMap::new();
        ok.insert(1, "one");
        assert_eq!(to_document(&ok).unwrap(), doc! { "1" => "one" });

        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], 1);
        assert!(to_document(&bad).is_err());
    }

    #[test]
    fn test_to_document_rejects_scalars() {
        assert!(to_document(&5i32).is_err());
    }
}
