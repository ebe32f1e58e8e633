//! The self-describing value tree.

use std::fmt;

use chrono::{TimeZone, Utc};

use crate::document::Document;
use crate::oid::ObjectId;

/// Wire type tags, one per value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    /// 64-bit IEEE 754 floating point.
    Double = 0x01,
    /// UTF-8 string.
    String = 0x02,
    /// Embedded document.
    EmbeddedDocument = 0x03,
    /// Array (encoded as a document with "0", "1", … keys).
    Array = 0x04,
    /// Binary blob with a subtype.
    Binary = 0x05,
    /// 12-byte object id.
    ObjectId = 0x07,
    /// Boolean.
    Boolean = 0x08,
    /// UTC datetime in milliseconds.
    DateTime = 0x09,
    /// Null.
    Null = 0x0A,
    /// Regular expression.
    RegularExpression = 0x0B,
    /// JavaScript code.
    JavaScriptCode = 0x0D,
    /// 32-bit signed integer.
    Int32 = 0x10,
    /// Replication timestamp.
    Timestamp = 0x11,
    /// 64-bit signed integer.
    Int64 = 0x12,
    /// Max key.
    MaxKey = 0x7F,
    /// Min key.
    MinKey = 0xFF,
}

impl ElementType {
    /// Map a tag byte to an element type.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Double,
            0x02 => Self::String,
            0x03 => Self::EmbeddedDocument,
            0x04 => Self::Array,
            0x05 => Self::Binary,
            0x07 => Self::ObjectId,
            0x08 => Self::Boolean,
            0x09 => Self::DateTime,
            0x0A => Self::Null,
            0x0B => Self::RegularExpression,
            0x0D => Self::JavaScriptCode,
            0x10 => Self::Int32,
            0x11 => Self::Timestamp,
            0x12 => Self::Int64,
            0x7F => Self::MaxKey,
            0xFF => Self::MinKey,
            _ => return None,
        })
    }
}

/// Binary subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinarySubtype {
    /// Generic bytes (0x00).
    Generic,
    /// Function (0x01).
    Function,
    /// Old binary (0x02).
    BinaryOld,
    /// Old UUID (0x03).
    UuidOld,
    /// RFC 4122 UUID (0x04).
    Uuid,
    /// MD5 digest (0x05).
    Md5,
    /// User defined (0x80..=0xFF) or reserved.
    Other(u8),
}

impl From<u8> for BinarySubtype {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => Self::Generic,
            0x01 => Self::Function,
            0x02 => Self::BinaryOld,
            0x03 => Self::UuidOld,
            0x04 => Self::Uuid,
            0x05 => Self::Md5,
            other => Self::Other(other),
        }
    }
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> Self {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidOld => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::Other(b) => b,
        }
    }
}

/// A binary blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary {
    /// Subtype tag.
    pub subtype: BinarySubtype,
    /// Payload.
    pub bytes: Vec<u8>,
}

impl Binary {
    /// Create a generic binary blob.
    pub fn generic(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype: BinarySubtype::Generic,
            bytes: bytes.into(),
        }
    }
}

/// A UTC datetime with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateTime(i64);

impl DateTime {
    /// Construct from milliseconds since the Unix epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// The current time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Milliseconds since the Unix epoch.
    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }

    /// Convert to a chrono datetime, if representable.
    pub fn to_chrono(&self) -> Option<chrono::DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }

    /// RFC 3339 rendering with millisecond precision, if representable.
    pub fn to_rfc3339(&self) -> Option<String> {
        self.to_chrono()
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }
}

impl From<chrono::DateTime<Utc>> for DateTime {
    fn from(dt: chrono::DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Some(s) => f.write_str(&s),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Replication timestamp: seconds plus an ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds since the epoch.
    pub time: u32,
    /// Ordinal within the second.
    pub increment: u32,
}

/// A regular expression with its option flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Regex {
    /// Pattern source.
    pub pattern: String,
    /// Option letters, stored sorted.
    pub options: String,
}

impl Regex {
    /// Create a regex, normalizing the option letters to sorted order.
    pub fn new(pattern: impl Into<String>, options: impl AsRef<str>) -> Self {
        let mut chars: Vec<char> = options.as_ref().chars().collect();
        chars.sort_unstable();
        Self {
            pattern: pattern.into(),
            options: chars.into_iter().collect(),
        }
    }
}

/// A value in the document tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Bson {
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Nested document.
    Document(Document),
    /// Ordered list of values.
    Array(Vec<Bson>),
    /// Binary blob.
    Binary(Binary),
    /// Object id.
    ObjectId(ObjectId),
    /// Boolean.
    Boolean(bool),
    /// UTC datetime.
    DateTime(DateTime),
    /// Null.
    #[default]
    Null,
    /// Regular expression.
    RegularExpression(Regex),
    /// JavaScript code.
    JavaScriptCode(String),
    /// 32-bit integer.
    Int32(i32),
    /// Replication timestamp.
    Timestamp(Timestamp),
    /// 64-bit integer.
    Int64(i64),
    /// Sorts above every other value.
    MaxKey,
    /// Sorts below every other value.
    MinKey,
}

impl Bson {
    /// The wire tag for this value.
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Double(_) => ElementType::Double,
            Self::String(_) => ElementType::String,
            Self::Document(_) => ElementType::EmbeddedDocument,
            Self::Array(_) => ElementType::Array,
            Self::Binary(_) => ElementType::Binary,
            Self::ObjectId(_) => ElementType::ObjectId,
            Self::Boolean(_) => ElementType::Boolean,
            Self::DateTime(_) => ElementType::DateTime,
            Self::Null => ElementType::Null,
            Self::RegularExpression(_) => ElementType::RegularExpression,
            Self::JavaScriptCode(_) => ElementType::JavaScriptCode,
            Self::Int32(_) => ElementType::Int32,
            Self::Timestamp(_) => ElementType::Timestamp,
            Self::Int64(_) => ElementType::Int64,
            Self::MaxKey => ElementType::MaxKey,
            Self::MinKey => ElementType::MinKey,
        }
    }

    /// String slice if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Value if this is an int32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Value if this is an int64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Value if this is a double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Value if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Nested document, if any.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(d) => Some(d),
            _ => None,
        }
    }

    /// Array elements, if any.
    pub fn as_array(&self) -> Option<&Vec<Bson>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Object id, if any.
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Self::ObjectId(oid) => Some(*oid),
            _ => None,
        }
    }

    /// Numeric value of any numeric kind, widened to f64.
    ///
    /// Used for status fields such as `ok`, which servers send as int32,
    /// int64 or double interchangeably.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Check if this is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::json::to_json(self))
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Bson {
                fn from(v: $ty) -> Self {
                    Bson::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    f64 => Double,
    f32 => Double,
    String => String,
    &str => String,
    Document => Document,
    Binary => Binary,
    ObjectId => ObjectId,
    bool => Boolean,
    DateTime => DateTime,
    Regex => RegularExpression,
    i32 => Int32,
    i16 => Int32,
    i8 => Int32,
    Timestamp => Timestamp,
    i64 => Int64,
}

impl From<&String> for Bson {
    fn from(v: &String) -> Self {
        Bson::String(v.clone())
    }
}

impl<T: Into<Bson>> From<Vec<T>> for Bson {
    fn from(v: Vec<T>) -> Self {
        Bson::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Bson::Null)
    }
}

impl From<chrono::DateTime<Utc>> for Bson {
    fn from(v: chrono::DateTime<Utc>) -> Self {
        Bson::DateTime(v.into())
    }
}

impl From<uuid::Uuid> for Bson {
    fn from(v: uuid::Uuid) -> Self {
        Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: v.as_bytes().to_vec(),
        })
    }
}
