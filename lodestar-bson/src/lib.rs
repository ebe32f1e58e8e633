//! # lodestar-bson
//!
//! Self-describing binary document model used by the lodestar driver core.
//!
//! - [`Document`] and [`Bson`]: the ordered value tree
//! - [`raw::BsonWriter`] / [`raw::BsonReader`]: streaming codec with an
//!   explicit context stack
//! - [`SerializerRegistry`]: type-keyed serializers, derived from `serde`
//!   implementations on first use
//! - [`json`]: canonical text rendering in the strict and shell dialects
//!
//! ```rust
//! use lodestar_bson::{Bson, Document, doc};
//!
//! let cmd = doc! { "ping" => 1, "$db" => "admin" };
//! let bytes = cmd.to_vec().unwrap();
//! let back = Document::from_slice(&bytes).unwrap();
//! assert_eq!(back.get("ping"), Some(&Bson::Int32(1)));
//! ```

pub mod codec;
pub mod document;
pub mod error;
pub mod json;
pub mod oid;
pub mod raw;
pub mod registry;
pub mod serde;
pub mod value;

pub use document::Document;
pub use error::{BsonError, BsonResult};
pub use json::{JsonOutputMode, JsonWriterSettings};
pub use oid::ObjectId;
pub use registry::{
    BsonSerializer, BsonValueSerializer, DocumentSerializer, SerdeSerializer, SerializerRegistry,
    SharedSerializer,
};
pub use self::serde::{from_bson, from_document, to_bson, to_document};
pub use value::{Binary, BinarySubtype, Bson, DateTime, ElementType, Regex, Timestamp};
