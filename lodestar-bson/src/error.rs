//! Error types for the value model and its codecs.

use std::fmt;

use thiserror::Error;

/// Result type for BSON operations.
pub type BsonResult<T> = Result<T, BsonError>;

/// Errors raised while building, encoding, decoding or mapping documents.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BsonError {
    /// A type could not be mapped to or from the wire format.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A writer or reader method was called out of order.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The input ended before the declared length was satisfied.
    #[error("unexpected end of input while reading {0}")]
    UnexpectedEof(&'static str),

    /// An element carried a type tag this codec does not know.
    #[error("invalid element type 0x{0:02x}")]
    InvalidElementType(u8),

    /// A string or field name was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A length prefix was negative, too small, too large or inconsistent.
    #[error("invalid length: {0}")]
    InvalidLength(String),

    /// Free-form message raised through serde.
    #[error("{0}")]
    Message(String),
}

impl BsonError {
    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create an invalid length error.
    pub fn invalid_length(message: impl Into<String>) -> Self {
        Self::InvalidLength(message.into())
    }

    /// Check if this is a writer/reader state error.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// Check if this is a type mapping error.
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization(_) | Self::Message(_))
    }
}

impl serde::ser::Error for BsonError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Message(msg.to_string())
    }
}

impl serde::de::Error for BsonError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Message(msg.to_string())
    }
}
