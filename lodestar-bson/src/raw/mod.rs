//! Low-level streaming writer and reader for the binary document format.
//!
//! Both sides keep an explicit stack of open documents and arrays and refuse
//! calls that do not fit the current position.

mod reader;
mod writer;

pub use reader::{BsonReader, ReaderState};
pub use writer::{BsonWriter, WriterState};

/// Largest document accepted by default (16 MiB).
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextKind {
    Document,
    Array,
}
