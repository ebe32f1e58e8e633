//! Ordered documents.

use std::fmt;

use indexmap::IndexMap;
use indexmap::map::{IntoIter, Iter, Keys, Values};

use crate::error::BsonResult;
use crate::oid::ObjectId;
use crate::value::{Bson, DateTime};

/// An ordered mapping of field names to values.
///
/// Field order is insertion order and is preserved on the wire. Equality is
/// order sensitive, so two documents are equal only when their encodings are.
#[derive(Clone, Default)]
pub struct Document {
    inner: IndexMap<String, Bson>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty document with room for `capacity` fields.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: IndexMap::with_capacity(capacity),
        }
    }

    /// Insert a field. An existing field keeps its position and has its value
    /// replaced; the old value is returned.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        self.inner.insert(key.into(), value.into())
    }

    /// Insert a field only if it is not present yet. Returns `false` when the
    /// key already existed (the first occurrence wins).
    pub(crate) fn insert_if_absent(&mut self, key: String, value: Bson) -> bool {
        match self.inner.entry(key) {
            indexmap::map::Entry::Occupied(_) => false,
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Get a field.
    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.inner.get(key)
    }

    /// Get a mutable reference to a field.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Bson> {
        self.inner.get_mut(key)
    }

    /// Remove a field, keeping the order of the remaining ones.
    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        self.inner.shift_remove(key)
    }

    /// Check whether a field exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate fields in order.
    pub fn iter(&self) -> Iter<'_, String, Bson> {
        self.inner.iter()
    }

    /// Iterate field names in order.
    pub fn keys(&self) -> Keys<'_, String, Bson> {
        self.inner.keys()
    }

    /// Iterate values in order.
    pub fn values(&self) -> Values<'_, String, Bson> {
        self.inner.values()
    }

    /// The first field name. For a command document this is the command name.
    pub fn first_key(&self) -> Option<&str> {
        self.inner.keys().next().map(String::as_str)
    }

    /// Get a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Bson::as_str)
    }

    /// Get an int32 field.
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Bson::as_i32)
    }

    /// Get an int64 field.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Bson::as_i64)
    }

    /// Get a double field.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Bson::as_f64)
    }

    /// Get a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Bson::as_bool)
    }

    /// Get a nested document.
    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Bson::as_document)
    }

    /// Get an array field.
    pub fn get_array(&self, key: &str) -> Option<&Vec<Bson>> {
        self.get(key).and_then(Bson::as_array)
    }

    /// Get an object id field.
    pub fn get_object_id(&self, key: &str) -> Option<ObjectId> {
        self.get(key).and_then(Bson::as_object_id)
    }

    /// Get a datetime field.
    pub fn get_datetime(&self, key: &str) -> Option<DateTime> {
        match self.get(key) {
            Some(Bson::DateTime(dt)) => Some(*dt),
            _ => None,
        }
    }

    /// Get any numeric field widened to f64.
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Bson::as_number)
    }

    /// Encode to the binary format.
    pub fn to_vec(&self) -> BsonResult<Vec<u8>> {
        crate::codec::encode_document(self)
    }

    /// Decode from the binary format.
    pub fn from_slice(bytes: &[u8]) -> BsonResult<Self> {
        crate::codec::decode_document(bytes)
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.iter()).finish()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::json::document_to_json(self))
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = IntoIter<String, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Bson);
    type IntoIter = Iter<'a, String, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<K: Into<String>, V: Into<Bson>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl<K: Into<String>, V: Into<Bson>> Extend<(K, V)> for Document {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

/// Build a [`Document`] from `key => value` pairs.
///
/// ```rust
/// use lodestar_bson::doc;
///
/// let cmd = doc! { "ping" => 1, "comment" => "health check" };
/// assert_eq!(cmd.first_key(), Some("ping"));
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::Document::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut document = $crate::Document::new();
        $(
            document.insert($key, $value);
        )+
        document
    }};
}
