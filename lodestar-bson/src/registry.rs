//! Serializer trait and the type-keyed registry.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::oid::ObjectId;
use crate::raw::{BsonReader, BsonWriter};
use crate::value::{Bson, DateTime};

/// Maps values of `T` to and from the binary format.
pub trait BsonSerializer<T>: Send + Sync {
    /// Write `value` at the writer's current position.
    fn serialize(&self, value: &T, writer: &mut BsonWriter) -> BsonResult<()>;

    /// Read a `T` from the reader's current position.
    fn deserialize(&self, reader: &mut BsonReader<'_>) -> BsonResult<T>;
}

/// Shared handle to a serializer.
pub type SharedSerializer<T> = Arc<dyn BsonSerializer<T>>;

/// Serializer for [`Document`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentSerializer;

impl BsonSerializer<Document> for DocumentSerializer {
    fn serialize(&self, value: &Document, writer: &mut BsonWriter) -> BsonResult<()> {
        writer.write_document(value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>) -> BsonResult<Document> {
        reader.read_document()
    }
}

/// Serializer for any [`Bson`] value.
#[derive(Debug, Default, Clone, Copy)]
pub struct BsonValueSerializer;

impl BsonSerializer<Bson> for BsonValueSerializer {
    fn serialize(&self, value: &Bson, writer: &mut BsonWriter) -> BsonResult<()> {
        writer.write_value(value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>) -> BsonResult<Bson> {
        reader.read_value()
    }
}

macro_rules! primitive_serializer {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $write:ident, $read:ident) => {
        $(#[$doc])*
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $name;

        impl BsonSerializer<$ty> for $name {
            fn serialize(&self, value: &$ty, writer: &mut BsonWriter) -> BsonResult<()> {
                writer.$write(*value)
            }

            fn deserialize(&self, reader: &mut BsonReader<'_>) -> BsonResult<$ty> {
                reader.$read()
            }
        }
    };
}

primitive_serializer!(/// int32 values.
    Int32Serializer, i32, write_int32, read_int32);
primitive_serializer!(/// int64 values.
    Int64Serializer, i64, write_int64, read_int64);
primitive_serializer!(/// Double values.
    DoubleSerializer, f64, write_double, read_double);
primitive_serializer!(/// Boolean values.
    BooleanSerializer, bool, write_bool, read_bool);
primitive_serializer!(/// Object ids.
    ObjectIdSerializer, ObjectId, write_object_id, read_object_id);
primitive_serializer!(/// Datetimes.
    DateTimeSerializer, DateTime, write_datetime, read_datetime);

/// String values.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl BsonSerializer<String> for StringSerializer {
    fn serialize(&self, value: &String, writer: &mut BsonWriter) -> BsonResult<()> {
        writer.write_string(value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>) -> BsonResult<String> {
        reader.read_string()
    }
}

/// Structural serializer derived from a type's serde implementation.
pub struct SerdeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeSerializer<T> {
    /// Create a serde-backed serializer.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SerdeSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerdeSerializer<{}>", type_name::<T>())
    }
}

impl<T> BsonSerializer<T> for SerdeSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, writer: &mut BsonWriter) -> BsonResult<()> {
        let tree = crate::serde::to_bson(value)?;
        writer.write_value(&tree)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>) -> BsonResult<T> {
        let tree = reader.read_value()?;
        crate::serde::from_bson(tree)
    }
}

struct Entry {
    serializer: Arc<dyn Any + Send + Sync>,
    derived: bool,
}

/// Type-keyed serializer lookup.
///
/// Lookups take a read lock; inserts take the write lock and re-check before
/// inserting, so concurrent first use of a type derives at most one winner.
/// A registry is an ordinary value, usually shared behind an [`Arc`].
pub struct SerializerRegistry {
    entries: RwLock<HashMap<TypeId, Entry>>,
}

impl SerializerRegistry {
    /// Create a registry with the built-in serializers registered.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register::<Document>(Arc::new(DocumentSerializer));
        registry.register::<Bson>(Arc::new(BsonValueSerializer));
        registry.register::<i32>(Arc::new(Int32Serializer));
        registry.register::<i64>(Arc::new(Int64Serializer));
        registry.register::<f64>(Arc::new(DoubleSerializer));
        registry.register::<bool>(Arc::new(BooleanSerializer));
        registry.register::<String>(Arc::new(StringSerializer));
        registry.register::<ObjectId>(Arc::new(ObjectIdSerializer));
        registry.register::<DateTime>(Arc::new(DateTimeSerializer));
        registry
    }

    /// Create a registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the serializer for `T`.
    pub fn register<T: 'static>(&self, serializer: SharedSerializer<T>) {
        self.insert::<T>(serializer, false, true);
    }

    /// Look up the serializer for `T`.
    pub fn lookup<T: 'static>(&self) -> BsonResult<SharedSerializer<T>> {
        self.get::<T>().ok_or_else(|| {
            BsonError::serialization(format!("no serializer registered for {}", type_name::<T>()))
        })
    }

    /// Look up the serializer for `T`, deriving and caching a serde-backed one
    /// on first use.
    pub fn lookup_or_derive<T>(&self) -> SharedSerializer<T>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        if let Some(found) = self.get::<T>() {
            return found;
        }
        debug!(type_name = type_name::<T>(), "deriving serde serializer");
        self.insert::<T>(Arc::new(SerdeSerializer::<T>::new()), true, false)
    }

    /// Whether a serializer for `T` is known.
    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.read().contains_key(&TypeId::of::<T>())
    }

    /// Number of registered serializers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every derived serializer, keeping explicit registrations.
    pub fn clear(&self) {
        self.entries.write().retain(|_, entry| !entry.derived);
    }

    fn get<T: 'static>(&self) -> Option<SharedSerializer<T>> {
        let entries = self.entries.read();
        entries.get(&TypeId::of::<T>()).and_then(downcast::<T>)
    }

    /// Insert under the write lock. Without `replace`, an entry that appeared
    /// since the caller's read wins and is returned instead.
    fn insert<T: 'static>(
        &self,
        serializer: SharedSerializer<T>,
        derived: bool,
        replace: bool,
    ) -> SharedSerializer<T> {
        let mut entries = self.entries.write();
        let key = TypeId::of::<T>();
        if !replace {
            if let Some(existing) = entries.get(&key).and_then(downcast::<T>) {
                return existing;
            }
        }
        entries.insert(
            key,
            Entry {
                serializer: Arc::new(serializer.clone()),
                derived,
            },
        );
        serializer
    }
}

fn downcast<T: 'static>(entry: &Entry) -> Option<SharedSerializer<T>> {
    entry
        .serializer
        .downcast_ref::<SharedSerializer<T>>()
        .cloned()
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use serde::Deserialize;
    use std::thread;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn encode<T>(serializer: &dyn BsonSerializer<T>, value: &T) -> Vec<u8> {
        let mut writer = BsonWriter::new();
        serializer.serialize(value, &mut writer).unwrap();
        writer.into_bytes().unwrap()
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = SerializerRegistry::new();
        assert!(registry.contains::<Document>());
        assert!(registry.contains::<i64>());
        assert!(!registry.contains::<Point>());
    }

    #[test]
    fn test_lookup_miss_is_serialization_error() {
        let registry = SerializerRegistry::new();
        let err = registry.lookup::<Point>().err().unwrap();
        assert!(err.is_serialization());
        assert!(err.to_string().contains("Point"));
    }

    #[test]
    fn test_lookup_or_derive_caches() {
        let registry = SerializerRegistry::new();
        let first = registry.lookup_or_derive::<Point>();
        let second = registry.lookup_or_derive::<Point>();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.lookup::<Point>().is_ok());
    }

    #[test]
    fn test_derived_serializer_round_trip() {
        let registry = SerializerRegistry::new();
        let serializer = registry.lookup_or_derive::<Point>();
        let bytes = encode(serializer.as_ref(), &Point { x: 1, y: -2 });
        assert_eq!(bytes, doc! { "x" => 1, "y" => -2 }.to_vec().unwrap());

        let mut reader = BsonReader::new(&bytes);
        assert_eq!(serializer.deserialize(&mut reader).unwrap(), Point { x: 1, y: -2 });
    }

    #[test]
    fn test_document_serializer_round_trip() {
        let registry = SerializerRegistry::new();
        let serializer = registry.lookup::<Document>().unwrap();
        let d = doc! { "ok" => 1.0 };
        let bytes = encode(serializer.as_ref(), &d);
        let mut reader = BsonReader::new(&bytes);
        assert_eq!(serializer.deserialize(&mut reader).unwrap(), d);
    }

    #[test]
    fn test_clear_drops_only_derived() {
        let registry = SerializerRegistry::new();
        let builtins = registry.len();
        registry.lookup_or_derive::<Point>();
        assert_eq!(registry.len(), builtins + 1);
        registry.clear();
        assert_eq!(registry.len(), builtins);
        assert!(registry.contains::<Document>());
    }

    #[test]
    fn test_concurrent_derivation_has_one_winner() {
        let registry = Arc::new(SerializerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.lookup_or_derive::<Point>())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], r));
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = SerializerRegistry::empty();
        assert!(registry.is_empty());
        assert!(registry.lookup::<Document>().is_err());
    }
}
