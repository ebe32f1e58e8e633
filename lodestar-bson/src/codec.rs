//! Whole-document encode and decode.

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::raw::{BsonReader, BsonWriter};

/// Encode a document to bytes.
pub fn encode_document(document: &Document) -> BsonResult<Vec<u8>> {
    let mut writer = BsonWriter::new();
    writer.write_document(document)?;
    writer.into_bytes()
}

/// Decode exactly one document from `bytes`.
///
/// Trailing bytes after the document are rejected.
pub fn decode_document(bytes: &[u8]) -> BsonResult<Document> {
    let mut reader = BsonReader::new(bytes);
    let document = reader.read_document()?;
    if reader.position() != bytes.len() {
        return Err(BsonError::invalid_length(format!(
            "{} trailing byte(s) after document",
            bytes.len() - reader.position()
        )));
    }
    Ok(document)
}

/// Read the declared length of the document starting at `bytes[0]`.
pub fn peek_document_length(bytes: &[u8]) -> BsonResult<usize> {
    let prefix: [u8; 4] = bytes
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(BsonError::UnexpectedEof("document length"))?;
    let len = i32::from_le_bytes(prefix);
    usize::try_from(len)
        .ok()
        .filter(|&len| len >= 5)
        .ok_or_else(|| BsonError::invalid_length(format!("document length {}", len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Binary, BinarySubtype, Bson, DateTime, Regex, Timestamp};
    use crate::{ObjectId, doc};
    use pretty_assertions::assert_eq;

    fn nested(depth: usize) -> Document {
        let mut d = doc! { "leaf" => "x" };
        for i in 0..depth {
            d = doc! { "level" => i as i32, "child" => d, "list" => vec![Bson::Int32(1), Bson::Null] };
        }
        d
    }

    #[test]
    fn test_round_trip_every_kind() {
        let d = doc! {
            "double" => 1.5,
            "string" => "héllo",
            "doc" => doc! { "a" => 1 },
            "array" => vec![Bson::Int32(1), Bson::String("two".into())],
            "binary" => Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2, 3] },
            "old" => Binary { subtype: BinarySubtype::BinaryOld, bytes: vec![9] },
            "oid" => ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap(),
            "bool" => true,
            "date" => DateTime::from_millis(1_700_000_000_000),
            "null" => Bson::Null,
            "regex" => Regex::new("^a", "xi"),
            "js" => Bson::JavaScriptCode("1+1".into()),
            "i32" => i32::MIN,
            "ts" => Timestamp { time: 7, increment: 3 },
            "i64" => i64::MAX,
            "min" => Bson::MinKey,
            "max" => Bson::MaxKey,
        };
        let bytes = encode_document(&d).unwrap();
        assert_eq!(decode_document(&bytes).unwrap(), d);
    }

    #[test]
    fn test_round_trip_deep_nesting() {
        let d = nested(64);
        let bytes = d.to_vec().unwrap();
        assert_eq!(Document::from_slice(&bytes).unwrap(), d);
    }

    #[test]
    fn test_numeric_boundaries_keep_width() {
        let d = doc! { "a" => i32::MAX, "b" => i64::MIN, "c" => f64::MIN_POSITIVE };
        let back = decode_document(&encode_document(&d).unwrap()).unwrap();
        assert_eq!(back.get("a"), Some(&Bson::Int32(i32::MAX)));
        assert_eq!(back.get("b"), Some(&Bson::Int64(i64::MIN)));
        assert_eq!(back.get("c"), Some(&Bson::Double(f64::MIN_POSITIVE)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_document(&doc! { "a" => 1 }).unwrap();
        bytes.push(0);
        assert!(matches!(decode_document(&bytes), Err(BsonError::InvalidLength(_))));
    }

    #[test]
    fn test_peek_length() {
        let bytes = encode_document(&doc! { "a" => 1 }).unwrap();
        assert_eq!(peek_document_length(&bytes).unwrap(), bytes.len());
        assert!(peek_document_length(&[1, 0]).is_err());
    }

    #[test]
    fn test_matches_reference_encoder() {
        let ours = doc! {
            "ping" => 1,
            "n" => 5i64,
            "s" => "x",
            "f" => 2.0,
            "b" => false,
            "arr" => vec![1, 2],
            "sub" => doc! { "k" => Bson::Null },
        };
        let theirs = bson::doc! {
            "ping": 1,
            "n": 5i64,
            "s": "x",
            "f": 2.0,
            "b": false,
            "arr": [1, 2],
            "sub": { "k": bson::Bson::Null },
        };
        let mut expected = Vec::new();
        theirs.to_writer(&mut expected).unwrap();
        assert_eq!(encode_document(&ours).unwrap(), expected);
    }
}
