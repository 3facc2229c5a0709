//! JSON list codec for list-valued rule columns.
//!
//! Target channel ids (and the set-valued filter fields) are stored as JSON
//! arrays in a single TEXT column. Decoding must yield the exact sequence
//! that was encoded, order included.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DatabaseError;

/// Encode an ordered channel id list as a JSON array.
pub fn encode_channel_ids(ids: &[i64]) -> String {
    encode_list(ids)
}

/// Decode a JSON array of channel ids.
pub fn decode_channel_ids(raw: &str) -> Result<Vec<i64>, DatabaseError> {
    decode_list(raw)
}

/// Encode any serializable sequence as a JSON array.
pub fn encode_list<T: Serialize>(items: &[T]) -> String {
    // A slice of plain values always serializes.
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a JSON array column. An empty or blank column is an empty list.
pub fn decode_list<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid JSON list {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_round_trip_preserves_order() {
        let ids = vec![-1002233445566, 42, -7, 42_000_000_000, 0];
        let encoded = encode_channel_ids(&ids);
        assert_eq!(encoded, "[-1002233445566,42,-7,42000000000,0]");
        assert_eq!(decode_channel_ids(&encoded).unwrap(), ids);
    }

    #[test]
    fn empty_list_round_trip() {
        assert_eq!(encode_channel_ids(&[]), "[]");
        assert!(decode_channel_ids("[]").unwrap().is_empty());
        assert!(decode_channel_ids("").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_column() {
        assert!(matches!(
            decode_channel_ids("[1, \"two\"]"),
            Err(DatabaseError::Serialization(_))
        ));
        assert!(decode_channel_ids("1,2,3").is_err());
    }

    #[test]
    fn string_lists() {
        let mimes = vec!["image/png".to_string(), "video/mp4".to_string()];
        let decoded: Vec<String> = decode_list(&encode_list(&mimes)).unwrap();
        assert_eq!(decoded, mimes);
    }
}
