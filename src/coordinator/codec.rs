// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L2 value envelope: `{"v": <value>, "tags": [...]}`.
//!
//! Carrying the tags next to the value lets an explicit delete find the tag
//! sets to clean up, and lets a promoted L1 copy keep its tags.

use std::io;

use serde::{Deserialize, Serialize};

use crate::storage::traits::StorageError;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: &'a serde_json::Value,
    tags: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub v: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub(crate) fn encode(value: &serde_json::Value, tags: &[String]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EnvelopeRef { v: value, tags })
}

pub(crate) fn decode(key: &str, bytes: &[u8]) -> Result<Envelope, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialized size of `value` in bytes, without allocating the output.
pub(crate) fn json_size(value: &serde_json::Value) -> usize {
    let mut counter = ByteCounter(0);
    // Writing a Value into an infallible sink can't fail
    let _ = serde_json::to_writer(&mut counter, value);
    counter.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_layout() {
        let bytes = encode(&json!({"title": "Engineer"}), &["job".to_string()]).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(raw, json!({"v": {"title": "Engineer"}, "tags": ["job"]}));
    }

    #[test]
    fn test_decode_without_tags() {
        let envelope = decode("k", br#"{"v": 7}"#).unwrap();
        assert_eq!(envelope.v, json!(7));
        assert!(envelope.tags.is_empty());
    }

    #[test]
    fn test_decode_corrupt_bytes() {
        let err = decode("job:42", b"\x00\xffnot json").unwrap_err();
        assert!(matches!(err, StorageError::Serialization { ref key, .. } if key == "job:42"));
    }

    #[test]
    fn test_json_size_matches_serialized_length() {
        let value = json!({"title": "Engineer", "salary": [1, 2, 3]});
        assert_eq!(json_size(&value), serde_json::to_vec(&value).unwrap().len());
    }
}
