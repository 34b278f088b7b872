//! Canonical JSON serialization for signing, MAC and hashing.
//!
//! The canonical form is UTF-8 JSON with object keys in lexicographic
//! (byte) order and no insignificant whitespace. Signatures and digests
//! always cover these bytes, never the pretty-printed file contents, so
//! a re-serialized file still verifies.

use serde::Serialize;
use serde_json::Value;

use crate::error::{OvsaError, Result};

/// Serialize any value to its canonical JSON bytes.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)
        .map_err(|e| OvsaError::InvalidParameter(format!("JSON serialization: {e}")))?;
    let mut out = Vec::new();
    write_value(&mut out, &value)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            serde_json::to_writer(&mut *out, s)
                .map_err(|e| OvsaError::InvalidParameter(format!("JSON string: {e}")))?;
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Sort explicitly; do not rely on the map's internal ordering.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)
                    .map_err(|e| OvsaError::InvalidParameter(format!("JSON key: {e}")))?;
                out.push(b':');
                write_value(out, &map[key.as_str()])?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_whitespace_free() {
        let v = json!({"zeta": 1, "alpha": {"nested_b": true, "nested_a": [1, 2]}, "mid": "x"});
        let bytes = canonical_json_bytes(&v).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":{"nested_a":[1,2],"nested_b":true},"mid":"x","zeta":1}"#
        );
    }

    #[test]
    fn serialization_is_deterministic() {
        let v = json!({"b": [1, 2, 3], "a": "text", "c": {"y": null, "x": 7}});
        let one = canonical_json_bytes(&v).unwrap();
        let two = canonical_json_bytes(&v).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn string_escapes_survive() {
        let v = json!({"name": "a\"b\\c\nd"});
        let bytes = canonical_json_bytes(&v).unwrap();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back["name"], "a\"b\\c\nd");
    }

    #[test]
    fn integers_have_no_leading_zeros() {
        let v = json!({"n": 7u64, "big": 1048576u64});
        let s = String::from_utf8(canonical_json_bytes(&v).unwrap()).unwrap();
        assert_eq!(s, r#"{"big":1048576,"n":7}"#);
    }
}
