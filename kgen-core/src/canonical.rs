//! Byte-deterministic canonical JSON for hashing and signing

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::{KgenError, KgenResult};

/// Nesting guard for pathological inputs; well-formed records stay shallow.
const MAX_DEPTH: usize = 128;

/// Serialize a JSON tree into its canonical byte form.
///
/// Keys are sorted lexicographically by code point, arrays keep declared
/// order, strings carry JSON-minimum escapes only, and no whitespace
/// appears between tokens. Floats, NaN, and `null` are refused; absent
/// fields must be omitted, never written as `null`.
pub fn canonicalize(value: &Value) -> KgenResult<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    write_value(value, &mut out, 0)?;
    Ok(out)
}

/// Canonicalize any serializable record.
pub fn canonicalize_record<T: Serialize>(record: &T) -> KgenResult<Vec<u8>> {
    let value = serde_json::to_value(record)
        .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
    canonicalize(&value)
}

fn write_value(value: &Value, out: &mut Vec<u8>, depth: usize) -> KgenResult<()> {
    if depth > MAX_DEPTH {
        return Err(KgenError::Canonicalization(format!(
            "nesting deeper than {} levels",
            MAX_DEPTH
        )));
    }

    match value {
        Value::Null => Err(KgenError::Canonicalization(
            "null is forbidden; omit absent fields".to_string(),
        )),
        Value::Bool(b) => {
            out.extend_from_slice(if *b { b"true" } else { b"false" });
            Ok(())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(i.to_string().as_bytes());
                Ok(())
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(u.to_string().as_bytes());
                Ok(())
            } else {
                Err(KgenError::Canonicalization(format!(
                    "non-integer number {} is forbidden in canonical records",
                    n
                )))
            }
        }
        Value::String(s) => {
            // serde_json emits the JSON-minimum escape set and leaves
            // non-ASCII as raw UTF-8.
            let encoded = serde_json::to_vec(s)
                .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
            out.extend_from_slice(&encoded);
            Ok(())
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out, depth + 1)?;
            }
            out.push(b']');
            Ok(())
        }
        Value::Object(map) => {
            // Collect into a BTreeMap so ordering does not depend on how
            // the map was built.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push(b'{');
            for (i, (key, val)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let encoded = serde_json::to_vec(key)
                    .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
                out.extend_from_slice(&encoded);
                out.push(b':');
                write_value(val, out, depth + 1)?;
            }
            out.push(b'}');
            Ok(())
        }
    }
}

/// The record with its top-level `signature` removed. Signatures always
/// cover this projection.
pub fn signing_projection(record: &Value) -> Value {
    let mut projected = record.clone();
    if let Value::Object(map) = &mut projected {
        map.remove("signature");
    }
    projected
}

/// The projection bound by `integrity.contextHash`: the artifact reference
/// and its generation context, plus the environment record when
/// `strict_env` is set.
pub fn context_projection(record: &Value, strict_env: bool) -> Value {
    let mut projected = serde_json::Map::new();
    if let Value::Object(map) = record {
        for key in ["schemaVersion", "artifact", "generation"] {
            if let Some(v) = map.get(key) {
                projected.insert(key.to_string(), v.clone());
            }
        }
        if strict_env {
            if let Some(v) = map.get("environment") {
                projected.insert("environment".to_string(), v.clone());
            }
        }
    }
    Value::Object(projected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted() {
        let value = json!({"zeta": 1, "alpha": 2, "mid": {"b": 1, "a": 2}});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":2,"mid":{"a":2,"b":1},"zeta":1}"#
        );
    }

    #[test]
    fn test_arrays_keep_order() {
        let value = json!({"rules": ["r2", "r1", "r3"]});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"rules":["r2","r1","r3"]}"#
        );
    }

    #[test]
    fn test_semantically_equal_records_canonicalize_identically() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": true, "x": "s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": "s", "y": true}, "b": 1}"#).unwrap();
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn test_floats_refused() {
        let value = json!({"fraction": 0.5});
        assert!(matches!(
            canonicalize(&value),
            Err(KgenError::Canonicalization(_))
        ));
    }

    #[test]
    fn test_null_refused() {
        let value = json!({"absent": null});
        assert!(canonicalize(&value).is_err());
    }

    #[test]
    fn test_non_ascii_passes_unescaped() {
        let value = json!({"name": "caf\u{e9}"});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "{\"name\":\"caf\u{e9}\"}");
    }

    #[test]
    fn test_signing_projection_removes_signature() {
        let record = json!({"schemaVersion": "2.0", "signature": {"value": "ab"}});
        let projected = signing_projection(&record);
        assert!(projected.get("signature").is_none());
        assert!(projected.get("schemaVersion").is_some());
    }

    #[test]
    fn test_context_projection_env_toggle() {
        let record = json!({
            "schemaVersion": "2.0",
            "artifact": {"path": "out/a.txt"},
            "generation": {"operationId": "op-1"},
            "environment": {"platform": "linux"},
            "integrity": {"artifactHash": "ab"}
        });
        let lax = context_projection(&record, false);
        assert!(lax.get("environment").is_none());
        assert!(lax.get("integrity").is_none());
        let strict = context_projection(&record, true);
        assert!(strict.get("environment").is_some());
    }
}
