//! JCS (RFC 8785) canonicalization.
//!
//! Capability tokens are canonicalized before signing so that signer and
//! verifier agree on the exact bytes regardless of field order or
//! whitespace.
//!
//! Strategy: normalize the value tree first — every object rebuilt with
//! its keys in lexicographic order via a `BTreeMap` — then let serde's
//! compact serializer emit the bytes. `serde_json` writes map entries in
//! iteration order, so a tree whose maps were populated in sorted order
//! serializes canonically.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Canonicalize a value using JCS (RFC 8785): object keys sorted
/// lexicographically at every level, compact output.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let normalized = sort_keys(serde_json::to_value(value)?);
    serde_json::to_string(&normalized)
}

/// Rebuild the tree bottom-up with every object's keys in sorted order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let ordered: BTreeMap<String, Value> = fields
                .into_iter()
                .map(|(name, field)| (name, sort_keys(field)))
                .collect();
            Value::Object(ordered.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        primitive => primitive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonicalize(&v).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn sorts_nested_keys() {
        let v = json!({"z": {"b": 1, "a": 2}, "a": []});
        assert_eq!(canonicalize(&v).unwrap(), r#"{"a":[],"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn sorts_objects_inside_arrays() {
        let v = json!([{"b": 1, "a": 2}, 3]);
        assert_eq!(canonicalize(&v).unwrap(), r#"[{"a":2,"b":1},3]"#);
    }

    #[test]
    fn preserves_array_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonicalize(&v).unwrap(), "[3,1,2]");
    }

    #[test]
    fn escapes_strings() {
        let v = json!({"msg": "hello \"world\""});
        assert_eq!(canonicalize(&v).unwrap(), r#"{"msg":"hello \"world\""}"#);
    }

    #[test]
    fn deterministic() {
        let v = json!({"with": {"scheme": "storage", "resource": "collaboration"}, "can": "x"});
        assert_eq!(canonicalize(&v).unwrap(), canonicalize(&v).unwrap());
    }
}
