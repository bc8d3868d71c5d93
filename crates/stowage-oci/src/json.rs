//! Canonical JSON encoding.
//!
//! Objects are written compactly with keys sorted at every depth, so equal
//! values always produce identical bytes (and therefore identical digests).

use serde::Serialize;
use serde_json::{Map, Value};
use stowage_common::StowageResult;

/// Serialize `value` to canonical JSON bytes.
///
/// # Errors
///
/// Returns [`stowage_common::StowageError::Serialization`] if `value` cannot
/// be represented as JSON.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> StowageResult<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_vec(&value)?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k, sort_keys(v)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn keys_are_sorted_recursively() {
        let value = serde_json::json!({
            "zeta": 1,
            "alpha": { "y": [ { "b": 2, "a": 1 } ], "x": null },
        });
        let bytes = to_canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":{"x":null,"y":[{"a":1,"b":2}]},"zeta":1}"#
        );
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for (k, v) in [("one", 1), ("two", 2), ("three", 3), ("four", 4)] {
            first.insert(k, v);
        }
        for (k, v) in [("four", 4), ("three", 3), ("two", 2), ("one", 1)] {
            second.insert(k, v);
        }
        assert_eq!(
            to_canonical_json(&first).unwrap(),
            to_canonical_json(&second).unwrap()
        );
    }
}
