//! Canonical JSON normalization
//!
//! Request bodies are re-serialized into a canonical form so that
//! structurally identical requests are byte-identical on disk. That makes
//! prompt-prefix stability checkable with a plain textual diff between two
//! captures.

use serde_json::{Map, Value};

/// Keys dropped during normalization. These fields are transient and
/// unrelated to the prompt prefix, and would otherwise make every capture
/// diff noisy.
pub const DROP_KEYS: &[&str] = &[
    "stream",
    "metadata",
    "user",
    "request_id",
    "traceparent",
    "tracestate",
];

/// Normalize a JSON value for diffing
///
/// Object keys are re-emitted in sorted order at every nesting level and
/// the transient [`DROP_KEYS`] are removed from objects. Array order is
/// preserved. This is a pure function of the input value.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !DROP_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();

            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), normalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Canonical text form of a JSON value
///
/// Semantically equal inputs serialize to byte-identical output regardless
/// of key order or whitespace in the source document.
pub fn to_canonical_string(value: &Value) -> String {
    let normalized = normalize(value);
    let mut text = serde_json::to_string_pretty(&normalized)
        .unwrap_or_else(|_| normalized.to_string());
    text.push('\n');
    text
}

/// Canonicalize raw body bytes, if they parse as JSON
///
/// Returns `None` for malformed or non-JSON input; the caller captures the
/// raw bytes only and flags the normalization as skipped.
pub fn normalize_bytes(raw: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    Some(to_canonical_string(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_canonical() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(to_canonical_string(&a), to_canonical_string(&b));
    }

    #[test]
    fn test_whitespace_is_canonical() {
        let a = normalize_bytes(br#"{"model":"gpt-4o-mini","input":"hi"}"#).unwrap();
        let b = normalize_bytes(b"{\n  \"input\": \"hi\",\n  \"model\": \"gpt-4o-mini\"\n}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_transient_keys_dropped() {
        let value = json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "user": "u-1",
            "metadata": {"trace": "t"},
            "input": [{"role": "user", "content": "hi"}]
        });

        let normalized = normalize(&value);
        let obj = normalized.as_object().unwrap();
        assert!(!obj.contains_key("stream"));
        assert!(!obj.contains_key("user"));
        assert!(!obj.contains_key("metadata"));
        assert!(obj.contains_key("model"));
        assert!(obj.contains_key("input"));
    }

    #[test]
    fn test_nested_drop_keys_removed() {
        let value = json!({"outer": {"request_id": "r-1", "keep": 1}});
        let normalized = normalize(&value);
        assert_eq!(normalized, json!({"outer": {"keep": 1}}));
    }

    #[test]
    fn test_array_order_preserved() {
        let value = json!({"input": [3, 1, 2]});
        assert_eq!(normalize(&value), json!({"input": [3, 1, 2]}));
    }

    #[test]
    fn test_malformed_body_skipped() {
        assert!(normalize_bytes(b"not json at all").is_none());
        assert!(normalize_bytes(b"").is_none());
    }

    #[test]
    fn test_canonical_string_ends_with_newline() {
        let value = json!({"a": 1});
        assert!(to_canonical_string(&value).ends_with('\n'));
    }
}
