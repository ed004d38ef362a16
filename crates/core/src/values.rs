//! Helm values: layered deep merge and a canonical content hash.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A values tree (top level is always a mapping).
pub type Values = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValuesError {
    #[error("{kind} {name} not found")]
    MissingObject { kind: String, name: String },
    #[error("key {key} not found in {kind} {name}")]
    MissingKey { kind: String, name: String, key: String },
    #[error("failed to parse values from {origin}: {reason}")]
    Parse { origin: String, reason: String },
    #[error("values from {0} are not a mapping")]
    NotAMap(String),
    #[error("failed to read values: {0}")]
    Read(String),
}

/// Merge `src` into `dst`. Nested maps merge key by key; anything else
/// (scalars, arrays, type mismatches) is replaced by `src`.
pub fn deep_merge(dst: &mut Values, src: Values) {
    for (key, value) in src {
        if let Value::Object(src_map) = value {
            if let Some(Value::Object(dst_map)) = dst.get_mut(&key) {
                deep_merge(dst_map, src_map);
                continue;
            }
            dst.insert(key, Value::Object(src_map));
        } else {
            dst.insert(key, value);
        }
    }
}

/// Fold layers left to right; later layers win.
pub fn merge_layers<I>(layers: I) -> Values
where
    I: IntoIterator<Item = Values>,
{
    let mut out = Values::new();
    for layer in layers {
        deep_merge(&mut out, layer);
    }
    out
}

/// Parse a values document (YAML or JSON). An empty document is an empty map.
pub fn parse_document(origin: &str, text: &str) -> Result<Values, ValuesError> {
    if text.trim().is_empty() {
        return Ok(Values::new());
    }
    let parsed: Value = serde_yaml::from_str(text)
        .map_err(|e| ValuesError::Parse { origin: origin.to_string(), reason: e.to_string() })?;
    match parsed {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Values::new()),
        _ => Err(ValuesError::NotAMap(origin.to_string())),
    }
}

/// Inline `spec.values`: absent or null is empty, a map is taken as is.
pub fn inline(values: Option<&Value>) -> Result<Values, ValuesError> {
    match values {
        None | Some(Value::Null) => Ok(Values::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(ValuesError::NotAMap("spec.values".to_string())),
    }
}

/// Serialize with object keys sorted at every level.
pub fn canonical_json(values: &Values) -> String {
    let mut out = String::new();
    write_map(values, &mut out);
    out
}

fn write_map(map: &Values, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(key.as_str()).to_string());
        out.push(':');
        if let Some(v) = map.get(key) {
            write_value(v, out);
        }
    }
    out.push('}');
}

fn write_value(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => write_map(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical form, truncated to 8 bytes, lowercase hex.
pub fn values_hash(values: &Values) -> String {
    let digest = Sha256::digest(canonical_json(values).as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Values {
        match v {
            Value::Object(m) => m,
            _ => panic!("not a map"),
        }
    }

    #[test]
    fn inline_values_win_over_references() {
        let from_ref = map(json!({"replicas": 1, "size": "1Gi"}));
        let inline = map(json!({"replicas": 3}));
        let merged = merge_layers([from_ref, inline]);
        assert_eq!(Value::Object(merged), json!({"replicas": 3, "size": "1Gi"}));
    }

    #[test]
    fn nested_maps_merge_and_mismatches_replace() {
        let base = map(json!({
            "auth": {"user": "app", "tls": {"enabled": false}},
            "ports": [5432],
            "image": {"tag": "15"}
        }));
        let over = map(json!({
            "auth": {"tls": {"enabled": true}},
            "ports": [5433, 5434],
            "image": "custom:latest"
        }));
        let merged = merge_layers([base, over]);
        assert_eq!(
            Value::Object(merged),
            json!({
                "auth": {"user": "app", "tls": {"enabled": true}},
                "ports": [5433, 5434],
                "image": "custom:latest"
            })
        );
    }

    #[test]
    fn scalar_replaced_by_map() {
        let merged = merge_layers([map(json!({"persistence": false})), map(json!({"persistence": {"size": "8Gi"}}))]);
        assert_eq!(Value::Object(merged), json!({"persistence": {"size": "8Gi"}}));
    }

    #[test]
    fn hash_ignores_key_order() {
        let a: Values = serde_json::from_str(r#"{"b": {"y": 1, "x": [1, {"q": 2, "p": 1}]}, "a": "s"}"#).unwrap();
        let b: Values = serde_json::from_str(r#"{"a": "s", "b": {"x": [1, {"p": 1, "q": 2}], "y": 1}}"#).unwrap();
        assert_eq!(values_hash(&a), values_hash(&b));
        assert_eq!(canonical_json(&a), r#"{"a":"s","b":{"x":[1,{"p":1,"q":2}],"y":1}}"#);
    }

    #[test]
    fn hash_is_sixteen_hex_chars_and_sensitive_to_content() {
        let empty = values_hash(&Values::new());
        assert_eq!(empty, "44136fa355b3678a");
        let one = values_hash(&map(json!({"replicas": 1})));
        let three = values_hash(&map(json!({"replicas": 3})));
        assert_eq!(one.len(), 16);
        assert_ne!(one, three);
    }

    #[test]
    fn parse_document_accepts_yaml_and_json() {
        let y = parse_document("cm/x", "replicas: 2\nauth:\n  user: app\n").unwrap();
        assert_eq!(Value::Object(y), json!({"replicas": 2, "auth": {"user": "app"}}));
        let j = parse_document("cm/x", r#"{"replicas": 2}"#).unwrap();
        assert_eq!(j.get("replicas"), Some(&json!(2)));
        assert!(parse_document("cm/x", "").unwrap().is_empty());
        assert_eq!(parse_document("cm/x", "- a\n- b\n"), Err(ValuesError::NotAMap("cm/x".into())));
    }

    #[test]
    fn inline_rejects_non_maps() {
        assert!(inline(None).unwrap().is_empty());
        assert!(inline(Some(&json!(null))).unwrap().is_empty());
        assert!(inline(Some(&json!([1, 2]))).is_err());
    }
}
