//! Canonical hashing of rendered server params.
//!
//! Shareable templates are deduplicated by the hash of their rendered
//! form. The hash must be identical across runs and processes, so it is
//! computed over canonicalized JSON: object keys sorted, no insignificant
//! whitespace.

use serde_json::Value;
use sha2::{Digest, Sha256};
use unimcp_config::McpServerParams;

/// Stable hex digest of the rendered params.
pub fn canonical_hash(params: &McpServerParams) -> String {
    let value = serde_json::to_value(params).unwrap_or(Value::Null);
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    // 16 bytes of digest keeps connection keys readable; collisions across
    // a config's handful of rendered templates are not a realistic concern.
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
