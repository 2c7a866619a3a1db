//! Validation for JSON-valued columns: bounded nesting depth and serialised
//! size, enforced before anything reaches the store.

use serde_json::Value;

use crate::error::{MercatoError, Result};

pub const MAX_JSON_DEPTH: usize = 10;
pub const MAX_JSON_BYTES: usize = 100 * 1024;

/// Validate a JSON value destined for a metadata/slots/config column.
pub fn validate_json_field(value: &Value, field: &str) -> Result<()> {
    let depth = depth_of(value);
    if depth > MAX_JSON_DEPTH {
        return Err(MercatoError::InputInvalid(format!(
            "{field}: JSON nesting depth {depth} exceeds maximum {MAX_JSON_DEPTH}"
        )));
    }
    let bytes = serde_json::to_vec(value)?.len();
    if bytes > MAX_JSON_BYTES {
        return Err(MercatoError::InputInvalid(format!(
            "{field}: serialised size {bytes} bytes exceeds maximum {MAX_JSON_BYTES}"
        )));
    }
    Ok(())
}

fn depth_of(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_object_passes() {
        assert!(validate_json_field(&json!({"a": 1, "b": "x"}), "metadata").is_ok());
    }

    #[test]
    fn deep_nesting_rejected() {
        let mut v = json!(1);
        for _ in 0..12 {
            v = json!({ "k": v });
        }
        assert!(validate_json_field(&v, "metadata").is_err());
    }

    #[test]
    fn oversize_rejected() {
        let big = "x".repeat(MAX_JSON_BYTES + 1);
        assert!(validate_json_field(&json!({ "blob": big }), "metadata").is_err());
    }
}
