//! Accessors for opaque config documents.
//!
//! Session definitions, routing tables and computation definitions arrive
//! from the Coordinator as structured JSON documents the agent mostly treats
//! as opaque. These helpers read individual fields with per-field validation:
//! a wrong-typed value logs a warning and falls back to the caller's default
//! rather than aborting the operation.

use serde_json::Value;

static NULL: Value = Value::Null;

/// Returns the named member, or `Null` if absent.
pub fn member<'a>(obj: &'a Value, key: &str) -> &'a Value {
    obj.get(key).unwrap_or(&NULL)
}

/// Returns the named member if it is an object, warning otherwise.
pub fn object<'a>(obj: &'a Value, key: &str) -> &'a Value {
    let v = member(obj, key);
    if v.is_null() || v.is_object() {
        v
    } else {
        tracing::warn!("config item '{}' should be an object", key);
        &NULL
    }
}

/// Reads a string field, falling back to `default` on absence or type
/// mismatch.
pub fn get_str(obj: &Value, key: &str, default: &str) -> String {
    match member(obj, key) {
        Value::String(s) => s.clone(),
        Value::Null => default.to_string(),
        other => {
            tracing::warn!("config item '{}' should be a string, got {}", key, other);
            default.to_string()
        }
    }
}

/// Reads a boolean field, falling back to `default` on absence or type
/// mismatch.
pub fn get_bool(obj: &Value, key: &str, default: bool) -> bool {
    match member(obj, key) {
        Value::Bool(b) => *b,
        Value::Null => default,
        other => {
            tracing::warn!("config item '{}' should be a bool, got {}", key, other);
            default
        }
    }
}

/// Reads an integer field, falling back to `default` on absence or type
/// mismatch.
pub fn get_i64(obj: &Value, key: &str, default: i64) -> i64 {
    match member(obj, key) {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| {
            tracing::warn!("config item '{}' is not an integer", key);
            default
        }),
        Value::Null => default,
        other => {
            tracing::warn!("config item '{}' should be a number, got {}", key, other);
            default
        }
    }
}

/// Reads a non-negative numeric field (integral or float), falling back to
/// `default` on absence, type mismatch, or a negative value.
pub fn get_non_neg(obj: &Value, key: &str, default: f64) -> f64 {
    match member(obj, key) {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f >= 0.0 => f,
            _ => {
                tracing::warn!("config item '{}' should be non-negative", key);
                default
            }
        },
        Value::Null => default,
        other => {
            tracing::warn!("config item '{}' should be a number, got {}", key, other);
            default
        }
    }
}

/// Reads an unsigned field, falling back to `default` on absence or type
/// mismatch.
pub fn get_u64(obj: &Value, key: &str, default: u64) -> u64 {
    match member(obj, key) {
        Value::Number(n) => n.as_u64().unwrap_or_else(|| {
            tracing::warn!("config item '{}' is not an unsigned integer", key);
            default
        }),
        Value::Null => default,
        other => {
            tracing::warn!("config item '{}' should be a number, got {}", key, other);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_str_present_and_default() {
        let obj = json!({"name": "render", "count": 3});
        assert_eq!(get_str(&obj, "name", "x"), "render");
        assert_eq!(get_str(&obj, "missing", "fallback"), "fallback");
        // wrong type prefers the default
        assert_eq!(get_str(&obj, "count", "fallback"), "fallback");
    }

    #[test]
    fn test_get_bool() {
        let obj = json!({"entry": true, "name": "x"});
        assert!(get_bool(&obj, "entry", false));
        assert!(!get_bool(&obj, "missing", false));
        assert!(get_bool(&obj, "name", true));
    }

    #[test]
    fn test_get_non_neg_rejects_negative() {
        let obj = json!({"cores": -2, "memoryMB": 2048.5});
        assert_eq!(get_non_neg(&obj, "cores", 1.0), 1.0);
        assert_eq!(get_non_neg(&obj, "memoryMB", 0.0), 2048.5);
    }

    #[test]
    fn test_object_accessor() {
        let obj = json!({"requirements": {"cores": 2}, "name": "x"});
        assert!(object(&obj, "requirements").is_object());
        assert!(object(&obj, "name").is_null());
        assert!(object(&obj, "missing").is_null());
    }

    #[test]
    fn test_member_chains() {
        let obj = json!({"a": {"b": {"c": 7}}});
        let c = member(member(member(&obj, "a"), "b"), "c");
        assert_eq!(c.as_i64(), Some(7));
        assert!(member(member(&obj, "a"), "zzz").is_null());
    }
}
