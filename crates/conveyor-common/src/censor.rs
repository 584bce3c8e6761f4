//! Redaction of sensitive job options
//!
//! Job options routinely carry database passwords and object-store secrets.
//! Before options reach a log line they are copied through [`censor_keys`],
//! which walks nested maps depth-first and replaces the value of every
//! matching key. The caller's value is never modified.

use serde_json::{Map, Value};

/// Replacement written in place of a censored value.
pub const CENSORED: &str = "***censored***";

/// Keys censored when no explicit list is configured.
pub const DEFAULT_CENSORED_KEYS: &[&str] = &["password", "secret_access_key"];

/// Return a copy of `value` with every key in `keys` censored.
///
/// A key that holds a nested map is descended into rather than replaced,
/// so `{"db": {"password": ..}}` keeps its shape. Arrays are walked too,
/// since option lists may contain maps.
pub fn censor_keys<S: AsRef<str>>(value: &Value, keys: &[S]) -> Value {
    censor_with(value, keys, CENSORED)
}

/// Same as [`censor_keys`] with a custom replacement string.
pub fn censor_with<S: AsRef<str>>(value: &Value, keys: &[S], replacement: &str) -> Value {
    match value {
        Value::Object(map) => {
            let mut censored = Map::with_capacity(map.len());
            for (key, inner) in map {
                let redacted = match inner {
                    Value::Object(_) | Value::Array(_) => censor_with(inner, keys, replacement),
                    _ if keys.iter().any(|k| k.as_ref() == key) => {
                        Value::String(replacement.to_string())
                    },
                    _ => inner.clone(),
                };
                censored.insert(key.clone(), redacted);
            }
            Value::Object(censored)
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| censor_with(item, keys, replacement))
                .collect(),
        ),
        other => other.clone(),
    }
}
