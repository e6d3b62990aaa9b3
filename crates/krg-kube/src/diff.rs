//! Drift detection between rendered and live objects
//!
//! A live object has drifted when some field of the rendered document is
//! missing or different on it. Fields the server adds (status, uid,
//! defaults) never count as drift.

use serde_json::Value as JsonValue;
use similar::{ChangeTag, TextDiff};

/// Whether every field of `desired` is present with the same value in `live`
pub fn is_subset(desired: &JsonValue, live: &JsonValue) -> bool {
    drifted_fields(desired, live).is_empty()
}

/// Paths of the fields of `desired` that `live` does not match
pub fn drifted_fields(desired: &JsonValue, live: &JsonValue) -> Vec<String> {
    let mut drifted = Vec::new();
    collect_drift(desired, live, String::new(), &mut drifted);
    drifted.sort();
    drifted
}

fn collect_drift(desired: &JsonValue, live: &JsonValue, path: String, out: &mut Vec<String>) {
    match (desired, live) {
        (JsonValue::Object(want), JsonValue::Object(have)) => {
            for (key, value) in want {
                let child = format!("{}.{}", path, key);
                match have.get(key) {
                    Some(current) => collect_drift(value, current, child, out),
                    None if value.is_null() => {}
                    None => out.push(child),
                }
            }
        }
        (JsonValue::Array(want), JsonValue::Array(have)) => {
            if want.len() != have.len() {
                out.push(path);
                return;
            }
            for (i, (value, current)) in want.iter().zip(have).enumerate() {
                collect_drift(value, current, format!("{}[{}]", path, i), out);
            }
        }
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            if a.as_f64() != b.as_f64() {
                out.push(path);
            }
        }
        (a, b) => {
            if a != b {
                out.push(path);
            }
        }
    }
}

/// Deep-merge `patch` into `base`
///
/// Objects merge key by key, a null in `patch` removes the key, anything
/// else replaces the value.
pub fn merge(base: &mut JsonValue, patch: &JsonValue) {
    match (base, patch) {
        (JsonValue::Object(base), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(key);
                    continue;
                }
                match base.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value)
                    }
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Unified YAML diff of `live` against `desired`, only changed lines and their neighbours
pub fn text_diff(live: &JsonValue, desired: &JsonValue) -> String {
    let old = serde_yaml::to_string(live).unwrap_or_default();
    let new = serde_yaml::to_string(desired).unwrap_or_default();
    let diff = TextDiff::from_lines(&old, &new);

    let mut output = String::new();
    for group in diff.grouped_ops(3) {
        for op in group {
            for change in diff.iter_changes(&op) {
                let prefix = match change.tag() {
                    ChangeTag::Delete => "-",
                    ChangeTag::Insert => "+",
                    ChangeTag::Equal => " ",
                };
                output.push_str(prefix);
                output.push_str(change.value().trim_end());
                output.push('\n');
            }
        }
    }
    output
}
