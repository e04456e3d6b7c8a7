//! crates/lesson_core/src/json.rs
//!
//! Loose accessors over `serde_json::Value` for heterogeneous model output.
//! Models routinely wrap JSON in prose, mislabel types, or encode booleans
//! as strings; these helpers keep the permissive coercion rules in one
//! place instead of tightening strictness at every call site.

use serde_json::Value;

/// Maximum trim-from-the-end attempts when recovering a JSON object from
/// text with trailing commentary or minor truncation.
const MAX_DECODE_ATTEMPTS: usize = 40;

/// Extracts the first decodable JSON object from free-form text.
///
/// Locates the first `{`, then tries decoding the slice that ends at each
/// `}` scanning backward from the last one. A well-formed object decodes
/// on the first attempt, so this is a no-op for clean responses.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let candidate = &text[start..];

    let close_positions: Vec<usize> = candidate
        .char_indices()
        .filter(|(_, c)| *c == '}')
        .map(|(i, _)| i)
        .collect();

    for &end in close_positions.iter().rev().take(MAX_DECODE_ATTEMPTS) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate[..=end]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

pub fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub fn get_array<'a>(value: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    value.get(key).and_then(Value::as_array)
}

pub fn get_object<'a>(value: &'a Value, key: &str) -> Option<&'a serde_json::Map<String, Value>> {
    value.get(key).and_then(Value::as_object)
}

/// String field with trimming; missing, null and non-string all map to "".
pub fn string_or_default(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Unsigned integer, tolerating numeric strings and floats.
pub fn get_u64_loose(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Truthiness the way models express it: real booleans, the strings
/// "true"/"1"/"yes" (case-insensitive), or any nonzero number.
pub fn get_bool_loose(value: &Value, key: &str) -> bool {
    match value.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("true")
                || s.eq_ignore_ascii_case("yes")
                || s == "1"
        }
        _ => false,
    }
}
