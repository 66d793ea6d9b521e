//! Change detection between a desired manifest and the live object.

use serde_json::Value;

/// Whether everything `desired` specifies is already present in `live`.
///
/// Objects compare key by key, ignoring keys only `live` has (defaults and
/// server-populated fields). Arrays must have the same length and compare
/// element-wise.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
  match (desired, live) {
    (Value::Object(want), Value::Object(have)) => want
      .iter()
      .all(|(key, value)| have.get(key).is_some_and(|live_value| is_subset(value, live_value))),
    (Value::Array(want), Value::Array(have)) => {
      want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
    }
    (want, have) => want == have,
  }
}
