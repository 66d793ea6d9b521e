//! Stable YAML encoding of resource bodies.
//!
//! Exported manifests must be byte-identical across runs over unchanged state, so
//! every mapping is written with its keys in lexical order regardless of how the
//! body was built.

use serde_json::{Map, Value};

/// Recursively rebuild `value` with object keys in lexical order.
pub fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut sorted = Map::new();
      for key in keys {
        sorted.insert(key.clone(), canonicalize(&map[key]));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}

/// Serialize a body to YAML with stable key ordering.
pub fn to_stable_yaml(value: &Value) -> Result<String, serde_yaml::Error> {
  serde_yaml::to_string(&canonicalize(value))
}

/// Parse a single YAML document into a JSON value.
pub fn from_yaml(content: &str) -> Result<Value, serde_yaml::Error> {
  serde_yaml::from_str(content)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn keys_are_written_in_order() {
    let value = json!({"zeta": 1, "alpha": {"b": 2, "a": 1}});
    let yaml = to_stable_yaml(&value).unwrap();
    assert_eq!(yaml, "alpha:\n  a: 1\n  b: 2\nzeta: 1\n");
  }

  #[test]
  fn array_order_is_preserved() {
    let value = json!({"items": ["b", "a"]});
    let yaml = to_stable_yaml(&value).unwrap();
    assert_eq!(yaml, "items:\n- b\n- a\n");
  }

  #[test]
  fn yaml_parses_back_to_same_value() {
    let value = json!({"metadata": {"name": "web", "labels": {"app": "web"}}, "spec": {"replicas": 3}});
    let parsed = from_yaml(&to_stable_yaml(&value).unwrap()).unwrap();
    assert_eq!(parsed, value);
  }
}
