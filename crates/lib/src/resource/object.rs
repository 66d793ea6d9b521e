//! Typed view over an arbitrary object body.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{ResourceId, split_api_version};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
  #[error("object is not a mapping")]
  NotAnObject,

  #[error("object has no {0}")]
  MissingField(&'static str),
}

/// One object as read from a cluster or a manifest file.
///
/// Construction validates that `apiVersion`, `kind` and `metadata.name` are
/// present, so the accessors below never fail.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
  body: Value,
}

impl Resource {
  pub fn from_value(body: Value) -> Result<Self, ResourceError> {
    let object = body.as_object().ok_or(ResourceError::NotAnObject)?;
    if !object.get("apiVersion").is_some_and(Value::is_string) {
      return Err(ResourceError::MissingField("apiVersion"));
    }
    if !object.get("kind").is_some_and(Value::is_string) {
      return Err(ResourceError::MissingField("kind"));
    }
    if !body.pointer("/metadata/name").is_some_and(Value::is_string) {
      return Err(ResourceError::MissingField("metadata.name"));
    }
    Ok(Self { body })
  }

  pub fn body(&self) -> &Value {
    &self.body
  }

  pub fn into_body(self) -> Value {
    self.body
  }

  /// Mutable access to the body for in-place rewrites.
  ///
  /// Callers must keep `apiVersion`, `kind` and `metadata.name` intact.
  pub fn body_mut(&mut self) -> &mut Value {
    &mut self.body
  }

  pub fn api_version(&self) -> &str {
    self.body["apiVersion"].as_str().unwrap_or_default()
  }

  pub fn group(&self) -> &str {
    split_api_version(self.api_version()).0
  }

  pub fn kind(&self) -> &str {
    self.body["kind"].as_str().unwrap_or_default()
  }

  pub fn name(&self) -> &str {
    self.body["metadata"]["name"].as_str().unwrap_or_default()
  }

  pub fn namespace(&self) -> Option<&str> {
    self.body["metadata"]["namespace"].as_str().filter(|ns| !ns.is_empty())
  }

  pub fn id(&self) -> ResourceId {
    ResourceId::new(self.kind(), self.namespace(), self.name())
  }

  pub fn labels(&self) -> BTreeMap<String, String> {
    string_map(&self.body["metadata"]["labels"])
  }

  pub fn annotations(&self) -> BTreeMap<String, String> {
    string_map(&self.body["metadata"]["annotations"])
  }

  pub fn owner_references(&self) -> &[Value] {
    self.body["metadata"]["ownerReferences"]
      .as_array()
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  pub fn has_controller_owner(&self) -> bool {
    self
      .owner_references()
      .iter()
      .any(|owner| owner["controller"].as_bool().unwrap_or(false))
  }

  /// Set `metadata.namespace`, creating `metadata` if needed.
  pub fn set_namespace(&mut self, namespace: &str) {
    metadata_mut(&mut self.body).insert("namespace".into(), Value::String(namespace.to_string()));
  }

  pub fn clear_namespace(&mut self) {
    metadata_mut(&mut self.body).remove("namespace");
  }

  pub fn set_name(&mut self, name: &str) {
    metadata_mut(&mut self.body).insert("name".into(), Value::String(name.to_string()));
  }
}

fn metadata_mut(body: &mut Value) -> &mut Map<String, Value> {
  let object = match body {
    Value::Object(object) => object,
    _ => unreachable!("Resource bodies are validated as objects"),
  };
  let metadata = object.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
  if !metadata.is_object() {
    *metadata = Value::Object(Map::new());
  }
  match metadata {
    Value::Object(map) => map,
    _ => unreachable!(),
  }
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
  value
    .as_object()
    .map(|map| {
      map
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
    })
    .unwrap_or_default()
}

/// Evaluate an equality-based label selector (`a=b,c!=d,e,!f`) against labels.
///
/// An empty selector matches everything.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
  selector
    .split(',')
    .map(str::trim)
    .filter(|term| !term.is_empty())
    .all(|term| {
      if let Some((key, value)) = term.split_once("!=") {
        labels.get(key.trim()).map(String::as_str) != Some(value.trim())
      } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        labels.get(key.trim()).map(String::as_str) == Some(value.trim())
      } else if let Some(key) = term.strip_prefix('!') {
        !labels.contains_key(key.trim())
      } else {
        labels.contains_key(term)
      }
    })
}
