//! JSON Patch (RFC 6902) over `serde_json::Value`.
//!
//! A patch is applied all-or-nothing: the document is only replaced once every
//! operation succeeded, so a failed `test` leaves it untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
  #[error("invalid JSON pointer '{0}'")]
  InvalidPointer(String),

  #[error("path '{0}' does not exist")]
  PathNotFound(String),

  #[error("invalid array index in '{0}'")]
  InvalidIndex(String),

  #[error("test failed at '{path}': expected {expected}, found {actual}")]
  TestFailed { path: String, expected: Value, actual: Value },

  #[error("cannot move '{from}' into its own child '{path}'")]
  MoveIntoChild { from: String, path: String },
}

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
  Add { path: String, value: Value },
  Remove { path: String },
  Replace { path: String, value: Value },
  Move { from: String, path: String },
  Copy { from: String, path: String },
  Test { path: String, value: Value },
}

impl PatchOp {
  pub fn add(path: impl Into<String>, value: Value) -> Self {
    Self::Add { path: path.into(), value }
  }

  pub fn remove(path: impl Into<String>) -> Self {
    Self::Remove { path: path.into() }
  }

  pub fn replace(path: impl Into<String>, value: Value) -> Self {
    Self::Replace { path: path.into(), value }
  }

  pub fn test(path: impl Into<String>, value: Value) -> Self {
    Self::Test { path: path.into(), value }
  }

  pub fn path(&self) -> &str {
    match self {
      Self::Add { path, .. }
      | Self::Remove { path }
      | Self::Replace { path, .. }
      | Self::Move { path, .. }
      | Self::Copy { path, .. }
      | Self::Test { path, .. } => path,
    }
  }
}

/// Escape one reference token (`~` and `/`).
pub fn escape(token: &str) -> String {
  token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
  token.replace("~1", "/").replace("~0", "~")
}

/// Split a pointer into its parent pointer and final unescaped token.
fn split_pointer(path: &str) -> Result<(&str, String), PatchError> {
  if !path.starts_with('/') {
    return Err(PatchError::InvalidPointer(path.to_string()));
  }
  let index = path.rfind('/').unwrap_or(0);
  Ok((&path[..index], unescape(&path[index + 1..])))
}

fn parse_index(token: &str, len: usize, path: &str, allow_end: bool) -> Result<usize, PatchError> {
  if token == "-" && allow_end {
    return Ok(len);
  }
  if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
    return Err(PatchError::InvalidIndex(path.to_string()));
  }
  let index: usize = token.parse().map_err(|_| PatchError::InvalidIndex(path.to_string()))?;
  let limit = if allow_end { len } else { len.saturating_sub(1) };
  if (allow_end && index > limit) || (!allow_end && (len == 0 || index > limit)) {
    return Err(PatchError::PathNotFound(path.to_string()));
  }
  Ok(index)
}

fn get<'a>(doc: &'a Value, path: &str) -> Result<&'a Value, PatchError> {
  if !path.is_empty() && !path.starts_with('/') {
    return Err(PatchError::InvalidPointer(path.to_string()));
  }
  doc
    .pointer(path)
    .ok_or_else(|| PatchError::PathNotFound(path.to_string()))
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
  if path.is_empty() {
    *doc = value;
    return Ok(());
  }
  let (parent, token) = split_pointer(path)?;
  let target = doc
    .pointer_mut(parent)
    .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
  match target {
    Value::Object(map) => {
      map.insert(token, value);
      Ok(())
    }
    Value::Array(items) => {
      let index = parse_index(&token, items.len(), path, true)?;
      items.insert(index, value);
      Ok(())
    }
    _ => Err(PatchError::PathNotFound(path.to_string())),
  }
}

fn remove(doc: &mut Value, path: &str) -> Result<Value, PatchError> {
  if path.is_empty() {
    return Ok(std::mem::take(doc));
  }
  let (parent, token) = split_pointer(path)?;
  let target = doc
    .pointer_mut(parent)
    .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
  match target {
    Value::Object(map) => map
      .remove(&token)
      .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
    Value::Array(items) => {
      let index = parse_index(&token, items.len(), path, false)?;
      Ok(items.remove(index))
    }
    _ => Err(PatchError::PathNotFound(path.to_string())),
  }
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
  match op {
    PatchOp::Add { path, value } => add(doc, path, value.clone()),
    PatchOp::Remove { path } => remove(doc, path).map(|_| ()),
    PatchOp::Replace { path, value } => {
      let slot = if path.is_empty() {
        Some(doc)
      } else {
        split_pointer(path)?;
        doc.pointer_mut(path)
      };
      match slot {
        Some(slot) => {
          *slot = value.clone();
          Ok(())
        }
        None => Err(PatchError::PathNotFound(path.clone())),
      }
    }
    PatchOp::Move { from, path } => {
      if from == path {
        return get(doc, from).map(|_| ());
      }
      if path.starts_with(&format!("{}/", from)) {
        return Err(PatchError::MoveIntoChild {
          from: from.clone(),
          path: path.clone(),
        });
      }
      let value = remove(doc, from)?;
      add(doc, path, value)
    }
    PatchOp::Copy { from, path } => {
      let value = get(doc, from)?.clone();
      add(doc, path, value)
    }
    PatchOp::Test { path, value } => {
      let actual = get(doc, path)?;
      if actual == value {
        Ok(())
      } else {
        Err(PatchError::TestFailed {
          path: path.clone(),
          expected: value.clone(),
          actual: actual.clone(),
        })
      }
    }
  }
}

/// Apply `ops` in order. On error `doc` is left unchanged.
pub fn apply_patch(doc: &mut Value, ops: &[PatchOp]) -> Result<(), PatchError> {
  let mut working = doc.clone();
  for op in ops {
    apply_op(&mut working, op)?;
  }
  *doc = working;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn doc() -> Value {
    json!({
      "metadata": {"name": "web", "annotations": {"a/b": "1"}},
      "spec": {"ports": [{"port": 80}, {"port": 443}]}
    })
  }

  #[test]
  fn add_replace_remove() {
    let mut d = doc();
    apply_patch(
      &mut d,
      &[
        PatchOp::add("/metadata/labels", json!({"app": "web"})),
        PatchOp::replace("/spec/ports/0/port", json!(8080)),
        PatchOp::remove(format!("/metadata/annotations/{}", escape("a/b"))),
        PatchOp::add("/spec/ports/-", json!({"port": 9090})),
      ],
    )
    .unwrap();
    assert_eq!(d["metadata"]["labels"]["app"], "web");
    assert_eq!(d["spec"]["ports"][0]["port"], 8080);
    assert_eq!(d["spec"]["ports"][2]["port"], 9090);
    assert!(d["metadata"]["annotations"].as_object().unwrap().is_empty());
  }

  #[test]
  fn failed_test_leaves_document_untouched() {
    let mut d = doc();
    let err = apply_patch(
      &mut d,
      &[
        PatchOp::replace("/metadata/name", json!("api")),
        PatchOp::test("/spec/ports/0/port", json!(81)),
      ],
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::TestFailed { .. }));
    assert_eq!(d, doc());
  }

  #[test]
  fn move_and_copy() {
    let mut d = doc();
    apply_patch(
      &mut d,
      &[
        PatchOp::Copy {
          from: "/metadata/name".into(),
          path: "/metadata/labels".into(),
        },
        PatchOp::Move {
          from: "/spec/ports/1".into(),
          path: "/spec/ports/0".into(),
        },
      ],
    )
    .unwrap();
    assert_eq!(d["metadata"]["labels"], "web");
    assert_eq!(d["spec"]["ports"][0]["port"], 443);

    let err = apply_patch(
      &mut d,
      &[PatchOp::Move {
        from: "/spec".into(),
        path: "/spec/inner".into(),
      }],
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::MoveIntoChild { .. }));
  }

  #[test]
  fn missing_paths_are_errors() {
    let mut d = doc();
    assert!(matches!(
      apply_patch(&mut d, &[PatchOp::remove("/status")]),
      Err(PatchError::PathNotFound(_))
    ));
    assert!(matches!(
      apply_patch(&mut d, &[PatchOp::replace("/spec/ports/5", json!(1))]),
      Err(PatchError::PathNotFound(_))
    ));
    assert!(matches!(
      apply_patch(&mut d, &[PatchOp::add("/missing/child", json!(1))]),
      Err(PatchError::PathNotFound(_))
    ));
    assert!(matches!(
      apply_patch(&mut d, &[PatchOp::add("relative", json!(1))]),
      Err(PatchError::InvalidPointer(_))
    ));
  }

  #[test]
  fn ops_deserialize_from_rfc_form() {
    let ops: Vec<PatchOp> = serde_json::from_value(json!([
      {"op": "add", "path": "/a", "value": 1},
      {"op": "move", "from": "/a", "path": "/b"}
    ]))
    .unwrap();
    assert_eq!(ops[0], PatchOp::add("/a", json!(1)));
    assert_eq!(ops[1].path(), "/b");
  }
}
