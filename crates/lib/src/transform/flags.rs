//! Transform flags file.
//!
//! ```yaml
//! optionals:
//!   registry-replacement: registry.old.example=registry.new.example
//! disabled-plugins: [legacy]
//! priorities:
//!   my-plugin: 10
//! extras:
//!   cluster-domain: cluster.local
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::TransformError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransformFlags {
  /// Values for optional fields, keyed by field.
  #[serde(default)]
  pub optionals: BTreeMap<String, String>,
  #[serde(default)]
  pub disabled_plugins: Vec<String>,
  /// Priority overrides by plugin name.
  #[serde(default)]
  pub priorities: BTreeMap<String, i32>,
  #[serde(default)]
  pub extras: BTreeMap<String, String>,
}

impl TransformFlags {
  pub fn load(path: &Path) -> Result<Self, TransformError> {
    let content = std::fs::read_to_string(path).map_err(|e| TransformError::Flags {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    if content.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(&content).map_err(|e| TransformError::Flags {
      path: path.to_path_buf(),
      message: e.to_string(),
    })
  }
}
