//! Per-resource transform report, written as `report.yaml`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::tree::{TreeError, write_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginFailure {
  pub plugin: String,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
  /// Path relative to the tree root.
  pub path: String,
  pub kind: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub namespace: Option<String>,
  pub name: String,
  /// Plugins whose patches were applied, in order.
  #[serde(default)]
  pub plugins: Vec<String>,
  #[serde(default)]
  pub whiteout: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub whiteout_by: Option<String>,
  /// Optional field groups offered for this resource but not enabled.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub optionals_available: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub errors: Vec<PluginFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
  pub resources: usize,
  pub transformed: usize,
  pub whiteouts: usize,
  pub plugin_errors: usize,
  /// Manifests in the input tree that could not be parsed.
  pub invalid: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformReport {
  pub summary: ReportSummary,
  /// Enabled optional field groups.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub optionals: Vec<String>,
  pub resources: Vec<ResourceReport>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub invalid: Vec<PluginFailure>,
}

impl TransformReport {
  /// Sort entries by path and recompute the summary.
  pub fn finalize(&mut self) {
    self.resources.sort_by(|a, b| a.path.cmp(&b.path));
    self.summary = ReportSummary {
      resources: self.resources.len(),
      transformed: self.resources.iter().filter(|r| !r.whiteout).count(),
      whiteouts: self.resources.iter().filter(|r| r.whiteout).count(),
      plugin_errors: self.resources.iter().map(|r| r.errors.len()).sum(),
      invalid: self.invalid.len(),
    };
  }

  pub fn has_errors(&self) -> bool {
    self.summary.plugin_errors > 0 || self.summary.invalid > 0
  }

  pub fn write(&self, path: &Path) -> Result<(), TreeError> {
    let content = serde_yaml::to_string(self).map_err(|e| TreeError::Serialize {
      path: path.to_path_buf(),
      source: e,
    })?;
    write_atomic(path, content.as_bytes())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn summary_counts_entries() {
    let mut report = TransformReport {
      resources: vec![
        ResourceReport {
          path: "resources/demo/Pod-b.yaml".into(),
          whiteout: true,
          whiteout_by: Some("kubernetes".into()),
          ..Default::default()
        },
        ResourceReport {
          path: "resources/demo/ConfigMap-a.yaml".into(),
          plugins: vec!["kubernetes".into()],
          errors: vec![PluginFailure {
            plugin: "labeller".into(),
            error: "test failed".into(),
          }],
          ..Default::default()
        },
      ],
      ..Default::default()
    };
    report.finalize();

    assert_eq!(report.resources[0].path, "resources/demo/ConfigMap-a.yaml");
    assert_eq!(report.summary.resources, 2);
    assert_eq!(report.summary.whiteouts, 1);
    assert_eq!(report.summary.transformed, 1);
    assert_eq!(report.summary.plugin_errors, 1);
    assert!(report.has_errors());
  }
}
