//! Aggregate failure policy for an export run.

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::discover::{DiscoveryFailure, ShadowedKind};
use crate::util::hash::ContentHash;

/// Counts of one export run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportSummary {
  pub namespace: String,
  pub exported: usize,
  pub failed: usize,
  pub discovery_failures: Vec<DiscoveryFailure>,
  /// Kinds served by more than one group, exported under group-qualified names.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub shadowed: Vec<ShadowedKind>,
  /// Content checksum of `resources/<namespace>`; equal across exports of unchanged state.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub checksum: Option<ContentHash>,
}

impl ExportSummary {
  pub fn total(&self) -> usize {
    self.exported + self.failed
  }

  pub fn failure_ratio(&self) -> f64 {
    if self.total() == 0 {
      0.0
    } else {
      self.failed as f64 / self.total() as f64
    }
  }
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyViolation {
  #[error("all {0} resources failed to export")]
  AllFailed(usize),

  #[error("{failed} of {total} resources failed to export, above the allowed ratio {max_ratio}")]
  RatioExceeded { failed: usize, total: usize, max_ratio: f64 },
}

/// Decides whether accumulated per-resource failures fail the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailurePolicy {
  max_failure_ratio: f64,
}

impl Default for FailurePolicy {
  /// Partial exports succeed; only a run where nothing exported fails.
  fn default() -> Self {
    Self { max_failure_ratio: 1.0 }
  }
}

impl FailurePolicy {
  pub fn new(max_failure_ratio: f64) -> Result<Self, ConfigError> {
    if !(0.0..=1.0).contains(&max_failure_ratio) {
      return Err(ConfigError::InvalidRatio(max_failure_ratio));
    }
    Ok(Self { max_failure_ratio })
  }

  pub fn max_failure_ratio(&self) -> f64 {
    self.max_failure_ratio
  }

  pub fn evaluate(&self, summary: &ExportSummary) -> Result<(), PolicyViolation> {
    if summary.exported == 0 && summary.failed > 0 {
      return Err(PolicyViolation::AllFailed(summary.failed));
    }
    if summary.failure_ratio() > self.max_failure_ratio {
      return Err(PolicyViolation::RatioExceeded {
        failed: summary.failed,
        total: summary.total(),
        max_ratio: self.max_failure_ratio,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn summary(exported: usize, failed: usize) -> ExportSummary {
    ExportSummary {
      namespace: "demo".into(),
      exported,
      failed,
      ..Default::default()
    }
  }

  #[test]
  fn empty_namespace_is_success() {
    assert_eq!(FailurePolicy::default().evaluate(&summary(0, 0)), Ok(()));
  }

  #[test]
  fn partial_failure_is_success_by_default() {
    assert_eq!(FailurePolicy::default().evaluate(&summary(9, 1)), Ok(()));
  }

  #[test]
  fn all_failed_breaches_policy() {
    assert_eq!(
      FailurePolicy::default().evaluate(&summary(0, 3)),
      Err(PolicyViolation::AllFailed(3))
    );
  }

  #[test]
  fn ratio_threshold() {
    let policy = FailurePolicy::new(0.2).unwrap();
    assert!(policy.evaluate(&summary(8, 2)).is_ok());
    assert!(matches!(
      policy.evaluate(&summary(7, 3)),
      Err(PolicyViolation::RatioExceeded { failed: 3, total: 10, .. })
    ));
  }

  #[test]
  fn ratio_must_be_a_fraction() {
    assert_eq!(FailurePolicy::new(1.5).unwrap_err(), ConfigError::InvalidRatio(1.5));
  }
}
