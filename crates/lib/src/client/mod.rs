//! Cluster API access.
//!
//! Every pipeline stage talks to a cluster through [`ClusterClient`]. Callers
//! normally hold a [`RetryingClient`], which rate-limits and retries every call
//! against the shared limits in [`ClusterConfig`](crate::config::ClusterConfig).

pub mod api;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::resource::ResourceDescriptor;

pub use api::KubeClient;
pub use memory::MemoryCluster;
pub use retry::RetryingClient;

/// Errors returned by cluster calls, classified by API status reason.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error("already exists: {0}")]
  AlreadyExists(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("invalid: {0}")]
  Invalid(String),

  #[error("server unavailable: {0}")]
  Unavailable(String),

  #[error("cannot reach cluster: {0}")]
  Transport(String),

  #[error("failed to decode response: {0}")]
  Decode(String),

  #[error("{0}")]
  Other(String),
}

impl ClientError {
  /// Whether repeating the same call may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, ClientError::Unavailable(_) | ClientError::Transport(_))
  }

  /// Whether the cluster itself could not be reached.
  pub fn is_systemic(&self) -> bool {
    matches!(self, ClientError::Transport(_))
  }
}

/// One entry of an API group's resource list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResource {
  /// Plural REST name; subresources contain a `/`.
  pub name: String,
  pub kind: String,
  #[serde(default)]
  pub namespaced: bool,
  #[serde(default)]
  pub verbs: Vec<String>,
}

impl ApiResource {
  pub fn new(name: &str, kind: &str, namespaced: bool) -> Self {
    Self {
      name: name.to_string(),
      kind: kind.to_string(),
      namespaced,
      verbs: ["create", "delete", "get", "list", "update", "watch"]
        .iter()
        .map(|v| v.to_string())
        .collect(),
    }
  }

  pub fn is_subresource(&self) -> bool {
    self.name.contains('/')
  }

  pub fn supports(&self, verb: &str) -> bool {
    self.verbs.iter().any(|v| v == verb)
  }
}

/// Operations the pipeline needs from a cluster.
///
/// `namespace` is ignored for cluster-scoped descriptors.
#[async_trait]
pub trait ClusterClient: Send + Sync {
  /// Preferred `group/version` of every served API group, core (`v1`) first.
  async fn api_group_versions(&self) -> Result<Vec<String>, ClientError>;

  /// Resources served by one group version.
  async fn api_resources(&self, group_version: &str) -> Result<Vec<ApiResource>, ClientError>;

  /// List objects; every returned item carries `apiVersion` and `kind`.
  async fn list(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    label_selector: Option<&str>,
  ) -> Result<Vec<Value>, ClientError>;

  /// Fetch one object, `None` when it does not exist.
  async fn get(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<Option<Value>, ClientError>;

  async fn create(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError>;

  async fn update(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError>;

  async fn delete(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retryable_classification() {
    assert!(ClientError::Unavailable("503".into()).is_retryable());
    assert!(ClientError::Transport("refused".into()).is_retryable());
    assert!(!ClientError::Forbidden("rbac".into()).is_retryable());
    assert!(!ClientError::Invalid("schema".into()).is_retryable());
    assert!(ClientError::Transport("refused".into()).is_systemic());
    assert!(!ClientError::Unavailable("503".into()).is_systemic());
  }

  #[test]
  fn api_resource_subresources_and_verbs() {
    let logs = ApiResource {
      name: "pods/log".into(),
      kind: "Pod".into(),
      namespaced: true,
      verbs: vec!["get".into()],
    };
    assert!(logs.is_subresource());
    assert!(!logs.supports("list"));
    assert!(ApiResource::new("pods", "Pod", true).supports("list"));
  }
}
