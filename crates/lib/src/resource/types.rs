//! Resource type identity.

use serde::{Deserialize, Serialize};

/// Whether instances of a kind live inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
  Namespaced,
  Cluster,
}

/// Identifies a resource type on a cluster.
///
/// `resource` is the plural REST name (`deployments`) used to build API paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceDescriptor {
  pub group: String,
  pub version: String,
  pub kind: String,
  pub resource: String,
  pub scope: Scope,
}

impl ResourceDescriptor {
  pub fn new(
    group: impl Into<String>,
    version: impl Into<String>,
    kind: impl Into<String>,
    resource: impl Into<String>,
    scope: Scope,
  ) -> Self {
    Self {
      group: group.into(),
      version: version.into(),
      kind: kind.into(),
      resource: resource.into(),
      scope,
    }
  }

  /// `apiVersion` as it appears in manifests (`v1`, `apps/v1`).
  pub fn api_version(&self) -> String {
    if self.group.is_empty() {
      self.version.clone()
    } else {
      format!("{}/{}", self.group, self.version)
    }
  }

  pub fn is_namespaced(&self) -> bool {
    self.scope == Scope::Namespaced
  }

  /// `plural.group` form, `plural` for the core group.
  pub fn group_resource(&self) -> String {
    if self.group.is_empty() {
      self.resource.clone()
    } else {
      format!("{}.{}", self.resource, self.group)
    }
  }
}

impl std::fmt::Display for ResourceDescriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.group.is_empty() {
      write!(f, "{}/{}", self.version, self.kind)
    } else {
      write!(f, "{}/{}/{}", self.group, self.version, self.kind)
    }
  }
}

/// Split an `apiVersion` into `(group, version)`.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
  match api_version.split_once('/') {
    Some((group, version)) => (group, version),
    None => ("", api_version),
  }
}

/// Identity of one object: kind + namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
  pub kind: String,
  pub namespace: Option<String>,
  pub name: String,
}

impl ResourceId {
  pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      namespace: namespace.map(str::to_string),
      name: name.into(),
    }
  }

  /// File stem inside a namespace directory: `<Kind>-<name>`.
  pub fn file_stem(&self) -> String {
    format!("{}-{}", self.kind, self.name)
  }

  /// File stem for a kind whose name another group already uses: `<Kind>.<group>-<name>`.
  pub fn qualified_file_stem(&self, group: &str) -> String {
    if group.is_empty() {
      return self.file_stem();
    }
    format!("{}.{}-{}", self.kind, group, self.name)
  }
}

impl std::fmt::Display for ResourceId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.namespace {
      Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
      None => write!(f, "{}/{}", self.kind, self.name),
    }
  }
}
