//! On-disk resource tree shared by export, transform and apply.
//!
//! ```text
//! <root>/resources/<namespace>/<Kind>-<name>.yaml
//! <root>/resources/<namespace>/_cluster/<Kind>-<name>.yaml
//! <root>/failures/<namespace>/<Kind>-<name>.yaml
//! ```
//!
//! A kind served by more than one API group is written as `<Kind>.<group>-<name>`
//! for every group but the first.
//!
//! Files are written atomically (temp file in the same directory, then rename) so
//! an interrupted run never leaves a truncated manifest behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::consts::{CLUSTER_DIR, FAILURES_DIR, MANIFEST_EXT, RESOURCES_DIR};
use crate::resource::{Resource, ResourceId, split_api_version};
use crate::util::yaml::{from_yaml, to_stable_yaml};

#[derive(Debug, Error)]
pub enum TreeError {
  #[error("{0} is not a resource tree (no resources/ directory)")]
  NotATree(PathBuf),

  #[error("failed to create directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to remove {path}: {source}")]
  Remove {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("failed to serialize {path}: {source}")]
  Serialize {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },
}

/// Pipeline stage at which a resource failed to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
  List,
  Get,
  Sanitize,
  Serialize,
}

/// Content of a `failures/<namespace>/<Kind>-<name>.yaml` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
  pub api_version: String,
  pub kind: String,
  pub namespace: String,
  pub name: String,
  pub stage: FailureStage,
  pub error: String,
  /// Set when another group serves the same kind; the file name then carries the group.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub shadowed: bool,
}

impl FailureRecord {
  pub fn file_stem(&self) -> String {
    let id = ResourceId::new(self.kind.as_str(), Some(&self.namespace), self.name.as_str());
    if self.shadowed {
      id.qualified_file_stem(split_api_version(&self.api_version).0)
    } else {
      id.file_stem()
    }
  }
}

/// One manifest read back from a tree.
#[derive(Debug, Clone)]
pub struct TreeEntry {
  /// Path relative to the tree root, e.g. `resources/demo/ConfigMap-a.yaml`.
  pub rel_path: PathBuf,
  /// Namespace directory the file was found in.
  pub namespace: String,
  /// Whether the file lives under `_cluster/`.
  pub cluster_scoped: bool,
  pub resource: Resource,
}

/// A manifest that could not be parsed.
#[derive(Debug, Clone)]
pub struct InvalidEntry {
  pub rel_path: PathBuf,
  pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct TreeContents {
  /// Entries sorted by relative path.
  pub entries: Vec<TreeEntry>,
  pub invalid: Vec<InvalidEntry>,
}

/// A resource tree rooted at an export or transform directory.
#[derive(Debug, Clone)]
pub struct ResourceTree {
  root: PathBuf,
}

impl ResourceTree {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn resources_dir(&self, namespace: &str) -> PathBuf {
    self.root.join(RESOURCES_DIR).join(namespace)
  }

  pub fn cluster_dir(&self, namespace: &str) -> PathBuf {
    self.resources_dir(namespace).join(CLUSTER_DIR)
  }

  pub fn failures_dir(&self, namespace: &str) -> PathBuf {
    self.root.join(FAILURES_DIR).join(namespace)
  }

  fn manifest_path(&self, namespace: &str, stem: &str, cluster_scoped: bool) -> PathBuf {
    let dir = if cluster_scoped {
      self.cluster_dir(namespace)
    } else {
      self.resources_dir(namespace)
    };
    dir.join(format!("{}.{}", stem, MANIFEST_EXT))
  }

  /// Where an exported object is written.
  pub fn resource_path(&self, namespace: &str, id: &ResourceId, cluster_scoped: bool) -> PathBuf {
    self.manifest_path(namespace, &id.file_stem(), cluster_scoped)
  }

  /// Where an object of a shadowed kind is written, keeping its group in the name.
  pub fn qualified_resource_path(&self, namespace: &str, id: &ResourceId, group: &str, cluster_scoped: bool) -> PathBuf {
    self.manifest_path(namespace, &id.qualified_file_stem(group), cluster_scoped)
  }

  pub fn failure_path(&self, namespace: &str, record: &FailureRecord) -> PathBuf {
    self
      .failures_dir(namespace)
      .join(format!("{}.{}", record.file_stem(), MANIFEST_EXT))
  }

  /// Remove the `resources/` and `failures/` subtrees of one namespace.
  pub fn clear_namespace(&self, namespace: &str) -> Result<(), TreeError> {
    for dir in [self.resources_dir(namespace), self.failures_dir(namespace)] {
      match fs::remove_dir_all(&dir) {
        Ok(()) => debug!(path = %dir.display(), "cleared previous output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(TreeError::Remove { path: dir, source: e }),
      }
    }
    Ok(())
  }

  /// Clear one namespace and recreate its empty `resources/` and `failures/` directories.
  ///
  /// An export of an empty namespace is still a readable tree afterwards.
  pub fn prepare_namespace(&self, namespace: &str) -> Result<(), TreeError> {
    self.clear_namespace(namespace)?;
    for dir in [self.resources_dir(namespace), self.failures_dir(namespace)] {
      fs::create_dir_all(&dir).map_err(|e| TreeError::CreateDir { path: dir.clone(), source: e })?;
    }
    Ok(())
  }

  /// Remove the whole `resources/` and `failures/` subtrees.
  pub fn clear(&self) -> Result<(), TreeError> {
    for dir in [self.root.join(RESOURCES_DIR), self.root.join(FAILURES_DIR)] {
      match fs::remove_dir_all(&dir) {
        Ok(()) => debug!(path = %dir.display(), "cleared previous output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(TreeError::Remove { path: dir, source: e }),
      }
    }
    Ok(())
  }

  /// Write an object body as stable YAML.
  pub fn write_resource(
    &self,
    namespace: &str,
    resource: &Resource,
    cluster_scoped: bool,
  ) -> Result<PathBuf, TreeError> {
    let path = self.resource_path(namespace, &resource.id(), cluster_scoped);
    let content = to_stable_yaml(resource.body()).map_err(|e| TreeError::Serialize {
      path: path.clone(),
      source: e,
    })?;
    write_atomic(&path, content.as_bytes())?;
    Ok(path)
  }

  /// Write a body at a path relative to the root, keeping the source layout.
  pub fn write_at(&self, rel_path: &Path, body: &Value) -> Result<PathBuf, TreeError> {
    let path = self.root.join(rel_path);
    let content = to_stable_yaml(body).map_err(|e| TreeError::Serialize {
      path: path.clone(),
      source: e,
    })?;
    write_atomic(&path, content.as_bytes())?;
    Ok(path)
  }

  pub fn write_failure(&self, record: &FailureRecord) -> Result<PathBuf, TreeError> {
    let path = self.failure_path(&record.namespace, record);
    let content = serde_yaml::to_string(record).map_err(|e| TreeError::Serialize {
      path: path.clone(),
      source: e,
    })?;
    write_atomic(&path, content.as_bytes())?;
    Ok(path)
  }

  /// Namespace directories under `resources/`, sorted.
  pub fn namespaces(&self) -> Result<Vec<String>, TreeError> {
    let dir = self.root.join(RESOURCES_DIR);
    if !dir.is_dir() {
      return Err(TreeError::NotATree(self.root.clone()));
    }
    let entries = fs::read_dir(&dir).map_err(|e| TreeError::Read {
      path: dir.clone(),
      source: e,
    })?;
    let mut namespaces = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|e| TreeError::Read {
        path: dir.clone(),
        source: e,
      })?;
      if entry.path().is_dir() {
        namespaces.push(entry.file_name().to_string_lossy().into_owned());
      }
    }
    namespaces.sort();
    Ok(namespaces)
  }

  /// Read every manifest under `resources/`.
  ///
  /// Unparseable files are returned in [`TreeContents::invalid`] rather than
  /// failing the whole read.
  pub fn read_resources(&self) -> Result<TreeContents, TreeError> {
    let base = self.root.join(RESOURCES_DIR);
    if !base.is_dir() {
      return Err(TreeError::NotATree(self.root.clone()));
    }

    let mut contents = TreeContents::default();
    for entry in WalkDir::new(&base).sort_by_file_name() {
      let entry = entry.map_err(|e| TreeError::Walk {
        path: base.clone(),
        source: e,
      })?;
      let path = entry.path();
      if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXT) {
        continue;
      }
      let rel_path = path.strip_prefix(&self.root).unwrap_or(path).to_path_buf();
      let Some((namespace, cluster_scoped)) = locate(&base, path) else {
        warn!(path = %path.display(), "ignoring file outside a namespace directory");
        continue;
      };

      match read_manifest(path) {
        Ok(resource) => contents.entries.push(TreeEntry {
          rel_path,
          namespace,
          cluster_scoped,
          resource,
        }),
        Err(error) => {
          warn!(path = %rel_path.display(), error = %error, "skipping invalid manifest");
          contents.invalid.push(InvalidEntry { rel_path, error });
        }
      }
    }
    Ok(contents)
  }

  /// Read every failure record under `failures/`.
  pub fn read_failures(&self) -> Result<Vec<FailureRecord>, TreeError> {
    let base = self.root.join(FAILURES_DIR);
    if !base.is_dir() {
      return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in WalkDir::new(&base).sort_by_file_name() {
      let entry = entry.map_err(|e| TreeError::Walk {
        path: base.clone(),
        source: e,
      })?;
      if !entry.file_type().is_file() {
        continue;
      }
      let content = fs::read_to_string(entry.path()).map_err(|e| TreeError::Read {
        path: entry.path().to_path_buf(),
        source: e,
      })?;
      match serde_yaml::from_str::<FailureRecord>(&content) {
        Ok(record) => records.push(record),
        Err(e) => warn!(path = %entry.path().display(), error = %e, "skipping invalid failure record"),
      }
    }
    Ok(records)
  }
}

/// Namespace and cluster-scope flag of a manifest path under `resources/`.
fn locate(base: &Path, path: &Path) -> Option<(String, bool)> {
  let rel = path.strip_prefix(base).ok()?;
  let parts: Vec<String> = rel
    .components()
    .map(|c| c.as_os_str().to_string_lossy().into_owned())
    .collect();
  match parts.as_slice() {
    [namespace, _file] => Some((namespace.clone(), false)),
    [namespace, dir, _file] if dir == CLUSTER_DIR => Some((namespace.clone(), true)),
    _ => None,
  }
}

fn read_manifest(path: &Path) -> Result<Resource, String> {
  let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
  let body = from_yaml(&content).map_err(|e| e.to_string())?;
  Resource::from_value(body).map_err(|e| e.to_string())
}

/// Write `content` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), TreeError> {
  let dir = path.parent().unwrap_or_else(|| Path::new("."));
  fs::create_dir_all(dir).map_err(|e| TreeError::CreateDir {
    path: dir.to_path_buf(),
    source: e,
  })?;

  let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
  let temp_path = dir.join(format!(".{}.tmp", file_name));
  fs::write(&temp_path, content).map_err(|e| TreeError::Write {
    path: temp_path.clone(),
    source: e,
  })?;
  fs::rename(&temp_path, path).map_err(|e| TreeError::Write {
    path: path.to_path_buf(),
    source: e,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn config_map(name: &str) -> Resource {
    Resource::from_value(json!({
      "apiVersion": "v1",
      "kind": "ConfigMap",
      "metadata": {"name": name, "namespace": "demo"}
    }))
    .unwrap()
  }

  #[test]
  fn paths_follow_layout() {
    let tree = ResourceTree::new("/out");
    let id = ResourceId::new("ConfigMap", Some("demo"), "a");
    assert_eq!(
      tree.resource_path("demo", &id, false),
      PathBuf::from("/out/resources/demo/ConfigMap-a.yaml")
    );
    assert_eq!(
      tree.resource_path("demo", &ResourceId::new("ClusterRole", None, "view"), true),
      PathBuf::from("/out/resources/demo/_cluster/ClusterRole-view.yaml")
    );
  }

  #[test]
  fn written_resources_read_back() {
    let temp = TempDir::new().unwrap();
    let tree = ResourceTree::new(temp.path());
    tree.write_resource("demo", &config_map("b"), false).unwrap();
    tree.write_resource("demo", &config_map("a"), false).unwrap();
    let ns = Resource::from_value(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "demo"}})).unwrap();
    tree.write_resource("demo", &ns, true).unwrap();

    let contents = tree.read_resources().unwrap();
    let names: Vec<_> = contents.entries.iter().map(|e| e.resource.name().to_string()).collect();
    assert_eq!(names, vec!["a", "b", "demo"]);
    assert!(contents.entries[2].cluster_scoped);
    assert_eq!(contents.entries[0].namespace, "demo");
    assert_eq!(
      contents.entries[0].rel_path,
      PathBuf::from("resources/demo/ConfigMap-a.yaml")
    );
    assert_eq!(tree.namespaces().unwrap(), vec!["demo"]);
  }

  #[test]
  fn invalid_manifests_are_collected() {
    let temp = TempDir::new().unwrap();
    let tree = ResourceTree::new(temp.path());
    tree.write_resource("demo", &config_map("a"), false).unwrap();
    write_atomic(&tree.resources_dir("demo").join("broken.yaml"), b"kind: [unterminated").unwrap();

    let contents = tree.read_resources().unwrap();
    assert_eq!(contents.entries.len(), 1);
    assert_eq!(contents.invalid.len(), 1);
  }

  #[test]
  fn clear_namespace_removes_both_subtrees() {
    let temp = TempDir::new().unwrap();
    let tree = ResourceTree::new(temp.path());
    tree.write_resource("demo", &config_map("a"), false).unwrap();
    tree
      .write_failure(&FailureRecord {
        api_version: "v1".into(),
        kind: "Secret".into(),
        namespace: "demo".into(),
        name: "_list".into(),
        stage: FailureStage::List,
        error: "forbidden".into(),
        shadowed: false,
      })
      .unwrap();
    assert_eq!(tree.read_failures().unwrap().len(), 1);

    tree.clear_namespace("demo").unwrap();
    assert!(!tree.resources_dir("demo").exists());
    assert!(!tree.failures_dir("demo").exists());
    tree.clear_namespace("demo").unwrap();
  }

  #[test]
  fn prepared_namespace_is_an_empty_tree() {
    let temp = TempDir::new().unwrap();
    let tree = ResourceTree::new(temp.path());
    tree.write_resource("demo", &config_map("stale"), false).unwrap();

    tree.prepare_namespace("demo").unwrap();
    assert!(tree.resources_dir("demo").is_dir());
    assert!(tree.failures_dir("demo").is_dir());
    assert_eq!(tree.namespaces().unwrap(), vec!["demo"]);
    assert!(tree.read_resources().unwrap().entries.is_empty());
    assert!(tree.read_failures().unwrap().is_empty());
  }

  #[test]
  fn shadowed_failures_carry_the_group_in_the_file_name() {
    let temp = TempDir::new().unwrap();
    let tree = ResourceTree::new(temp.path());
    let record = FailureRecord {
      api_version: "certs.other.io/v1".into(),
      kind: "Certificate".into(),
      namespace: "demo".into(),
      name: "_list".into(),
      stage: FailureStage::List,
      error: "forbidden".into(),
      shadowed: true,
    };
    let path = tree.write_failure(&record).unwrap();
    assert_eq!(path, tree.failures_dir("demo").join("Certificate.certs.other.io-_list.yaml"));
    assert_eq!(tree.read_failures().unwrap(), vec![record]);
  }

  #[test]
  fn missing_tree_is_reported() {
    let temp = TempDir::new().unwrap();
    let err = ResourceTree::new(temp.path()).read_resources().unwrap_err();
    assert!(matches!(err, TreeError::NotATree(_)));
  }
}
