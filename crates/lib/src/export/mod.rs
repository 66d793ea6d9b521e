//! Namespace export.
//!
//! Lists every selected kind in a namespace, sanitizes each instance into a
//! redeployable manifest and writes it under `resources/<namespace>/`. Per-kind
//! and per-object failures are written under `failures/<namespace>/` and the run
//! continues; only an unreachable cluster or an unwritable output directory
//! aborts it.

pub mod policy;
pub mod sanitize;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ClusterClient};
use crate::consts::{LIST_FAILURE_NAME, MAX_WORKERS};
use crate::discover::{self, Discovery, DiscoveryError, ResourceFilter};
use crate::resource::{Resource, ResourceDescriptor, Scope};
use crate::tree::{FailureRecord, FailureStage, ResourceTree, TreeError, write_atomic};
use crate::util::hash::hash_directory;
use crate::util::yaml::to_stable_yaml;

pub use policy::{ExportSummary, FailurePolicy, PolicyViolation};
pub use sanitize::{OwnerRefPolicy, sanitize};

#[derive(Debug, Error)]
pub enum ExportError {
  #[error("namespace {0} not found on the source cluster")]
  NamespaceNotFound(String),

  #[error(transparent)]
  Discovery(#[from] DiscoveryError),

  #[error("source cluster unreachable: {0}")]
  Unreachable(#[source] ClientError),

  #[error("cannot write export directory: {0}")]
  Tree(#[from] TreeError),
}

/// What to export and how.
#[derive(Debug, Clone)]
pub struct ExportOptions {
  pub namespace: String,
  pub filter: ResourceFilter,
  /// Also export the namespace object and the cluster-scoped RBAC and CRDs it depends on.
  pub cluster_scoped_rbac: bool,
  pub owner_refs: OwnerRefPolicy,
  pub workers: usize,
}

impl ExportOptions {
  pub fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      filter: ResourceFilter::default(),
      cluster_scoped_rbac: false,
      owner_refs: OwnerRefPolicy::default(),
      workers: MAX_WORKERS,
    }
  }
}

#[derive(Default)]
struct Counters {
  exported: AtomicUsize,
  failed: AtomicUsize,
}

/// Shared state of one export run.
struct Exporter {
  client: Arc<dyn ClusterClient>,
  tree: ResourceTree,
  namespace: String,
  owner_refs: OwnerRefPolicy,
  cluster_kinds: BTreeSet<String>,
  /// (group, kind) pairs written under group-qualified file names.
  shadowed: BTreeSet<(String, String)>,
  counters: Counters,
}

impl Exporter {
  fn is_shadowed(&self, descriptor: &ResourceDescriptor) -> bool {
    self
      .shadowed
      .contains(&(descriptor.group.clone(), descriptor.kind.clone()))
  }

  fn record_failure(
    &self,
    descriptor: &ResourceDescriptor,
    name: &str,
    stage: FailureStage,
    error: String,
  ) -> Result<(), TreeError> {
    warn!(kind = %descriptor.kind, namespace = %self.namespace, name, ?stage, error = %error, "export failed");
    let record = FailureRecord {
      api_version: descriptor.api_version(),
      kind: descriptor.kind.clone(),
      namespace: self.namespace.clone(),
      name: name.to_string(),
      stage,
      error,
      shadowed: self.is_shadowed(descriptor),
    };
    self.tree.write_failure(&record)?;
    self.counters.failed.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  /// Sanitize and write one live object. Returns whether it was exported.
  fn write_object(&self, descriptor: &ResourceDescriptor, item: Value, cluster_scoped: bool) -> Result<bool, TreeError> {
    let fallback_name = item["metadata"]["name"]
      .as_str()
      .or_else(|| item["metadata"]["generateName"].as_str())
      .unwrap_or("_unnamed")
      .to_string();

    let resource = match Resource::from_value(item) {
      Ok(resource) => sanitize(resource, self.owner_refs, &self.cluster_kinds),
      Err(e) => {
        self.record_failure(descriptor, &fallback_name, FailureStage::Sanitize, e.to_string())?;
        return Ok(false);
      }
    };

    let content = match to_stable_yaml(resource.body()) {
      Ok(content) => content,
      Err(e) => {
        self.record_failure(descriptor, resource.name(), FailureStage::Serialize, e.to_string())?;
        return Ok(false);
      }
    };

    let path = if self.is_shadowed(descriptor) {
      self
        .tree
        .qualified_resource_path(&self.namespace, &resource.id(), &descriptor.group, cluster_scoped)
    } else {
      self.tree.resource_path(&self.namespace, &resource.id(), cluster_scoped)
    };
    write_atomic(&path, content.as_bytes())?;
    debug!(object = %resource.id(), path = %path.display(), "exported");
    self.counters.exported.fetch_add(1, Ordering::Relaxed);
    Ok(true)
  }

  /// Export every instance of one namespaced kind. Returns the number written.
  async fn export_kind(&self, descriptor: &ResourceDescriptor, selector: Option<&str>) -> Result<usize, ExportError> {
    let items = match self.client.list(descriptor, Some(&self.namespace), selector).await {
      Ok(items) => items,
      Err(e) if e.is_systemic() => return Err(ExportError::Unreachable(e)),
      Err(e) => {
        self.record_failure(descriptor, LIST_FAILURE_NAME, FailureStage::List, e.to_string())?;
        return Ok(0);
      }
    };

    let mut written = 0;
    for item in items {
      if self.write_object(descriptor, item, false)? {
        written += 1;
      }
    }
    debug!(kind = %descriptor.kind, written, "kind exported");
    Ok(written)
  }

  /// Fetch one cluster-scoped object into `_cluster/`.
  async fn export_cluster_object(&self, descriptor: &ResourceDescriptor, name: &str) -> Result<(), ExportError> {
    match self.client.get(descriptor, None, name).await {
      Ok(Some(item)) => {
        self.write_object(descriptor, item, true)?;
      }
      Ok(None) => debug!(kind = %descriptor.kind, name, "referenced cluster object does not exist"),
      Err(e) if e.is_systemic() => return Err(ExportError::Unreachable(e)),
      Err(e) => self.record_failure(descriptor, name, FailureStage::Get, e.to_string())?,
    }
    Ok(())
  }

  /// Export the namespace object and the cluster-scoped objects it depends on.
  async fn export_cluster_scoped(&self, discovery: &Discovery, exported_kinds: &[ResourceDescriptor]) -> Result<(), ExportError> {
    if let Some(namespaces) = discovery.served_kind("Namespace") {
      self.export_cluster_object(namespaces, &self.namespace.clone()).await?;
    }

    let mut cluster_roles = BTreeSet::new();
    if let Some(bindings) = discovery.served_kind("ClusterRoleBinding") {
      match self.client.list(bindings, None, None).await {
        Ok(items) => {
          for binding in items {
            if !binds_namespace_account(&binding, &self.namespace) {
              continue;
            }
            if binding["roleRef"]["kind"].as_str() == Some("ClusterRole")
              && let Some(role) = binding["roleRef"]["name"].as_str()
            {
              cluster_roles.insert(role.to_string());
            }
            self.write_object(bindings, binding, true)?;
          }
        }
        Err(e) if e.is_systemic() => return Err(ExportError::Unreachable(e)),
        Err(e) => self.record_failure(bindings, LIST_FAILURE_NAME, FailureStage::List, e.to_string())?,
      }
    }

    if let Some(roles) = discovery.served_kind("ClusterRole") {
      for role in &cluster_roles {
        self.export_cluster_object(roles, role).await?;
      }
    }

    if let Some(crds) = discovery.served_kind("CustomResourceDefinition") {
      for descriptor in exported_kinds.iter().filter(|d| is_custom_group(&d.group)) {
        self.export_cluster_object(crds, &descriptor.group_resource()).await?;
      }
    }
    Ok(())
  }
}

fn binds_namespace_account(binding: &Value, namespace: &str) -> bool {
  binding["subjects"].as_array().is_some_and(|subjects| {
    subjects
      .iter()
      .any(|s| s["kind"].as_str() == Some("ServiceAccount") && s["namespace"].as_str() == Some(namespace))
  })
}

/// Groups that can only come from a CRD.
fn is_custom_group(group: &str) -> bool {
  group.contains('.') && !group.ends_with(".k8s.io") && !group.ends_with(".kubernetes.io")
}

/// Shadowed kinds that are distinct objects rather than another view of a built-in.
///
/// Two CRD groups may both define `Certificate`; `events.k8s.io` Events are the core Events again.
fn shadowed_custom_kinds(discovery: &Discovery) -> impl Iterator<Item = &ResourceDescriptor> {
  discovery
    .shadowed
    .iter()
    .map(|s| &s.descriptor)
    .filter(|d| is_custom_group(&d.group))
}

fn namespace_descriptor() -> ResourceDescriptor {
  ResourceDescriptor::new("", "v1", "Namespace", "namespaces", Scope::Cluster)
}

/// Export one namespace into `tree`.
pub async fn export(
  client: Arc<dyn ClusterClient>,
  tree: &ResourceTree,
  options: &ExportOptions,
) -> Result<ExportSummary, ExportError> {
  let namespace = options.namespace.clone();

  match client.get(&namespace_descriptor(), None, &namespace).await {
    Ok(Some(_)) => {}
    Ok(None) => return Err(ExportError::NamespaceNotFound(namespace)),
    Err(e) if e.is_systemic() => return Err(ExportError::Unreachable(e)),
    Err(e) => warn!(namespace = %namespace, error = %e, "cannot verify namespace, continuing"),
  }

  let discovery = discover::discover(client.clone(), &options.filter, options.workers).await?;
  tree.prepare_namespace(&namespace)?;

  let exporter = Arc::new(Exporter {
    client,
    tree: tree.clone(),
    namespace: namespace.clone(),
    owner_refs: options.owner_refs,
    cluster_kinds: discovery.cluster_kinds(),
    shadowed: shadowed_custom_kinds(&discovery)
      .map(|d| (d.group.clone(), d.kind.clone()))
      .collect(),
    counters: Counters::default(),
  });

  let kinds = discovery
    .descriptors
    .iter()
    .chain(shadowed_custom_kinds(&discovery))
    .filter(|d| d.is_namespaced())
    .cloned();

  let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
  let mut join_set = JoinSet::new();
  for descriptor in kinds {
    let exporter = exporter.clone();
    let semaphore = semaphore.clone();
    let selector = options.filter.label_selector.clone();
    join_set.spawn(async move {
      let Ok(_permit) = semaphore.acquire().await else {
        return (descriptor, Ok(0));
      };
      let result = exporter.export_kind(&descriptor, selector.as_deref()).await;
      (descriptor, result)
    });
  }

  let mut written_per_kind = BTreeMap::new();
  let mut fatal = None;
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok((descriptor, Ok(written))) => {
        written_per_kind.insert(descriptor, written);
      }
      Ok((descriptor, Err(e))) => {
        error!(kind = %descriptor.kind, error = %e, "export aborted");
        if fatal.is_none() {
          fatal = Some(e);
          join_set.abort_all();
        }
      }
      Err(e) if e.is_cancelled() => {}
      Err(e) => error!(error = %e, "export task panicked"),
    }
  }
  if let Some(e) = fatal {
    return Err(e);
  }

  if options.cluster_scoped_rbac {
    let exported_kinds: Vec<_> = written_per_kind
      .into_iter()
      .filter(|(_, written)| *written > 0)
      .map(|(descriptor, _)| descriptor)
      .collect();
    exporter.export_cluster_scoped(&discovery, &exported_kinds).await?;
  }

  let checksum = hash_directory(&tree.resources_dir(&namespace), &[])
    .inspect_err(|e| warn!(namespace = %namespace, error = %e, "cannot checksum export"))
    .ok();

  let summary = ExportSummary {
    namespace,
    exported: exporter.counters.exported.load(Ordering::Relaxed),
    failed: exporter.counters.failed.load(Ordering::Relaxed),
    discovery_failures: discovery.failures,
    shadowed: discovery.shadowed,
    checksum,
  };
  info!(
    namespace = %summary.namespace,
    exported = summary.exported,
    failed = summary.failed,
    "export complete"
  );
  Ok(summary)
}
