//! Apply engine.
//!
//! Re-creates a resource tree on a destination cluster. Tiers run strictly in
//! sequence; resources of one tier are applied concurrently through the shared
//! client. Every resource is an upsert: created when absent, updated only when
//! the tree specifies something the live object lacks. Failures are recorded per
//! resource and never rolled back.

pub mod diff;
pub mod plan;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ClusterClient};
use crate::consts::MAX_WORKERS;
use crate::discover::{self, Discovery, DiscoveryError};
use crate::export::{OwnerRefPolicy, sanitize};
use crate::resource::{Resource, ResourceDescriptor, Scope, split_api_version};
use crate::tree::{ResourceTree, TreeError};

pub use diff::is_subset;
pub use plan::{ApplyPlan, PlannedResource, Tier, tier_for};

#[derive(Debug, Error)]
pub enum ApplyError {
  #[error(transparent)]
  Tree(#[from] TreeError),

  #[error(transparent)]
  Discovery(#[from] DiscoveryError),

  #[error("destination cluster unreachable: {0}")]
  Unreachable(#[source] ClientError),
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
  /// Rewrite every namespaced resource into this namespace.
  pub target_namespace: Option<String>,
  pub skip_namespaced: bool,
  pub skip_cluster_scoped: bool,
  /// Plan and diff without mutating calls.
  pub dry_run: bool,
  /// Create namespaces the tree uses but does not contain.
  pub create_namespace: bool,
  pub workers: usize,
}

impl Default for ApplyOptions {
  fn default() -> Self {
    Self {
      target_namespace: None,
      skip_namespaced: false,
      skip_cluster_scoped: false,
      dry_run: false,
      create_namespace: false,
      workers: MAX_WORKERS,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum ApplyOutcome {
  Created,
  Updated,
  Unchanged,
  Failed(String),
}

impl ApplyOutcome {
  pub fn is_failure(&self) -> bool {
    matches!(self, ApplyOutcome::Failed(_))
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
  pub path: String,
  pub kind: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub namespace: Option<String>,
  pub name: String,
  /// `None` for manifests that never made it into the plan.
  pub tier: Option<Tier>,
  #[serde(flatten)]
  pub outcome: ApplyOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyCounts {
  pub created: usize,
  pub updated: usize,
  pub unchanged: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
  pub dry_run: bool,
  pub results: Vec<ApplyResult>,
}

impl ApplyReport {
  pub fn counts(&self) -> ApplyCounts {
    let mut counts = ApplyCounts::default();
    for result in &self.results {
      match result.outcome {
        ApplyOutcome::Created => counts.created += 1,
        ApplyOutcome::Updated => counts.updated += 1,
        ApplyOutcome::Unchanged => counts.unchanged += 1,
        ApplyOutcome::Failed(_) => counts.failed += 1,
      }
    }
    counts
  }

  pub fn is_success(&self) -> bool {
    self.results.iter().all(|r| !r.outcome.is_failure())
  }

  pub fn failures(&self) -> impl Iterator<Item = &ApplyResult> {
    self.results.iter().filter(|r| r.outcome.is_failure())
  }
}

/// Maps manifest types to destination descriptors.
#[derive(Debug, Clone)]
struct Resolver {
  discovery: Discovery,
  /// Kinds defined by CRDs in the tree, keyed by (group, kind).
  from_crds: BTreeMap<(String, String), ResourceDescriptor>,
}

impl Resolver {
  fn new(discovery: Discovery, resources: &[PlannedResource]) -> Self {
    let from_crds = resources
      .iter()
      .filter(|p| p.resource.kind() == "CustomResourceDefinition")
      .flat_map(|p| crd_descriptors(p.resource.body()))
      .map(|d| ((d.group.clone(), d.kind.clone()), d))
      .collect();
    Self { discovery, from_crds }
  }

  /// Descriptor for a manifest, keeping its own apiVersion.
  fn resolve(&self, resource: &Resource) -> Option<ResourceDescriptor> {
    let (group, version) = split_api_version(resource.api_version());
    let kind = resource.kind();
    let served = self
      .discovery
      .served_in(group, kind)
      .or_else(|| self.from_crds.get(&(group.to_string(), kind.to_string())))?;
    let mut descriptor = served.clone();
    descriptor.version = version.to_string();
    Some(descriptor)
  }

  /// Scope of a kind when known; the tree location decides otherwise.
  fn namespaced(&self, resource: &Resource, cluster_dir: bool) -> bool {
    match self.resolve(resource) {
      Some(descriptor) => descriptor.is_namespaced(),
      None => !cluster_dir && resource.kind() != "Namespace",
    }
  }
}

/// Descriptors of every version a CRD manifest defines.
fn crd_descriptors(crd: &Value) -> Vec<ResourceDescriptor> {
  let spec = &crd["spec"];
  let (Some(group), Some(kind), Some(plural)) = (
    spec["group"].as_str(),
    spec["names"]["kind"].as_str(),
    spec["names"]["plural"].as_str(),
  ) else {
    return Vec::new();
  };
  let scope = if spec["scope"].as_str() == Some("Cluster") {
    Scope::Cluster
  } else {
    Scope::Namespaced
  };
  spec["versions"]
    .as_array()
    .map(|versions| {
      versions
        .iter()
        .filter_map(|v| v["name"].as_str())
        .map(|version| ResourceDescriptor::new(group, version, kind, plural, scope))
        .collect()
    })
    .unwrap_or_default()
}

/// Point a resource at `target` instead of `source`.
fn remap_namespace(resource: &mut Resource, namespaced: bool, source: &str, target: &str) {
  if namespaced {
    resource.set_namespace(target);
  } else if resource.kind() == "Namespace" && resource.name() == source {
    resource.set_name(target);
  }

  if matches!(resource.kind(), "RoleBinding" | "ClusterRoleBinding")
    && let Some(subjects) = resource.body_mut()["subjects"].as_array_mut()
  {
    for subject in subjects {
      if subject["kind"].as_str() == Some("ServiceAccount") && subject["namespace"].as_str() == Some(source) {
        subject["namespace"] = Value::String(target.to_string());
      }
    }
  }
}

fn namespace_object(name: &str) -> Option<Resource> {
  Resource::from_value(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": name}})).ok()
}

/// Upsert one resource.
async fn apply_one(
  client: &dyn ClusterClient,
  descriptor: &ResourceDescriptor,
  resource: &Resource,
  dry_run: bool,
) -> Result<ApplyOutcome, ClientError> {
  let namespace = if descriptor.is_namespaced() {
    resource.namespace()
  } else {
    None
  };

  let live = match client.get(descriptor, namespace, resource.name()).await {
    Ok(live) => live,
    // The kind itself may not exist yet during a dry run.
    Err(ClientError::NotFound(_)) => None,
    Err(e) if e.is_systemic() => return Err(e),
    Err(e) => return Ok(ApplyOutcome::Failed(e.to_string())),
  };
  let desired = sanitize(resource.clone(), OwnerRefPolicy::Keep, &BTreeSet::new());

  let Some(live) = live else {
    if dry_run {
      return Ok(ApplyOutcome::Created);
    }
    return match client.create(descriptor, namespace, desired.body()).await {
      Ok(_) => Ok(ApplyOutcome::Created),
      Err(e) if e.is_systemic() => Err(e),
      Err(e) => Ok(ApplyOutcome::Failed(e.to_string())),
    };
  };

  if is_subset(desired.body(), &live) {
    return Ok(ApplyOutcome::Unchanged);
  }
  if dry_run {
    return Ok(ApplyOutcome::Updated);
  }

  let mut body = desired.into_body();
  if let Some(version) = live["metadata"]["resourceVersion"].as_str()
    && let Some(metadata) = body["metadata"].as_object_mut()
  {
    metadata.insert("resourceVersion".into(), Value::String(version.to_string()));
  }
  match client.update(descriptor, namespace, &body).await {
    Ok(_) => Ok(ApplyOutcome::Updated),
    Err(e) if e.is_systemic() => Err(e),
    Err(e) => Ok(ApplyOutcome::Failed(e.to_string())),
  }
}

fn result_for(planned: &PlannedResource, tier: Option<Tier>, outcome: ApplyOutcome) -> ApplyResult {
  ApplyResult {
    path: planned.path.clone(),
    kind: planned.resource.kind().to_string(),
    namespace: planned.resource.namespace().map(str::to_string),
    name: planned.resource.name().to_string(),
    tier,
    outcome,
  }
}

/// Apply `tree` to the cluster behind `client`.
pub async fn apply(
  client: Arc<dyn ClusterClient>,
  tree: &ResourceTree,
  options: &ApplyOptions,
) -> Result<ApplyReport, ApplyError> {
  let contents = tree.read_resources()?;
  let mut report = ApplyReport {
    dry_run: options.dry_run,
    results: Vec::new(),
  };
  for invalid in &contents.invalid {
    report.results.push(ApplyResult {
      path: invalid.rel_path.to_string_lossy().replace('\\', "/"),
      kind: String::new(),
      namespace: None,
      name: String::new(),
      tier: None,
      outcome: ApplyOutcome::Failed(invalid.error.clone()),
    });
  }

  let discovery = discover::discover_all(client.clone(), options.workers).await?;
  let mut sources: BTreeSet<String> = contents.entries.iter().map(|e| e.namespace.clone()).collect();
  let mut planned: Vec<PlannedResource> = contents
    .entries
    .into_iter()
    .map(|entry| PlannedResource {
      path: entry.rel_path.to_string_lossy().replace('\\', "/"),
      namespaced: !entry.cluster_scoped,
      resource: {
        let mut resource = entry.resource;
        // Manifests in a namespace directory default to that namespace.
        if !entry.cluster_scoped && resource.namespace().is_none() && resource.kind() != "Namespace" {
          resource.set_namespace(&entry.namespace);
        }
        resource
      },
    })
    .collect();
  let mut resolver = Resolver::new(discovery, &planned);
  sources.extend(planned.iter().filter_map(|p| p.resource.namespace().map(str::to_string)));

  for p in &mut planned {
    let cluster_dir = !p.namespaced;
    p.namespaced = resolver.namespaced(&p.resource, cluster_dir);
    if !p.namespaced {
      p.resource.clear_namespace();
    }
  }

  if let Some(target) = &options.target_namespace {
    // Every namespace the tree refers to collapses into the target.
    for p in &mut planned {
      for source in &sources {
        remap_namespace(&mut p.resource, p.namespaced, source, target);
      }
    }
  }

  planned.retain(|p| {
    let keep = if p.namespaced {
      !options.skip_namespaced
    } else {
      !options.skip_cluster_scoped
    };
    if !keep {
      debug!(path = %p.path, "skipped by scope filter");
    }
    keep
  });

  if options.create_namespace && !options.skip_cluster_scoped {
    let present: BTreeSet<String> = planned
      .iter()
      .filter(|p| p.resource.kind() == "Namespace")
      .map(|p| p.resource.name().to_string())
      .collect();
    let needed: BTreeSet<String> = planned
      .iter()
      .filter_map(|p| p.resource.namespace().map(str::to_string))
      .filter(|ns| !present.contains(ns))
      .collect();
    for namespace in needed {
      let Some(resource) = namespace_object(&namespace) else {
        continue;
      };
      debug!(namespace = %namespace, "synthesizing namespace");
      planned.push(PlannedResource {
        path: format!("<generated>/Namespace-{}", namespace),
        resource,
        namespaced: false,
      });
    }
  }

  let plan = ApplyPlan::new(planned);
  info!(resources = plan.len(), dry_run = options.dry_run, "applying tree");

  let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
  for (tier, resources) in plan.tiers() {
    // Kinds created by an earlier tier (CRDs) become resolvable only now.
    if !options.dry_run
      && tier > Tier::Foundation
      && resources.iter().any(|p| resolver.discovery.served_kind(p.resource.kind()).is_none())
    {
      match discover::discover_all(client.clone(), options.workers).await {
        Ok(discovery) => resolver.discovery = discovery,
        Err(e) => warn!(error = %e, "re-discovery failed, keeping previous discovery"),
      }
    }

    debug!(%tier, resources = resources.len(), "applying tier");
    let mut join_set = JoinSet::new();
    for (index, planned) in resources.iter().enumerate() {
      let Some(descriptor) = resolver.resolve(&planned.resource) else {
        warn!(path = %planned.path, kind = %planned.resource.kind(), "kind not served by destination");
        report.results.push(result_for(
          planned,
          Some(tier),
          ApplyOutcome::Failed(format!(
            "kind {} ({}) is not served by the destination cluster",
            planned.resource.kind(),
            planned.resource.api_version()
          )),
        ));
        continue;
      };
      let client = client.clone();
      let semaphore = semaphore.clone();
      let resource = planned.resource.clone();
      let dry_run = options.dry_run;
      join_set.spawn(async move {
        let _permit = semaphore.acquire().await.ok();
        (index, apply_one(client.as_ref(), &descriptor, &resource, dry_run).await)
      });
    }

    let mut fatal = None;
    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok((index, Ok(outcome))) => {
          let planned = &resources[index];
          match &outcome {
            ApplyOutcome::Failed(reason) => {
              warn!(path = %planned.path, reason = %reason, "apply failed")
            }
            other => debug!(path = %planned.path, outcome = ?other, "applied"),
          }
          report.results.push(result_for(planned, Some(tier), outcome));
        }
        Ok((_, Err(e))) => {
          if fatal.is_none() {
            fatal = Some(e);
            join_set.abort_all();
          }
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "apply task panicked"),
      }
    }
    if let Some(e) = fatal {
      return Err(ApplyError::Unreachable(e));
    }
  }

  report
    .results
    .sort_by(|a, b| (a.tier, &a.path).cmp(&(b.tier, &b.path)));
  let counts = report.counts();
  info!(
    created = counts.created,
    updated = counts.updated,
    unchanged = counts.unchanged,
    failed = counts.failed,
    "apply complete"
  );
  Ok(report)
}
