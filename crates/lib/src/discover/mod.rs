//! Resource discovery.
//!
//! Enumerates the exportable kinds a source cluster serves. API groups are
//! queried concurrently; a group that fails is skipped and reported, never fatal.
//! Only failing to reach the cluster at all aborts discovery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::{ApiResource, ClientError, ClusterClient};
use crate::resource::{ResourceDescriptor, Scope, split_api_version};

/// Kinds skipped unless explicitly included: ephemeral, derived, or not objects.
pub const DEFAULT_DENY_LIST: &[&str] = &[
  "Event",
  "Endpoints",
  "EndpointSlice",
  "PodMetrics",
  "NodeMetrics",
  "ComponentStatus",
  "Binding",
  "TokenReview",
  "SelfSubjectAccessReview",
  "SelfSubjectRulesReview",
  "SubjectAccessReview",
  "LocalSubjectAccessReview",
  "ControllerRevision",
  "Lease",
];

#[derive(Debug, Error)]
pub enum DiscoveryError {
  #[error("failed to list API groups: {0}")]
  GroupList(#[source] ClientError),

  #[error("cluster unreachable during discovery of {group_version}: {source}")]
  Unreachable {
    group_version: String,
    #[source]
    source: ClientError,
  },
}

/// Include/exclude filters over kinds plus the label selector for instances.
///
/// Entries match a kind (case-insensitive), its plural name, or `plural.group`.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
  pub include: Vec<String>,
  pub exclude: Vec<String>,
  pub label_selector: Option<String>,
}

impl ResourceFilter {
  fn matches(entries: &[String], descriptor: &ResourceDescriptor) -> bool {
    entries.iter().any(|entry| {
      let entry = entry.trim();
      entry.eq_ignore_ascii_case(&descriptor.kind)
        || entry == descriptor.resource
        || entry == descriptor.group_resource()
    })
  }

  /// Whether instances of `descriptor` should be exported.
  pub fn selects(&self, descriptor: &ResourceDescriptor) -> bool {
    if Self::matches(&self.exclude, descriptor) {
      return false;
    }
    if Self::matches(&self.include, descriptor) {
      return true;
    }
    self.include.is_empty() && !DEFAULT_DENY_LIST.contains(&descriptor.kind.as_str())
  }
}

/// A group version whose resources could not be listed.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryFailure {
  pub group_version: String,
  pub error: String,
}

/// A kind also served by an earlier group.
///
/// The exporter writes its instances under group-qualified file names so they
/// cannot collide with the instances of `kept`.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowedKind {
  pub descriptor: ResourceDescriptor,
  pub kept: String,
}

/// Outcome of one discovery run.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
  /// Selected kinds sorted by (group, kind).
  pub descriptors: Vec<ResourceDescriptor>,
  /// Every exportable kind the cluster serves, one group per kind, selected or not.
  pub served: Vec<ResourceDescriptor>,
  pub failures: Vec<DiscoveryFailure>,
  pub shadowed: Vec<ShadowedKind>,
}

impl Discovery {
  /// Kinds served with cluster scope.
  pub fn cluster_kinds(&self) -> BTreeSet<String> {
    self
      .served
      .iter()
      .filter(|d| !d.is_namespaced())
      .map(|d| d.kind.clone())
      .collect()
  }

  /// Served descriptor of a kind, regardless of selection.
  pub fn served_kind(&self, kind: &str) -> Option<&ResourceDescriptor> {
    self.served.iter().find(|d| d.kind == kind)
  }

  /// Served descriptor of `kind` in `group`, including shadowed groups.
  pub fn served_in(&self, group: &str, kind: &str) -> Option<&ResourceDescriptor> {
    self
      .served
      .iter()
      .chain(self.shadowed.iter().map(|s| &s.descriptor))
      .find(|d| d.group == group && d.kind == kind)
  }

  /// Descriptor for `kind` in `api_version`, falling back to any group serving `kind`.
  pub fn find(&self, api_version: &str, kind: &str) -> Option<&ResourceDescriptor> {
    self
      .descriptors
      .iter()
      .find(|d| d.kind == kind && d.api_version() == api_version)
      .or_else(|| self.descriptors.iter().find(|d| d.kind == kind))
  }
}

/// Every list/get-able kind served by the cluster, without filtering.
///
/// Used by the apply engine, which must resolve kinds the exporter would skip.
pub async fn discover_all(client: Arc<dyn ClusterClient>, workers: usize) -> Result<Discovery, DiscoveryError> {
  discover_with(client, workers, |_| true).await
}

/// Kinds selected by `filter`.
pub async fn discover(
  client: Arc<dyn ClusterClient>,
  filter: &ResourceFilter,
  workers: usize,
) -> Result<Discovery, DiscoveryError> {
  let discovery = discover_with(client, workers, |d| filter.selects(d)).await?;
  info!(
    kinds = discovery.descriptors.len(),
    failed_groups = discovery.failures.len(),
    "discovery complete"
  );
  Ok(discovery)
}

async fn discover_with<F>(client: Arc<dyn ClusterClient>, workers: usize, select: F) -> Result<Discovery, DiscoveryError>
where
  F: Fn(&ResourceDescriptor) -> bool,
{
  let group_versions = client.api_group_versions().await.map_err(DiscoveryError::GroupList)?;
  debug!(groups = group_versions.len(), "listing resources per group");

  let semaphore = Arc::new(Semaphore::new(workers.max(1)));
  let mut join_set = JoinSet::new();
  for (index, gv) in group_versions.into_iter().enumerate() {
    let client = client.clone();
    let semaphore = semaphore.clone();
    join_set.spawn(async move {
      let Ok(_permit) = semaphore.acquire().await else {
        return (index, gv, Err(ClientError::Other("worker pool closed".into())));
      };
      let result = client.api_resources(&gv).await;
      (index, gv, result)
    });
  }

  let mut per_group = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(entry) => per_group.push(entry),
      Err(e) => error!(error = %e, "discovery task panicked"),
    }
  }
  // Discovery order decides which group wins a duplicated kind.
  per_group.sort_by_key(|(index, _, _)| *index);

  let mut discovery = Discovery::default();
  let mut owners: BTreeMap<String, String> = BTreeMap::new();
  let mut served = BTreeSet::new();

  for (_, gv, result) in per_group {
    let resources = match result {
      Ok(resources) => resources,
      Err(e) if e.is_systemic() => {
        return Err(DiscoveryError::Unreachable {
          group_version: gv,
          source: e,
        });
      }
      Err(e) => {
        warn!(group_version = %gv, error = %e, "skipping API group");
        discovery.failures.push(DiscoveryFailure {
          group_version: gv,
          error: e.to_string(),
        });
        continue;
      }
    };

    for resource in resources.iter().filter(|r| exportable(r)) {
      let descriptor = descriptor_for(&gv, resource);
      if served.insert(descriptor.kind.clone()) {
        discovery.served.push(descriptor.clone());
      }
      if !select(&descriptor) {
        continue;
      }
      if let Some(kept) = owners.get(&descriptor.kind) {
        info!(kind = %descriptor.kind, group_version = %gv, kept = %kept, "kind also served by an earlier group");
        discovery.shadowed.push(ShadowedKind {
          descriptor,
          kept: kept.clone(),
        });
        continue;
      }
      owners.insert(descriptor.kind.clone(), gv.clone());
      discovery.descriptors.push(descriptor);
    }
  }

  for list in [&mut discovery.descriptors, &mut discovery.served] {
    list.sort_by(|a, b| (&a.group, &a.kind).cmp(&(&b.group, &b.kind)));
  }
  Ok(discovery)
}

fn exportable(resource: &ApiResource) -> bool {
  !resource.is_subresource() && resource.supports("list") && resource.supports("get")
}

fn descriptor_for(group_version: &str, resource: &ApiResource) -> ResourceDescriptor {
  let (group, version) = split_api_version(group_version);
  let scope = if resource.namespaced {
    Scope::Namespaced
  } else {
    Scope::Cluster
  };
  ResourceDescriptor::new(group, version, &resource.kind, &resource.name, scope)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::MemoryCluster;
  use tracing_test::traced_test;

  fn kinds(discovery: &Discovery) -> Vec<&str> {
    discovery.descriptors.iter().map(|d| d.kind.as_str()).collect()
  }

  #[tokio::test]
  async fn deny_list_and_subresources_are_skipped() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    let discovery = discover(cluster, &ResourceFilter::default(), 4).await.unwrap();

    let kinds = kinds(&discovery);
    assert!(kinds.contains(&"ConfigMap"));
    assert!(kinds.contains(&"Deployment"));
    assert!(!kinds.contains(&"Event"));
    assert!(!kinds.contains(&"Endpoints"));
    assert!(!kinds.contains(&"ControllerRevision"));
    assert_eq!(kinds.iter().filter(|k| **k == "Pod").count(), 1);
    assert!(discovery.served_kind("Event").is_some());
    assert!(discovery.cluster_kinds().contains("Namespace"));
    assert!(!discovery.cluster_kinds().contains("Pod"));
  }

  #[tokio::test]
  async fn explicit_include_overrides_deny_list() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    let filter = ResourceFilter {
      include: vec!["events".into(), "configmap".into()],
      ..Default::default()
    };
    let discovery = discover(cluster, &filter, 4).await.unwrap();
    assert_eq!(kinds(&discovery), vec!["ConfigMap", "Event"]);
    // events.k8s.io also serves Event; core wins.
    assert_eq!(discovery.descriptors[1].group, "");
    assert_eq!(discovery.shadowed.len(), 1);
    assert_eq!(discovery.shadowed[0].descriptor.group, "events.k8s.io");
  }

  #[tokio::test]
  async fn shadowed_groups_still_resolve() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    let discovery = discover_all(cluster, 4).await.unwrap();
    assert_eq!(discovery.served_kind("Event").unwrap().group, "");
    assert_eq!(discovery.served_in("events.k8s.io", "Event").unwrap().group, "events.k8s.io");
    assert!(discovery.served_in("example.com", "Event").is_none());
  }

  #[tokio::test]
  async fn exclude_matches_plural_group() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    let filter = ResourceFilter {
      exclude: vec!["deployments.apps".into(), "Secret".into()],
      ..Default::default()
    };
    let discovery = discover(cluster, &filter, 4).await.unwrap();
    let kinds = kinds(&discovery);
    assert!(!kinds.contains(&"Deployment"));
    assert!(!kinds.contains(&"Secret"));
    assert!(kinds.contains(&"StatefulSet"));
  }

  #[tokio::test]
  #[traced_test]
  async fn failing_group_is_skipped_and_reported() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    cluster.fail_group("batch/v1", ClientError::Unavailable("metrics backend down".into()));

    let discovery = discover(cluster, &ResourceFilter::default(), 4).await.unwrap();
    let kinds = kinds(&discovery);
    assert!(!kinds.contains(&"Job"));
    assert!(kinds.contains(&"Deployment"));
    assert_eq!(discovery.failures.len(), 1);
    assert_eq!(discovery.failures[0].group_version, "batch/v1");
    assert!(logs_contain("skipping API group"));
  }

  #[tokio::test]
  async fn unreachable_cluster_is_fatal() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    cluster.fail_next_calls(1, ClientError::Transport("connection refused".into()));
    let err = discover(cluster, &ResourceFilter::default(), 4).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::GroupList(_)));
  }

  #[tokio::test]
  async fn output_is_sorted_by_group_then_kind() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    let discovery = discover(cluster, &ResourceFilter::default(), 2).await.unwrap();
    let mut sorted = discovery.descriptors.clone();
    sorted.sort_by(|a, b| (&a.group, &a.kind).cmp(&(&b.group, &b.kind)));
    assert_eq!(discovery.descriptors, sorted);
    assert_eq!(discovery.descriptors[0].group, "");
  }
}
