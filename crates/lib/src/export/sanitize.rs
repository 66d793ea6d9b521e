//! Reduce a live object to a redeployable manifest.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::Resource;

/// Metadata fields owned by the source API server.
pub const SERVER_MANAGED_METADATA: &[&str] = &[
  "uid",
  "resourceVersion",
  "creationTimestamp",
  "generation",
  "managedFields",
  "selfLink",
  "deletionTimestamp",
  "deletionGracePeriodSeconds",
];

/// What to do with `metadata.ownerReferences`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerRefPolicy {
  Keep,
  /// Drop references whose owner kind is cluster-scoped; their UIDs never exist on the destination.
  #[default]
  DropClusterScoped,
  DropAll,
}

impl std::str::FromStr for OwnerRefPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "keep" => Ok(Self::Keep),
      "drop-cluster-scoped" => Ok(Self::DropClusterScoped),
      "drop-all" => Ok(Self::DropAll),
      other => Err(format!(
        "unknown owner reference policy '{}': expected keep, drop-cluster-scoped or drop-all",
        other
      )),
    }
  }
}

/// Strip server-managed state from `resource`.
///
/// `cluster_kinds` is the set of cluster-scoped kinds the source serves.
pub fn sanitize(mut resource: Resource, policy: OwnerRefPolicy, cluster_kinds: &BTreeSet<String>) -> Resource {
  let body = resource.body_mut();
  if let Some(object) = body.as_object_mut() {
    object.remove("status");
  }

  if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
    for field in SERVER_MANAGED_METADATA {
      metadata.remove(*field);
    }

    let keep_owner = |owner: &Value| match policy {
      OwnerRefPolicy::Keep => true,
      OwnerRefPolicy::DropAll => false,
      OwnerRefPolicy::DropClusterScoped => owner["kind"]
        .as_str()
        .is_none_or(|kind| !cluster_kinds.contains(kind)),
    };
    if let Some(Value::Array(owners)) = metadata.get_mut("ownerReferences") {
      owners.retain(keep_owner);
      if owners.is_empty() {
        metadata.remove("ownerReferences");
      }
    }
  }

  resource
}
