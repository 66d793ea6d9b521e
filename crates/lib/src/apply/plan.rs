//! Dependency tiers.
//!
//! Resources are bucketed by kind into a fixed sequence of tiers. A tier is only
//! started once the previous one has finished; resources inside a tier are
//! independent of each other.

use serde::Serialize;

use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
  /// Namespaces and CRDs: everything else may live in or be an instance of them.
  Foundation,
  ClusterScoped,
  Config,
  Storage,
  Workloads,
  Dependents,
}

impl Tier {
  pub const ALL: [Tier; 6] = [
    Tier::Foundation,
    Tier::ClusterScoped,
    Tier::Config,
    Tier::Storage,
    Tier::Workloads,
    Tier::Dependents,
  ];

  pub fn index(self) -> usize {
    self as usize
  }
}

impl std::fmt::Display for Tier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Tier::Foundation => "foundation",
      Tier::ClusterScoped => "cluster-scoped",
      Tier::Config => "config",
      Tier::Storage => "storage",
      Tier::Workloads => "workloads",
      Tier::Dependents => "dependents",
    };
    write!(f, "{}", name)
  }
}

/// Tier of a kind. `namespaced` is the resolved scope of the kind.
pub fn tier_for(kind: &str, namespaced: bool) -> Tier {
  match kind {
    "Namespace" | "CustomResourceDefinition" => Tier::Foundation,
    "ServiceAccount" | "Secret" | "ConfigMap" | "Role" | "RoleBinding" | "LimitRange" | "ResourceQuota" => {
      Tier::Config
    }
    "PersistentVolume" | "PersistentVolumeClaim" => Tier::Storage,
    "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "ReplicationController" | "Job" | "CronJob"
    | "Pod" | "DeploymentConfig" => Tier::Workloads,
    _ if !namespaced => Tier::ClusterScoped,
    _ => Tier::Dependents,
  }
}

/// One resource scheduled for apply.
#[derive(Debug, Clone)]
pub struct PlannedResource {
  /// Source path relative to the tree root.
  pub path: String,
  pub resource: Resource,
  pub namespaced: bool,
}

/// Resources bucketed into tiers, each tier sorted by path.
#[derive(Debug, Clone, Default)]
pub struct ApplyPlan {
  tiers: [Vec<PlannedResource>; 6],
}

impl ApplyPlan {
  pub fn new(resources: impl IntoIterator<Item = PlannedResource>) -> Self {
    let mut plan = Self::default();
    for planned in resources {
      let tier = tier_for(planned.resource.kind(), planned.namespaced);
      plan.tiers[tier.index()].push(planned);
    }
    for tier in &mut plan.tiers {
      tier.sort_by(|a, b| a.path.cmp(&b.path));
    }
    plan
  }

  /// Non-empty tiers in execution order.
  pub fn tiers(&self) -> impl Iterator<Item = (Tier, &[PlannedResource])> {
    Tier::ALL
      .into_iter()
      .map(|tier| (tier, self.tiers[tier.index()].as_slice()))
      .filter(|(_, resources)| !resources.is_empty())
  }

  pub fn len(&self) -> usize {
    self.tiers.iter().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
