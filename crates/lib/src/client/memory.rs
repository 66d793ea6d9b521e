//! In-memory cluster.
//!
//! Behaves like an API server for the subset of semantics the pipeline relies on:
//! discovery, server-populated metadata, optimistic concurrency on update,
//! namespaces that must exist before namespaced objects, and CRDs that register
//! new kinds. Failures can be injected per group, per kind or per object, which
//! makes it the test cluster for export, apply and their properties.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::resource::{Resource, ResourceDescriptor, ResourceId, selector_matches, split_api_version};

use super::{ApiResource, ClientError, ClusterClient};

/// Number of calls received, by operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
  pub discovery: usize,
  pub lists: usize,
  pub gets: usize,
  pub creates: usize,
  pub updates: usize,
  pub deletes: usize,
}

impl CallCounts {
  /// Calls that change cluster state.
  pub fn mutations(&self) -> usize {
    self.creates + self.updates + self.deletes
  }
}

type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct State {
  group_order: Vec<String>,
  groups: BTreeMap<String, Vec<ApiResource>>,
  objects: BTreeMap<ObjectKey, Value>,
  failing_groups: BTreeMap<String, ClientError>,
  failing_lists: BTreeMap<String, ClientError>,
  rejected: BTreeMap<(String, String), ClientError>,
  fail_next: Option<(usize, ClientError)>,
  counts: CallCounts,
  created: Vec<ResourceId>,
  next_version: u64,
}

/// Thread-safe in-memory implementation of [`ClusterClient`].
#[derive(Default)]
pub struct MemoryCluster {
  state: Mutex<State>,
}

impl MemoryCluster {
  /// An empty cluster that serves no kinds.
  pub fn new() -> Self {
    Self::default()
  }

  /// A cluster serving the built-in kinds of a typical Kubernetes API server.
  pub fn with_standard_resources() -> Self {
    let cluster = Self::new();
    let core = [
      ("namespaces", "Namespace", false),
      ("pods", "Pod", true),
      ("services", "Service", true),
      ("configmaps", "ConfigMap", true),
      ("secrets", "Secret", true),
      ("serviceaccounts", "ServiceAccount", true),
      ("persistentvolumeclaims", "PersistentVolumeClaim", true),
      ("persistentvolumes", "PersistentVolume", false),
      ("endpoints", "Endpoints", true),
      ("events", "Event", true),
    ];
    for (name, kind, namespaced) in core {
      cluster.register("v1", ApiResource::new(name, kind, namespaced));
    }
    let mut pod_log = ApiResource::new("pods/log", "Pod", true);
    pod_log.verbs = vec!["get".into()];
    cluster.register("v1", pod_log);

    for (name, kind) in [
      ("deployments", "Deployment"),
      ("statefulsets", "StatefulSet"),
      ("daemonsets", "DaemonSet"),
      ("replicasets", "ReplicaSet"),
      ("controllerrevisions", "ControllerRevision"),
    ] {
      cluster.register("apps/v1", ApiResource::new(name, kind, true));
    }
    cluster.register("batch/v1", ApiResource::new("jobs", "Job", true));
    cluster.register("batch/v1", ApiResource::new("cronjobs", "CronJob", true));
    for (name, kind, namespaced) in [
      ("roles", "Role", true),
      ("rolebindings", "RoleBinding", true),
      ("clusterroles", "ClusterRole", false),
      ("clusterrolebindings", "ClusterRoleBinding", false),
    ] {
      cluster.register("rbac.authorization.k8s.io/v1", ApiResource::new(name, kind, namespaced));
    }
    cluster.register("networking.k8s.io/v1", ApiResource::new("ingresses", "Ingress", true));
    cluster.register("networking.k8s.io/v1", ApiResource::new("networkpolicies", "NetworkPolicy", true));
    cluster.register("storage.k8s.io/v1", ApiResource::new("storageclasses", "StorageClass", false));
    cluster.register(
      "apiextensions.k8s.io/v1",
      ApiResource::new("customresourcedefinitions", "CustomResourceDefinition", false),
    );
    cluster.register("events.k8s.io/v1", ApiResource::new("events", "Event", true));
    cluster
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Serve `resource` under `group_version`.
  pub fn register(&self, group_version: &str, resource: ApiResource) {
    let mut state = self.state();
    if !state.groups.contains_key(group_version) {
      state.group_order.push(group_version.to_string());
    }
    let resources = state.groups.entry(group_version.to_string()).or_default();
    resources.retain(|r| r.name != resource.name);
    resources.push(resource);
  }

  /// Store an object directly, populating server-managed metadata.
  ///
  /// # Panics
  ///
  /// Panics if the object's kind is not served; this is a fixture helper.
  pub fn insert(&self, body: Value) {
    let mut state = self.state();
    let resource = Resource::from_value(body).unwrap_or_else(|e| panic!("invalid fixture object: {e}"));
    let (gv, plural, namespaced) = lookup_kind(&state, resource.api_version(), resource.kind())
      .unwrap_or_else(|| panic!("kind {} is not served", resource.kind()));
    let ns = if namespaced {
      resource.namespace().unwrap_or("default").to_string()
    } else {
      String::new()
    };
    let body = populate_server_fields(&mut state, resource.into_body(), None);
    let name = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
    state.objects.insert((gv, plural, ns, name), body);
  }

  /// Make discovery of one group version fail.
  pub fn fail_group(&self, group_version: &str, error: ClientError) {
    self.state().failing_groups.insert(group_version.to_string(), error);
  }

  /// Make every list of `kind` fail.
  pub fn fail_list(&self, kind: &str, error: ClientError) {
    self.state().failing_lists.insert(kind.to_string(), error);
  }

  /// Reject create/update of one object.
  pub fn reject(&self, kind: &str, name: &str, error: ClientError) {
    self.state().rejected.insert((kind.to_string(), name.to_string()), error);
  }

  /// Fail the next `count` calls of any kind with `error`.
  pub fn fail_next_calls(&self, count: usize, error: ClientError) {
    self.state().fail_next = Some((count, error));
  }

  pub fn counts(&self) -> CallCounts {
    self.state().counts
  }

  /// Objects created through the client, in call order.
  pub fn created(&self) -> Vec<ResourceId> {
    self.state().created.clone()
  }

  /// Stored object, if present.
  pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
    let state = self.state();
    state
      .objects
      .iter()
      .find(|((_, _, ns, n), body)| {
        n == name && body["kind"].as_str() == Some(kind) && (namespace.is_none() || Some(ns.as_str()) == namespace)
      })
      .map(|(_, body)| body.clone())
  }

  /// Number of stored objects of `kind` in `namespace` (or cluster-wide).
  pub fn count(&self, kind: &str, namespace: Option<&str>) -> usize {
    let state = self.state();
    state
      .objects
      .iter()
      .filter(|((_, _, ns, _), body)| {
        body["kind"].as_str() == Some(kind) && (namespace.is_none() || Some(ns.as_str()) == namespace)
      })
      .count()
  }

  fn take_injected_failure(state: &mut State) -> Option<ClientError> {
    let (remaining, error) = state.fail_next.as_mut()?;
    let error = error.clone();
    *remaining -= 1;
    if *remaining == 0 {
      state.fail_next = None;
    }
    Some(error)
  }

  fn object_key(descriptor: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> ObjectKey {
    let ns = if descriptor.is_namespaced() {
      namespace.unwrap_or_default().to_string()
    } else {
      String::new()
    };
    (
      descriptor.api_version(),
      descriptor.resource.clone(),
      ns,
      name.to_string(),
    )
  }

  fn check_served(state: &State, descriptor: &ResourceDescriptor) -> Result<(), ClientError> {
    let served = state
      .groups
      .get(&descriptor.api_version())
      .is_some_and(|resources| resources.iter().any(|r| r.name == descriptor.resource));
    if served {
      Ok(())
    } else {
      Err(ClientError::NotFound(format!(
        "the server could not find the requested resource ({})",
        descriptor.group_resource()
      )))
    }
  }

  fn check_rejected(state: &State, body: &Value) -> Result<(), ClientError> {
    let kind = body["kind"].as_str().unwrap_or_default().to_string();
    let name = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
    match state.rejected.get(&(kind, name)) {
      Some(error) => Err(error.clone()),
      None => Ok(()),
    }
  }

  fn check_namespace(state: &State, descriptor: &ResourceDescriptor, namespace: Option<&str>) -> Result<(), ClientError> {
    if !descriptor.is_namespaced() {
      return Ok(());
    }
    let ns = namespace.unwrap_or_default();
    let exists = state
      .objects
      .keys()
      .any(|(gv, plural, scope, name)| gv == "v1" && plural == "namespaces" && scope.is_empty() && name == ns);
    if exists {
      Ok(())
    } else {
      Err(ClientError::NotFound(format!("namespaces \"{}\" not found", ns)))
    }
  }
}

fn lookup_kind(state: &State, api_version: &str, kind: &str) -> Option<(String, String, bool)> {
  state.groups.get(api_version).and_then(|resources| {
    resources
      .iter()
      .find(|r| r.kind == kind && !r.is_subresource())
      .map(|r| (api_version.to_string(), r.name.clone(), r.namespaced))
  })
}

fn populate_server_fields(state: &mut State, mut body: Value, previous: Option<&Value>) -> Value {
  state.next_version += 1;
  let version = state.next_version.to_string();
  let uid = previous
    .and_then(|p| p["metadata"]["uid"].as_str().map(str::to_string))
    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
  let generation = previous
    .and_then(|p| p["metadata"]["generation"].as_u64())
    .map(|g| g + 1)
    .unwrap_or(1);

  if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
    metadata.insert("uid".into(), Value::String(uid));
    metadata.insert("resourceVersion".into(), Value::String(version));
    metadata.insert("creationTimestamp".into(), Value::String("2024-01-01T00:00:00Z".into()));
    metadata.insert("generation".into(), json!(generation));
    metadata.insert(
      "managedFields".into(),
      json!([{"manager": "kubectl", "operation": "Update", "apiVersion": "v1"}]),
    );
  }
  if let Some(object) = body.as_object_mut() {
    object.entry("status").or_insert_with(|| json!({}));
  }
  body
}

/// A created CRD starts serving its kind at the storage version.
fn register_crd(state: &mut State, crd: &Value) {
  let group = crd["spec"]["group"].as_str().unwrap_or_default();
  let plural = crd["spec"]["names"]["plural"].as_str().unwrap_or_default();
  let kind = crd["spec"]["names"]["kind"].as_str().unwrap_or_default();
  let namespaced = crd["spec"]["scope"].as_str() != Some("Cluster");
  let Some(versions) = crd["spec"]["versions"].as_array() else {
    return;
  };
  for version in versions {
    let Some(name) = version["name"].as_str() else {
      continue;
    };
    let gv = format!("{}/{}", group, name);
    if !state.groups.contains_key(&gv) {
      state.group_order.push(gv.clone());
    }
    let resources = state.groups.entry(gv).or_default();
    resources.retain(|r| r.name != plural);
    resources.push(ApiResource::new(plural, kind, namespaced));
  }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
  async fn api_group_versions(&self) -> Result<Vec<String>, ClientError> {
    let mut state = self.state();
    state.counts.discovery += 1;
    if let Some(error) = Self::take_injected_failure(&mut state) {
      return Err(error);
    }

    // One preferred version per group, core first.
    let mut seen = Vec::new();
    let mut preferred = Vec::new();
    let mut order = state.group_order.clone();
    order.sort_by_key(|gv| gv != "v1");
    for gv in order {
      let group = split_api_version(&gv).0.to_string();
      if !seen.contains(&group) {
        seen.push(group);
        preferred.push(gv);
      }
    }
    Ok(preferred)
  }

  async fn api_resources(&self, group_version: &str) -> Result<Vec<ApiResource>, ClientError> {
    let mut state = self.state();
    state.counts.discovery += 1;
    if let Some(error) = Self::take_injected_failure(&mut state) {
      return Err(error);
    }
    if let Some(error) = state.failing_groups.get(group_version) {
      return Err(error.clone());
    }
    state
      .groups
      .get(group_version)
      .cloned()
      .ok_or_else(|| ClientError::NotFound(format!("group version {} not served", group_version)))
  }

  async fn list(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    label_selector: Option<&str>,
  ) -> Result<Vec<Value>, ClientError> {
    let mut state = self.state();
    state.counts.lists += 1;
    if let Some(error) = Self::take_injected_failure(&mut state) {
      return Err(error);
    }
    if let Some(error) = state.failing_lists.get(&descriptor.kind) {
      return Err(error.clone());
    }
    Self::check_served(&state, descriptor)?;

    let api_version = descriptor.api_version();
    let items = state
      .objects
      .iter()
      .filter(|((gv, plural, ns, _), _)| {
        *gv == api_version
          && *plural == descriptor.resource
          && (!descriptor.is_namespaced() || namespace.is_none() || Some(ns.as_str()) == namespace)
      })
      .filter(|(_, body)| match label_selector {
        Some(selector) => Resource::from_value((*body).clone())
          .map(|r| selector_matches(selector, &r.labels()))
          .unwrap_or(false),
        None => true,
      })
      .map(|(_, body)| body.clone())
      .collect();
    Ok(items)
  }

  async fn get(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<Option<Value>, ClientError> {
    let mut state = self.state();
    state.counts.gets += 1;
    if let Some(error) = Self::take_injected_failure(&mut state) {
      return Err(error);
    }
    Self::check_served(&state, descriptor)?;
    Ok(state.objects.get(&Self::object_key(descriptor, namespace, name)).cloned())
  }

  async fn create(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError> {
    let mut state = self.state();
    state.counts.creates += 1;
    if let Some(error) = Self::take_injected_failure(&mut state) {
      return Err(error);
    }
    Self::check_served(&state, descriptor)?;
    Self::check_rejected(&state, body)?;
    Self::check_namespace(&state, descriptor, namespace)?;

    let resource = Resource::from_value(body.clone()).map_err(|e| ClientError::Invalid(e.to_string()))?;
    let key = Self::object_key(descriptor, namespace, resource.name());
    if state.objects.contains_key(&key) {
      return Err(ClientError::AlreadyExists(resource.id().to_string()));
    }

    let mut resource = resource;
    if descriptor.is_namespaced()
      && let Some(ns) = namespace
    {
      resource.set_namespace(ns);
    }
    let id = resource.id();
    let stored = populate_server_fields(&mut state, resource.into_body(), None);
    if descriptor.kind == "CustomResourceDefinition" {
      register_crd(&mut state, &stored);
    }
    debug!(object = %id, "memory cluster created object");
    state.created.push(id);
    state.objects.insert(key, stored.clone());
    Ok(stored)
  }

  async fn update(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError> {
    let mut state = self.state();
    state.counts.updates += 1;
    if let Some(error) = Self::take_injected_failure(&mut state) {
      return Err(error);
    }
    Self::check_served(&state, descriptor)?;
    Self::check_rejected(&state, body)?;

    let resource = Resource::from_value(body.clone()).map_err(|e| ClientError::Invalid(e.to_string()))?;
    let key = Self::object_key(descriptor, namespace, resource.name());
    let Some(previous) = state.objects.get(&key).cloned() else {
      return Err(ClientError::NotFound(resource.id().to_string()));
    };

    let sent_version = body["metadata"]["resourceVersion"].as_str();
    if sent_version.is_some() && sent_version != previous["metadata"]["resourceVersion"].as_str() {
      return Err(ClientError::Conflict(format!(
        "the object {} has been modified; please apply your changes to the latest version",
        resource.id()
      )));
    }

    let stored = populate_server_fields(&mut state, resource.into_body(), Some(&previous));
    state.objects.insert(key, stored.clone());
    Ok(stored)
  }

  async fn delete(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<(), ClientError> {
    let mut state = self.state();
    state.counts.deletes += 1;
    if let Some(error) = Self::take_injected_failure(&mut state) {
      return Err(error);
    }
    match state.objects.remove(&Self::object_key(descriptor, namespace, name)) {
      Some(_) => Ok(()),
      None => Err(ClientError::NotFound(format!("{}/{}", descriptor.kind, name))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resource::Scope;

  fn namespaces() -> ResourceDescriptor {
    ResourceDescriptor::new("", "v1", "Namespace", "namespaces", Scope::Cluster)
  }

  fn config_maps() -> ResourceDescriptor {
    ResourceDescriptor::new("", "v1", "ConfigMap", "configmaps", Scope::Namespaced)
  }

  fn config_map(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": "v"}})
  }

  #[tokio::test]
  async fn namespaced_create_requires_namespace() {
    let cluster = MemoryCluster::with_standard_resources();
    let err = cluster.create(&config_maps(), Some("demo"), &config_map("a")).await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));

    cluster
      .create(&namespaces(), None, &json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "demo"}}))
      .await
      .unwrap();
    let created = cluster.create(&config_maps(), Some("demo"), &config_map("a")).await.unwrap();
    assert_eq!(created["metadata"]["namespace"], "demo");
    assert!(created["metadata"]["uid"].is_string());
  }

  #[tokio::test]
  async fn update_checks_resource_version() {
    let cluster = MemoryCluster::with_standard_resources();
    cluster.insert(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "demo"}}));
    let created = cluster.create(&config_maps(), Some("demo"), &config_map("a")).await.unwrap();

    let mut stale = created.clone();
    stale["metadata"]["resourceVersion"] = json!("0");
    let err = cluster.update(&config_maps(), Some("demo"), &stale).await.unwrap_err();
    assert!(matches!(err, ClientError::Conflict(_)));

    let updated = cluster.update(&config_maps(), Some("demo"), &created).await.unwrap();
    assert_eq!(updated["metadata"]["uid"], created["metadata"]["uid"]);
    assert_eq!(updated["metadata"]["generation"], 2);
  }

  #[tokio::test]
  async fn created_crd_serves_its_kind() {
    let cluster = MemoryCluster::with_standard_resources();
    let crds = ResourceDescriptor::new(
      "apiextensions.k8s.io",
      "v1",
      "CustomResourceDefinition",
      "customresourcedefinitions",
      Scope::Cluster,
    );
    let crd = json!({
      "apiVersion": "apiextensions.k8s.io/v1",
      "kind": "CustomResourceDefinition",
      "metadata": {"name": "widgets.example.com"},
      "spec": {
        "group": "example.com",
        "scope": "Namespaced",
        "names": {"plural": "widgets", "kind": "Widget"},
        "versions": [{"name": "v1", "served": true, "storage": true}]
      }
    });
    cluster.create(&crds, None, &crd).await.unwrap();

    let groups = cluster.api_group_versions().await.unwrap();
    assert_eq!(groups[0], "v1");
    assert!(groups.contains(&"example.com/v1".to_string()));
    let resources = cluster.api_resources("example.com/v1").await.unwrap();
    assert_eq!(resources[0].kind, "Widget");
  }

  #[tokio::test]
  async fn list_applies_label_selector() {
    let cluster = MemoryCluster::with_standard_resources();
    cluster.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "demo", "labels": {"app": "web"}}}));
    cluster.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b", "namespace": "demo"}}));

    let all = cluster.list(&config_maps(), Some("demo"), None).await.unwrap();
    let web = cluster.list(&config_maps(), Some("demo"), Some("app=web")).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(web.len(), 1);
    assert_eq!(web[0]["metadata"]["name"], "a");
  }
}
