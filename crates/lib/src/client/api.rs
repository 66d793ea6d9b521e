//! [`ClusterClient`] backed by kube-rs.
//!
//! Objects travel as [`DynamicObject`]s addressed through an API resource built
//! from the [`ResourceDescriptor`], so any discovered kind works without typed
//! bindings. Error classes come from the API server's status code and reason.
//!
//! The connection is established on first use. A kubeconfig that cannot be
//! loaded surfaces as [`ClientError::Transport`] from that first call.

use async_trait::async_trait;
use kube::api::{Api, ApiResource as DynamicResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::config::ClusterConfig;
use crate::resource::{ResourceDescriptor, Scope};

use super::{ApiResource, ClientError, ClusterClient};

/// Talks to one cluster through the Kubernetes API.
pub struct KubeClient {
  config: ClusterConfig,
  client: OnceCell<Client>,
}

impl KubeClient {
  pub fn new(config: ClusterConfig) -> Self {
    Self {
      config,
      client: OnceCell::new(),
    }
  }

  pub fn config(&self) -> &ClusterConfig {
    &self.config
  }

  async fn client(&self) -> Result<&Client, ClientError> {
    self.client.get_or_try_init(|| connect(&self.config)).await
  }

  async fn api(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
  ) -> Result<Api<DynamicObject>, ClientError> {
    let client = self.client().await?.clone();
    let resource = dynamic_resource(descriptor);
    Ok(match (descriptor.scope, namespace) {
      (Scope::Namespaced, Some(namespace)) => Api::namespaced_with(client, namespace, &resource),
      _ => Api::all_with(client, &resource),
    })
  }
}

/// Build a client for the configured kubeconfig and context.
async fn connect(config: &ClusterConfig) -> Result<Client, ClientError> {
  let options = KubeConfigOptions {
    context: config.context.clone(),
    ..KubeConfigOptions::default()
  };
  let loaded = match &config.kubeconfig {
    Some(path) => {
      let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| ClientError::Transport(format!("cannot read kubeconfig {}: {}", path.display(), e)))?;
      Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| ClientError::Transport(format!("invalid kubeconfig {}: {}", path.display(), e)))?
    }
    None if config.context.is_some() => Config::from_kubeconfig(&options)
      .await
      .map_err(|e| ClientError::Transport(format!("cannot load kubeconfig: {}", e)))?,
    None => Config::infer()
      .await
      .map_err(|e| ClientError::Transport(format!("no cluster configuration found: {}", e)))?,
  };
  debug!(cluster = %config.display_name(), server = %loaded.cluster_url, "connecting");
  Client::try_from(loaded).map_err(classify)
}

/// Dynamic API resource for a descriptor.
fn dynamic_resource(descriptor: &ResourceDescriptor) -> DynamicResource {
  DynamicResource {
    group: descriptor.group.clone(),
    version: descriptor.version.clone(),
    api_version: descriptor.api_version(),
    kind: descriptor.kind.clone(),
    plural: descriptor.resource.clone(),
  }
}

/// Error class for an API status.
fn classify_status(code: u16, reason: &str, message: String) -> ClientError {
  match code {
    404 => ClientError::NotFound(message),
    401 | 403 => ClientError::Forbidden(message),
    409 if reason == "AlreadyExists" => ClientError::AlreadyExists(message),
    409 => ClientError::Conflict(message),
    400 | 422 => ClientError::Invalid(message),
    429 | 500..=599 => ClientError::Unavailable(message),
    _ => ClientError::Other(format!("{} ({} {})", message, code, reason)),
  }
}

pub(crate) fn classify(error: kube::Error) -> ClientError {
  match error {
    kube::Error::Api(response) => classify_status(response.code, &response.reason, response.message),
    kube::Error::SerdeError(e) => ClientError::Decode(e.to_string()),
    kube::Error::HyperError(e) => ClientError::Transport(e.to_string()),
    kube::Error::Service(e) => ClientError::Transport(e.to_string()),
    kube::Error::Auth(e) => ClientError::Transport(format!("authentication failed: {}", e)),
    other => ClientError::Other(other.to_string()),
  }
}

fn to_object(body: &Value) -> Result<DynamicObject, ClientError> {
  serde_json::from_value(body.clone()).map_err(|e| ClientError::Invalid(format!("not a Kubernetes object: {}", e)))
}

/// Objects as JSON; list items omit `apiVersion`/`kind`, so they are filled in.
fn to_value(descriptor: &ResourceDescriptor, object: DynamicObject) -> Result<Value, ClientError> {
  let mut value = serde_json::to_value(object).map_err(|e| ClientError::Decode(e.to_string()))?;
  if let Some(fields) = value.as_object_mut() {
    fields
      .entry("apiVersion")
      .or_insert_with(|| Value::String(descriptor.api_version()));
    fields
      .entry("kind")
      .or_insert_with(|| Value::String(descriptor.kind.clone()));
  }
  Ok(value)
}

#[async_trait]
impl ClusterClient for KubeClient {
  async fn api_group_versions(&self) -> Result<Vec<String>, ClientError> {
    let client = self.client().await?;
    let core = client.list_core_api_versions().await.map_err(classify)?;
    let groups = client.list_api_groups().await.map_err(classify)?;

    let mut versions: Vec<String> = core.versions.into_iter().take(1).collect();
    versions.extend(groups.groups.into_iter().filter_map(|group| {
      group
        .preferred_version
        .or_else(|| group.versions.into_iter().next())
        .map(|version| version.group_version)
    }));
    Ok(versions)
  }

  async fn api_resources(&self, group_version: &str) -> Result<Vec<ApiResource>, ClientError> {
    let client = self.client().await?;
    let list = if group_version.contains('/') {
      client.list_api_group_resources(group_version).await
    } else {
      client.list_core_api_resources(group_version).await
    }
    .map_err(classify)?;

    Ok(
      list
        .resources
        .into_iter()
        .map(|resource| ApiResource {
          name: resource.name,
          kind: resource.kind,
          namespaced: resource.namespaced,
          verbs: resource.verbs,
        })
        .collect(),
    )
  }

  async fn list(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    label_selector: Option<&str>,
  ) -> Result<Vec<Value>, ClientError> {
    let api = self.api(descriptor, namespace).await?;
    let params = match label_selector.filter(|s| !s.is_empty()) {
      Some(selector) => ListParams::default().labels(selector),
      None => ListParams::default(),
    };
    trace!(kind = %descriptor.kind, ?namespace, ?label_selector, "list");
    let list = api.list(&params).await.map_err(classify)?;
    list
      .items
      .into_iter()
      .map(|item| to_value(descriptor, item))
      .collect()
  }

  async fn get(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<Option<Value>, ClientError> {
    let api = self.api(descriptor, namespace).await?;
    match api.get_opt(name).await.map_err(classify)? {
      Some(object) => to_value(descriptor, object).map(Some),
      None => Ok(None),
    }
  }

  async fn create(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError> {
    let api = self.api(descriptor, namespace).await?;
    let created = api
      .create(&PostParams::default(), &to_object(body)?)
      .await
      .map_err(classify)?;
    to_value(descriptor, created)
  }

  async fn update(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError> {
    let name = body["metadata"]["name"]
      .as_str()
      .ok_or_else(|| ClientError::Invalid("object has no metadata.name".into()))?;
    let api = self.api(descriptor, namespace).await?;
    let replaced = api
      .replace(name, &PostParams::default(), &to_object(body)?)
      .await
      .map_err(classify)?;
    to_value(descriptor, replaced)
  }

  async fn delete(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<(), ClientError> {
    let api = self.api(descriptor, namespace).await?;
    api
      .delete(name, &DeleteParams::default())
      .await
      .map(|_| ())
      .map_err(classify)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use kube::error::ErrorResponse;
  use serde_json::json;
  use std::path::PathBuf;

  fn status(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
      status: "Failure".into(),
      message: format!("{} from the server", reason),
      reason: reason.into(),
      code,
    })
  }

  #[test]
  fn api_statuses_map_to_error_classes() {
    assert!(matches!(classify(status(404, "NotFound")), ClientError::NotFound(_)));
    assert!(matches!(classify(status(403, "Forbidden")), ClientError::Forbidden(_)));
    assert!(matches!(classify(status(401, "Unauthorized")), ClientError::Forbidden(_)));
    assert!(matches!(
      classify(status(409, "AlreadyExists")),
      ClientError::AlreadyExists(_)
    ));
    assert!(matches!(classify(status(409, "Conflict")), ClientError::Conflict(_)));
    assert!(matches!(classify(status(422, "Invalid")), ClientError::Invalid(_)));
    assert!(matches!(classify(status(400, "BadRequest")), ClientError::Invalid(_)));
    assert!(matches!(classify(status(418, "Teapot")), ClientError::Other(_)));
  }

  #[test]
  fn overload_and_timeouts_are_retried() {
    for (code, reason) in [(429, "TooManyRequests"), (500, "InternalError"), (503, "ServiceUnavailable"), (504, "Timeout")] {
      let error = classify(status(code, reason));
      assert!(error.is_retryable(), "{code} {reason}");
      assert!(!error.is_systemic(), "{code} {reason}");
    }
  }

  #[test]
  fn descriptors_address_dynamic_resources() {
    let core = dynamic_resource(&ResourceDescriptor::new("", "v1", "ConfigMap", "configmaps", Scope::Namespaced));
    assert_eq!(core.api_version, "v1");
    assert_eq!(core.plural, "configmaps");

    let custom = dynamic_resource(&ResourceDescriptor::new(
      "acme.io",
      "v1",
      "Certificate",
      "certificates",
      Scope::Namespaced,
    ));
    assert_eq!(custom.api_version, "acme.io/v1");
    assert_eq!(custom.group, "acme.io");
  }

  #[test]
  fn objects_convert_both_ways() {
    let descriptor = ResourceDescriptor::new("apps", "v1", "Deployment", "deployments", Scope::Namespaced);
    let body = json!({
      "apiVersion": "apps/v1",
      "kind": "Deployment",
      "metadata": {"name": "web", "namespace": "shop", "labels": {"app": "web"}},
      "spec": {"replicas": 2},
    });
    let object = to_object(&body).unwrap();
    assert_eq!(object.metadata.name.as_deref(), Some("web"));
    assert_eq!(to_value(&descriptor, object).unwrap(), body);

    let listed = to_object(&json!({"metadata": {"name": "api"}, "spec": {}})).unwrap();
    let listed = to_value(&descriptor, listed).unwrap();
    assert_eq!(listed["apiVersion"], "apps/v1");
    assert_eq!(listed["kind"], "Deployment");

    assert!(matches!(to_object(&json!("just a string")), Err(ClientError::Invalid(_))));
  }

  #[tokio::test]
  async fn unreadable_kubeconfig_is_a_transport_error() {
    let config = ClusterConfig {
      kubeconfig: Some(PathBuf::from("/nonexistent/kubeconfig-for-tests")),
      ..ClusterConfig::default()
    };
    let client = KubeClient::new(config);

    let err = client.api_group_versions().await.unwrap_err();
    assert!(err.is_systemic(), "unexpected error: {err}");
    assert!(err.to_string().contains("kubeconfig-for-tests"));
  }
}
