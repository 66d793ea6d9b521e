//! Built-in `kubernetes` plugin.
//!
//! Removes state the destination cluster assigns itself (cluster IPs, node
//! bindings, volume bindings, generated token secrets) and whiteouts objects the
//! destination's controllers recreate on their own.

use async_trait::async_trait;
use serde_json::Value;

use crate::consts::LAST_APPLIED_ANNOTATION;
use crate::resource::Resource;

use super::patch::{PatchOp, escape};
use super::plugin::{
  OptionalField, PluginContext, PluginError, PluginMetadata, PluginOrigin, PluginResponse, TransformPlugin,
};

pub const REGISTRY_REPLACEMENT: &str = "registry-replacement";
pub const STRIP_NODE_SELECTOR: &str = "strip-node-selector";

/// Annotations recording the binding of a claim to a volume on the source.
const PVC_BINDING_ANNOTATIONS: &[&str] = &[
  "pv.kubernetes.io/bind-completed",
  "pv.kubernetes.io/bound-by-controller",
  "volume.beta.kubernetes.io/storage-provisioner",
  "volume.kubernetes.io/storage-provisioner",
  "volume.kubernetes.io/selected-node",
];

const CONTROLLED_KINDS: &[&str] = &["Pod", "ReplicaSet", "Job"];

pub struct KubernetesPlugin {
  metadata: PluginMetadata,
}

impl KubernetesPlugin {
  pub fn new() -> Self {
    Self {
      metadata: PluginMetadata {
        name: "kubernetes".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        priority: None,
        optional_fields: vec![
          OptionalField {
            key: REGISTRY_REPLACEMENT.into(),
            help: "Rewrite container image registries (old=new)".into(),
            example: "docker.io=registry.internal:5000".into(),
          },
          OptionalField {
            key: STRIP_NODE_SELECTOR.into(),
            help: "Remove nodeSelector from pod specs".into(),
            example: "true".into(),
          },
        ],
      },
    }
  }
}

impl Default for KubernetesPlugin {
  fn default() -> Self {
    Self::new()
  }
}

/// Pointer to the pod spec embedded in a workload, if the kind has one.
fn pod_spec_pointer(kind: &str) -> Option<&'static str> {
  match kind {
    "Pod" => Some("/spec"),
    "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "ReplicationController" | "Job"
    | "DeploymentConfig" => Some("/spec/template/spec"),
    "CronJob" => Some("/spec/jobTemplate/spec/template/spec"),
    _ => None,
  }
}

fn is_whiteout(resource: &Resource) -> bool {
  let body = resource.body();
  match resource.kind() {
    kind if CONTROLLED_KINDS.contains(&kind) => resource.has_controller_owner(),
    "Secret" => body["type"].as_str() == Some("kubernetes.io/service-account-token"),
    "ConfigMap" => resource.name() == "kube-root-ca.crt",
    _ => false,
  }
}

fn annotation_removals(resource: &Resource, keys: &[&str]) -> Vec<PatchOp> {
  let annotations = resource.annotations();
  keys
    .iter()
    .filter(|key| annotations.contains_key(**key))
    .map(|key| PatchOp::remove(format!("/metadata/annotations/{}", escape(key))))
    .collect()
}

fn removal_if_present(body: &Value, pointer: &str) -> Option<PatchOp> {
  body.pointer(pointer).map(|_| PatchOp::remove(pointer))
}

fn service_patches(body: &Value) -> Vec<PatchOp> {
  let headless = body["spec"]["clusterIP"].as_str() == Some("None");
  let mut ops = Vec::new();
  if !headless {
    ops.extend(removal_if_present(body, "/spec/clusterIP"));
    ops.extend(removal_if_present(body, "/spec/clusterIPs"));
  }
  ops.extend(removal_if_present(body, "/spec/healthCheckNodePort"));
  ops
}

/// Drop references to the token secrets the source generated for the account.
fn service_account_patches(resource: &Resource) -> Vec<PatchOp> {
  let Some(secrets) = resource.body()["secrets"].as_array() else {
    return Vec::new();
  };
  let generated_prefix = format!("{}-token-", resource.name());
  let kept: Vec<Value> = secrets
    .iter()
    .filter(|s| !s["name"].as_str().is_some_and(|n| n.starts_with(&generated_prefix)))
    .cloned()
    .collect();

  if kept.len() == secrets.len() {
    Vec::new()
  } else if kept.is_empty() {
    vec![PatchOp::remove("/secrets")]
  } else {
    vec![PatchOp::replace("/secrets", Value::Array(kept))]
  }
}

fn image_replacements(body: &Value, spec_pointer: &str, mapping: &str) -> Vec<PatchOp> {
  let Some((old, new)) = mapping.split_once('=') else {
    return Vec::new();
  };
  let mut ops = Vec::new();
  for list in ["containers", "initContainers"] {
    let pointer = format!("{}/{}", spec_pointer, list);
    let Some(containers) = body.pointer(&pointer).and_then(Value::as_array) else {
      continue;
    };
    for (index, container) in containers.iter().enumerate() {
      if let Some(image) = container["image"].as_str()
        && let Some(rest) = image.strip_prefix(old)
      {
        ops.push(PatchOp::replace(
          format!("{}/{}/image", pointer, index),
          Value::String(format!("{}{}", new, rest)),
        ));
      }
    }
  }
  ops
}

#[async_trait]
impl TransformPlugin for KubernetesPlugin {
  fn metadata(&self) -> &PluginMetadata {
    &self.metadata
  }

  fn origin(&self) -> PluginOrigin {
    PluginOrigin::Builtin
  }

  async fn run(&self, resource: &Resource, ctx: &PluginContext) -> Result<PluginResponse, PluginError> {
    let mut response = PluginResponse {
      version: self.metadata.version.clone(),
      ..Default::default()
    };
    if is_whiteout(resource) {
      response.whiteout = true;
      return Ok(response);
    }

    let body = resource.body();
    response.patches = annotation_removals(resource, &[LAST_APPLIED_ANNOTATION]);
    match resource.kind() {
      "Service" => response.patches.extend(service_patches(body)),
      "Pod" => response.patches.extend(removal_if_present(body, "/spec/nodeName")),
      "PersistentVolumeClaim" => {
        response.patches.extend(removal_if_present(body, "/spec/volumeName"));
        response.patches.extend(annotation_removals(resource, PVC_BINDING_ANNOTATIONS));
      }
      "ServiceAccount" => response.patches.extend(service_account_patches(resource)),
      _ => {}
    }

    if let Some(spec) = pod_spec_pointer(resource.kind()) {
      if let Some(mapping) = ctx.optionals.get(REGISTRY_REPLACEMENT) {
        let ops = image_replacements(body, spec, mapping);
        if !ops.is_empty() {
          response.optional_patches.insert(REGISTRY_REPLACEMENT.into(), ops);
        }
      }
      let node_selector = format!("{}/nodeSelector", spec);
      if let Some(op) = removal_if_present(body, &node_selector) {
        response.optional_patches.insert(STRIP_NODE_SELECTOR.into(), vec![op]);
      }
    }

    Ok(response)
  }
}
