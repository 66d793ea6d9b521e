//! Transform plugin contract and registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resource::Resource;

use super::builtin::KubernetesPlugin;
use super::external::discover_plugins;
use super::flags::TransformFlags;
use super::patch::{PatchError, PatchOp};

/// Priority of built-in plugins unless overridden.
pub const BUILTIN_PRIORITY: i32 = 0;

/// Priority of external plugins that do not declare one.
pub const EXTERNAL_PRIORITY: i32 = 1000;

#[derive(Debug, Error)]
pub enum PluginError {
  #[error("plugin {plugin}: failed to run {path}: {source}")]
  Spawn {
    plugin: String,
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("plugin {plugin} exited with {code:?}: {stderr}")]
  Exit {
    plugin: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("plugin {plugin} timed out")]
  Timeout { plugin: String },

  #[error("plugin {plugin} returned an invalid response: {message}")]
  Protocol { plugin: String, message: String },

  #[error("plugin {plugin}: patch not applied: {source}")]
  Patch {
    plugin: String,
    #[source]
    source: PatchError,
  },
}

/// An optional patch group a plugin offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionalField {
  pub key: String,
  #[serde(default)]
  pub help: String,
  #[serde(default)]
  pub example: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub priority: Option<i32>,
  #[serde(default)]
  pub optional_fields: Vec<OptionalField>,
}

/// Where a plugin came from. Built-ins sort before external plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginOrigin {
  Builtin,
  External,
}

impl std::fmt::Display for PluginOrigin {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PluginOrigin::Builtin => write!(f, "builtin"),
      PluginOrigin::External => write!(f, "external"),
    }
  }
}

/// Inputs shared by every plugin invocation of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginContext {
  /// Values of the optional fields enabled for this run.
  pub optionals: BTreeMap<String, String>,
  /// Free-form values from the flags file, passed through untouched.
  pub extras: BTreeMap<String, String>,
}

/// What a plugin wants done to one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResponse {
  #[serde(default)]
  pub version: String,
  #[serde(default, rename = "isWhiteOut")]
  pub whiteout: bool,
  #[serde(default)]
  pub patches: Vec<PatchOp>,
  /// Patches only applied when their optional field is enabled.
  #[serde(default)]
  pub optional_patches: BTreeMap<String, Vec<PatchOp>>,
}

#[async_trait]
pub trait TransformPlugin: Send + Sync {
  fn metadata(&self) -> &PluginMetadata;

  fn origin(&self) -> PluginOrigin;

  /// Whether the plugin wants to see `resource` at all.
  fn applies(&self, _resource: &Resource) -> bool {
    true
  }

  async fn run(&self, resource: &Resource, ctx: &PluginContext) -> Result<PluginResponse, PluginError>;
}

/// A plugin with its effective priority.
#[derive(Clone)]
pub struct RegisteredPlugin {
  pub plugin: Arc<dyn TransformPlugin>,
  pub priority: i32,
}

impl RegisteredPlugin {
  pub fn name(&self) -> &str {
    &self.plugin.metadata().name
  }

  fn sort_key(&self) -> (i32, PluginOrigin, String) {
    (self.priority, self.plugin.origin(), self.name().to_string())
  }
}

/// Ordered set of plugins for one run.
#[derive(Clone, Default)]
pub struct PluginRegistry {
  plugins: Vec<RegisteredPlugin>,
  /// Plugins found in the plugin directory that could not be loaded.
  load_errors: Vec<String>,
}

impl PluginRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry holding only the built-in plugins.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register(Arc::new(KubernetesPlugin::new()));
    registry
  }

  /// Built-ins plus every executable plugin in `plugin_dir`, adjusted by `flags`.
  pub async fn load(plugin_dir: Option<&Path>, flags: &TransformFlags) -> Self {
    let mut registry = Self::with_builtins();
    if let Some(dir) = plugin_dir {
      for loaded in discover_plugins(dir).await {
        match loaded {
          Ok(plugin) if registry.is_builtin(&plugin.metadata().name) => {
            let message = format!(
              "plugin {} uses the name of the built-in plugin {}",
              plugin.path().display(),
              plugin.metadata().name
            );
            warn!(path = %plugin.path().display(), plugin = %plugin.metadata().name, "external plugin shadows a built-in, skipping");
            registry.load_errors.push(message);
          }
          Ok(plugin) => registry.register(Arc::new(plugin)),
          Err(e) => {
            warn!(error = %e, "skipping plugin");
            registry.load_errors.push(e.to_string());
          }
        }
      }
    }
    registry.apply_flags(flags);
    info!(plugins = registry.plugins.len(), "plugins loaded");
    registry
  }

  /// Add a plugin at its declared (or default) priority, replacing one with the same name.
  pub fn register(&mut self, plugin: Arc<dyn TransformPlugin>) {
    let default = match plugin.origin() {
      PluginOrigin::Builtin => BUILTIN_PRIORITY,
      PluginOrigin::External => EXTERNAL_PRIORITY,
    };
    let priority = plugin.metadata().priority.unwrap_or(default);
    let name = plugin.metadata().name.clone();
    if self.plugins.iter().any(|p| p.name() == name) {
      warn!(plugin = %name, origin = %plugin.origin(), "replacing a registered plugin with the same name");
      self.plugins.retain(|p| p.name() != name);
    }
    debug!(plugin = %name, priority, "registered plugin");
    self.plugins.push(RegisteredPlugin { plugin, priority });
    self.plugins.sort_by_key(RegisteredPlugin::sort_key);
  }

  fn is_builtin(&self, name: &str) -> bool {
    self
      .plugins
      .iter()
      .any(|p| p.name() == name && p.plugin.origin() == PluginOrigin::Builtin)
  }

  /// Drop disabled plugins and apply priority overrides.
  pub fn apply_flags(&mut self, flags: &TransformFlags) {
    self.plugins.retain(|p| !flags.disabled_plugins.iter().any(|d| d == p.name()));
    for plugin in &mut self.plugins {
      if let Some(priority) = flags.priorities.get(plugin.name()) {
        plugin.priority = *priority;
      }
    }
    self.plugins.sort_by_key(RegisteredPlugin::sort_key);
  }

  /// Plugins in execution order.
  pub fn ordered(&self) -> &[RegisteredPlugin] {
    &self.plugins
  }

  pub fn load_errors(&self) -> &[String] {
    &self.load_errors
  }

  /// Every optional field key declared by a registered plugin.
  pub fn optional_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self
      .plugins
      .iter()
      .flat_map(|p| p.plugin.metadata().optional_fields.iter().map(|f| f.key.clone()))
      .collect();
    keys.sort();
    keys.dedup();
    keys
  }
}
