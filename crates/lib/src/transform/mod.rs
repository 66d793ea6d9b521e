//! Transform engine.
//!
//! Runs every exported manifest through the ordered plugin chain and writes the
//! result to a transform directory with the same layout. Resources are processed
//! concurrently; the plugins of one resource run strictly in order, each seeing
//! the output of the previous one.

pub mod builtin;
pub mod external;
pub mod flags;
pub mod patch;
pub mod plugin;
pub mod report;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::consts::{MAX_WORKERS, TRANSFORM_REPORT};
use crate::resource::Resource;
use crate::tree::{ResourceTree, TreeEntry, TreeError};

pub use flags::TransformFlags;
pub use patch::{PatchError, PatchOp, apply_patch};
pub use plugin::{
  PluginContext, PluginError, PluginMetadata, PluginOrigin, PluginRegistry, PluginResponse, RegisteredPlugin,
  TransformPlugin,
};
pub use report::{PluginFailure, ResourceReport, TransformReport};

#[derive(Debug, Error)]
pub enum TransformError {
  #[error("failed to load flags file {path}: {message}")]
  Flags { path: PathBuf, message: String },

  #[error("unknown optional field '{0}'")]
  UnknownOptional(String),

  #[error("transform directory must differ from the export directory ({0})")]
  SameDirectory(PathBuf),

  #[error(transparent)]
  Tree(#[from] TreeError),
}

/// Run-wide transform settings.
#[derive(Debug, Clone)]
pub struct TransformOptions {
  pub context: PluginContext,
  /// Optional field groups whose patches are applied.
  pub enabled_optionals: BTreeSet<String>,
  pub workers: usize,
}

impl Default for TransformOptions {
  fn default() -> Self {
    Self {
      context: PluginContext::default(),
      enabled_optionals: BTreeSet::new(),
      workers: MAX_WORKERS,
    }
  }
}

impl TransformOptions {
  /// Options carrying the flags file values, with no optional group enabled.
  pub fn from_flags(flags: &TransformFlags) -> Self {
    Self {
      context: PluginContext {
        optionals: flags.optionals.clone(),
        extras: flags.extras.clone(),
      },
      ..Self::default()
    }
  }

  /// Enable optional groups: the `requested` ones, or every declared one when `all`.
  ///
  /// Values given in `requested` override the flags file. A group enabled without
  /// any value gets `"true"`.
  pub fn enable_optionals(
    &mut self,
    registry: &PluginRegistry,
    requested: &BTreeMap<String, String>,
    all: bool,
  ) -> Result<(), TransformError> {
    let declared = registry.optional_keys();
    if let Some(unknown) = requested.keys().find(|key| !declared.contains(key)) {
      return Err(TransformError::UnknownOptional(unknown.clone()));
    }

    let keys: Vec<String> = if all {
      declared
    } else {
      requested.keys().cloned().collect()
    };
    for key in keys {
      let value = requested
        .get(&key)
        .or_else(|| self.context.optionals.get(&key))
        .cloned()
        .unwrap_or_else(|| "true".to_string());
      self.context.optionals.insert(key.clone(), value);
      self.enabled_optionals.insert(key);
    }
    Ok(())
  }
}

/// Run the plugin chain over one resource.
///
/// Returns the report entry and the transformed resource, `None` on whiteout.
async fn transform_one(
  entry: TreeEntry,
  plugins: &[RegisteredPlugin],
  options: &TransformOptions,
) -> (ResourceReport, Option<Resource>) {
  let mut current = entry.resource;
  let mut report = ResourceReport {
    path: entry.rel_path.to_string_lossy().replace('\\', "/"),
    kind: current.kind().to_string(),
    namespace: current.namespace().map(str::to_string),
    name: current.name().to_string(),
    ..Default::default()
  };

  for registered in plugins {
    let plugin = registered.name();
    if !registered.plugin.applies(&current) {
      continue;
    }

    let response = match registered.plugin.run(&current, &options.context).await {
      Ok(response) => response,
      Err(e) => {
        warn!(plugin, path = %report.path, error = %e, "plugin failed");
        report.errors.push(PluginFailure {
          plugin: plugin.to_string(),
          error: e.to_string(),
        });
        continue;
      }
    };

    if response.whiteout {
      debug!(plugin, path = %report.path, "whiteout");
      report.whiteout = true;
      report.whiteout_by = Some(plugin.to_string());
      return (report, None);
    }

    let mut ops = response.patches;
    for (key, optional_ops) in response.optional_patches {
      if options.enabled_optionals.contains(&key) {
        ops.extend(optional_ops);
      } else if !report.optionals_available.contains(&key) {
        report.optionals_available.push(key);
      }
    }
    if ops.is_empty() {
      continue;
    }

    let mut doc = current.body().clone();
    let applied = apply_patch(&mut doc, &ops)
      .map_err(|source| PluginError::Patch {
        plugin: plugin.to_string(),
        source,
      })
      .and_then(|()| {
        Resource::from_value(doc).map_err(|e| PluginError::Protocol {
          plugin: plugin.to_string(),
          message: format!("patched object is invalid: {}", e),
        })
      });

    match applied {
      Ok(next) => {
        current = next;
        report.plugins.push(plugin.to_string());
      }
      Err(e) => {
        warn!(plugin, path = %report.path, error = %e, "patch discarded");
        report.errors.push(PluginFailure {
          plugin: plugin.to_string(),
          error: e.to_string(),
        });
      }
    }
  }

  (report, Some(current))
}

/// Transform every manifest of `source` into `output`.
pub async fn transform(
  source: &ResourceTree,
  output: &ResourceTree,
  registry: &PluginRegistry,
  options: &TransformOptions,
) -> Result<TransformReport, TransformError> {
  if source.root() == output.root() {
    return Err(TransformError::SameDirectory(output.root().to_path_buf()));
  }

  let contents = source.read_resources()?;
  output.clear()?;

  // Failure records travel with the tree so every exported identifier stays accounted for.
  for record in source.read_failures()? {
    output.write_failure(&record)?;
  }

  let plugins: Arc<Vec<RegisteredPlugin>> = Arc::new(registry.ordered().to_vec());
  let options = Arc::new(options.clone());
  let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
  let mut join_set = JoinSet::new();

  for entry in contents.entries {
    let plugins = plugins.clone();
    let options = options.clone();
    let semaphore = semaphore.clone();
    let output = output.clone();
    join_set.spawn(async move {
      let _permit = semaphore.acquire().await.ok();
      let rel_path = entry.rel_path.clone();
      let (report, transformed) = transform_one(entry, &plugins, &options).await;
      if let Some(resource) = transformed {
        output.write_at(&rel_path, resource.body())?;
      }
      Ok::<_, TreeError>(report)
    });
  }

  let mut report = TransformReport {
    optionals: options.enabled_optionals.iter().cloned().collect(),
    invalid: contents
      .invalid
      .into_iter()
      .map(|invalid| PluginFailure {
        plugin: String::new(),
        error: format!("{}: {}", invalid.rel_path.display(), invalid.error),
      })
      .collect(),
    ..Default::default()
  };

  let mut fatal = None;
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(Ok(entry)) => report.resources.push(entry),
      Ok(Err(e)) => {
        error!(error = %e, "cannot write transform output");
        if fatal.is_none() {
          fatal = Some(e);
          join_set.abort_all();
        }
      }
      Err(e) if e.is_cancelled() => {}
      Err(e) => error!(error = %e, "transform task panicked"),
    }
  }
  if let Some(e) = fatal {
    return Err(e.into());
  }

  report.finalize();
  report.write(&output.root().join(TRANSFORM_REPORT))?;
  info!(
    resources = report.summary.resources,
    whiteouts = report.summary.whiteouts,
    plugin_errors = report.summary.plugin_errors,
    "transform complete"
  );
  Ok(report)
}
