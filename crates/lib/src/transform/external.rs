//! Out-of-process plugins.
//!
//! Every executable in the plugin directory is a plugin. The protocol is JSON
//! over stdio:
//!
//! - `<exe> metadata` prints [`PluginMetadata`].
//! - `<exe>` reads `{"resource": ..., "optionals": {...}, "extras": {...}}` on
//!   stdin and prints `{"version", "isWhiteOut", "patches", "optionalPatches"}`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::resource::Resource;

use super::plugin::{PluginContext, PluginError, PluginMetadata, PluginOrigin, PluginResponse, TransformPlugin};

/// Upper bound for one plugin invocation.
pub const PLUGIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct PluginRequest<'a> {
  resource: &'a Value,
  optionals: &'a std::collections::BTreeMap<String, String>,
  extras: &'a std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExternalPlugin {
  path: PathBuf,
  metadata: PluginMetadata,
}

impl ExternalPlugin {
  /// Load a plugin by asking the executable for its metadata.
  pub async fn load(path: &Path) -> Result<Self, PluginError> {
    let label = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| path.display().to_string());
    let stdout = invoke(&label, path, &["metadata"], None).await?;
    let metadata: PluginMetadata = serde_json::from_slice(&stdout).map_err(|e| PluginError::Protocol {
      plugin: label.clone(),
      message: format!("invalid metadata: {}", e),
    })?;
    if metadata.name.trim().is_empty() {
      return Err(PluginError::Protocol {
        plugin: label,
        message: "metadata has an empty name".into(),
      });
    }
    debug!(plugin = %metadata.name, path = %path.display(), "loaded external plugin");
    Ok(Self {
      path: path.to_path_buf(),
      metadata,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

async fn invoke(plugin: &str, path: &Path, args: &[&str], stdin: Option<Vec<u8>>) -> Result<Vec<u8>, PluginError> {
  let mut command = Command::new(path);
  command
    .args(args)
    .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  trace!(plugin, path = %path.display(), ?args, "invoking plugin");

  let spawn_error = |source| PluginError::Spawn {
    plugin: plugin.to_string(),
    path: path.display().to_string(),
    source,
  };
  let mut child = command.spawn().map_err(spawn_error)?;

  // Input is fed while output drains, so a plugin that writes before it reads
  // cannot fill its stdout pipe and stall.
  let pending = stdin.zip(child.stdin.take());
  let feed = async move {
    if let Some((input, mut pipe)) = pending
      && let Err(e) = pipe.write_all(&input).await
    {
      trace!(plugin, error = %e, "plugin closed stdin before reading all input");
    }
  };
  let run = async {
    let (_, output) = tokio::join!(feed, child.wait_with_output());
    output
  };

  let output = match tokio::time::timeout(PLUGIN_TIMEOUT, run).await {
    Ok(result) => result.map_err(spawn_error)?,
    Err(_) => {
      return Err(PluginError::Timeout {
        plugin: plugin.to_string(),
      });
    }
  };

  if !output.status.success() {
    return Err(PluginError::Exit {
      plugin: plugin.to_string(),
      code: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(output.stdout)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  path
    .metadata()
    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
  path.is_file()
}

/// Load every executable in `dir`, sorted by file name.
///
/// A missing directory yields no plugins.
pub async fn discover_plugins(dir: &Path) -> Vec<Result<ExternalPlugin, PluginError>> {
  let Ok(entries) = std::fs::read_dir(dir) else {
    debug!(dir = %dir.display(), "plugin directory not readable, no external plugins");
    return Vec::new();
  };
  let mut paths: Vec<PathBuf> = entries
    .filter_map(Result::ok)
    .map(|e| e.path())
    .filter(|p| is_executable(p))
    .collect();
  paths.sort();

  let mut plugins = Vec::with_capacity(paths.len());
  for path in paths {
    plugins.push(ExternalPlugin::load(&path).await);
  }
  plugins
}

#[async_trait]
impl TransformPlugin for ExternalPlugin {
  fn metadata(&self) -> &PluginMetadata {
    &self.metadata
  }

  fn origin(&self) -> PluginOrigin {
    PluginOrigin::External
  }

  async fn run(&self, resource: &Resource, ctx: &PluginContext) -> Result<PluginResponse, PluginError> {
    let request = PluginRequest {
      resource: resource.body(),
      optionals: &ctx.optionals,
      extras: &ctx.extras,
    };
    let input = serde_json::to_vec(&request).map_err(|e| PluginError::Protocol {
      plugin: self.metadata.name.clone(),
      message: e.to_string(),
    })?;
    let stdout = invoke(&self.metadata.name, &self.path, &[], Some(input)).await?;
    serde_json::from_slice(&stdout).map_err(|e| PluginError::Protocol {
      plugin: self.metadata.name.clone(),
      message: e.to_string(),
    })
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::transform::patch::PatchOp;
  use serde_json::json;
  use std::os::unix::fs::PermissionsExt;
  use tempfile::TempDir;

  fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  const LABELLER: &str = r#"
if [ "$1" = "metadata" ]; then
  echo '{"name": "labeller", "version": "v2", "priority": 50}'
  exit 0
fi
cat > /dev/null
echo '{"version": "v2", "isWhiteOut": false, "patches": [{"op": "add", "path": "/metadata/labels", "value": {"migrated": "true"}}]}'
"#;

  #[tokio::test]
  async fn loads_metadata_and_runs() {
    let temp = TempDir::new().unwrap();
    let path = write_script(temp.path(), "labeller", LABELLER);

    let plugin = ExternalPlugin::load(&path).await.unwrap();
    assert_eq!(plugin.metadata().name, "labeller");
    assert_eq!(plugin.metadata().priority, Some(50));

    let resource = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}})).unwrap();
    let response = plugin.run(&resource, &PluginContext::default()).await.unwrap();
    assert_eq!(
      response.patches,
      vec![PatchOp::add("/metadata/labels", json!({"migrated": "true"}))]
    );
  }

  #[tokio::test]
  async fn failing_plugin_reports_exit() {
    let temp = TempDir::new().unwrap();
    let path = write_script(temp.path(), "broken", "echo boom >&2\nexit 3");
    let err = ExternalPlugin::load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::Exit { code: Some(3), ref stderr, .. } if stderr == "boom"));
  }

  #[tokio::test]
  async fn chatty_plugin_does_not_stall_on_large_input() {
    let temp = TempDir::new().unwrap();
    // 128 KiB of stderr before the input is read, more than a pipe buffer holds.
    let body = r#"
if [ "$1" = "metadata" ]; then
  echo '{"name": "chatty", "version": "v2"}'
  exit 0
fi
head -c 131072 /dev/zero >&2
cat > /dev/null
echo '{"version": "v2", "isWhiteOut": false, "patches": []}'
"#;
    let path = write_script(temp.path(), "chatty", body);
    let plugin = ExternalPlugin::load(&path).await.unwrap();

    let payload = "y".repeat(256 * 1024);
    let resource = Resource::from_value(json!({
      "apiVersion": "v1", "kind": "ConfigMap",
      "metadata": {"name": "big"},
      "data": {"blob": payload}
    }))
    .unwrap();
    let response = tokio::time::timeout(
      std::time::Duration::from_secs(20),
      plugin.run(&resource, &PluginContext::default()),
    )
    .await
    .expect("plugin stalled")
    .unwrap();
    assert!(response.patches.is_empty());
  }

  #[tokio::test]
  async fn plugin_ignoring_its_input_still_answers() {
    let temp = TempDir::new().unwrap();
    let body = r#"
if [ "$1" = "metadata" ]; then
  echo '{"name": "deaf", "version": "v2"}'
  exit 0
fi
echo '{"version": "v2", "isWhiteOut": true, "patches": []}'
"#;
    let path = write_script(temp.path(), "deaf", body);
    let plugin = ExternalPlugin::load(&path).await.unwrap();

    let resource = Resource::from_value(json!({
      "apiVersion": "v1", "kind": "ConfigMap",
      "metadata": {"name": "big"},
      "data": {"blob": "z".repeat(256 * 1024)}
    }))
    .unwrap();
    let response = plugin.run(&resource, &PluginContext::default()).await.unwrap();
    assert!(response.whiteout);
  }

  #[tokio::test]
  async fn discovery_skips_non_executables() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "labeller", LABELLER);
    std::fs::write(temp.path().join("README"), "not a plugin").unwrap();

    let plugins = discover_plugins(temp.path()).await;
    assert_eq!(plugins.len(), 1);
    assert!(plugins[0].is_ok());
    assert!(discover_plugins(&temp.path().join("missing")).await.is_empty());
  }
}
