//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the export and transform
/// trees, the plugin directory and the flags file.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  pub fn read_file(&self, relative_path: &str) -> String {
    std::fs::read_to_string(self.temp.path().join(relative_path))
      .unwrap_or_else(|e| panic!("Failed to read {}: {}", relative_path, e))
  }

  pub fn exists(&self, relative_path: &str) -> bool {
    self.temp.path().join(relative_path).exists()
  }

  fn dir(&self, name: &str) -> PathBuf {
    let p = self.temp.path().join(name);
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn export_dir(&self) -> PathBuf {
    self.dir("export")
  }

  pub fn transform_dir(&self) -> PathBuf {
    self.temp.path().join("transform")
  }

  /// Plugin directory, empty unless a test installs a plugin.
  pub fn plugin_dir(&self) -> PathBuf {
    self.dir("plugins")
  }

  /// Install an executable plugin script.
  #[cfg(unix)]
  pub fn install_plugin(&self, name: &str, script: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = self.plugin_dir().join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  }

  /// Get a pre-configured Command for the kubectl-migrate binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `XDG_CONFIG_HOME`/`HOME`: keep the default plugin directory inside the temp dir
  /// - `KUBECONFIG` and the in-cluster variables removed, so no test reaches a real cluster
  /// - `KUBECTL`: a binary that does not exist
  pub fn migrate_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("kubectl-migrate");
    cmd.env("XDG_CONFIG_HOME", self.dir("config"));
    cmd.env("HOME", self.temp.path());
    cmd.env("KUBECTL", self.temp.path().join("no-kubectl"));
    cmd.env_remove("KUBECONFIG");
    cmd.env_remove("KUBERNETES_SERVICE_HOST");
    cmd.env_remove("KUBERNETES_SERVICE_PORT");
    cmd.env_remove("RUST_LOG");
    cmd
  }
}
