//! Commands that need a cluster fail with a nonzero status when it cannot be reached.

use predicates::prelude::*;

use super::common::TestEnv;

const CONFIG_MAP: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: shop
data:
  mode: production
"#;

#[test]
fn export_fails_when_cluster_unreachable() {
  let env = TestEnv::new();

  env
    .migrate_cmd()
    .args(["export", "-n", "shop", "--export-dir"])
    .arg(env.export_dir())
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to export namespace shop"));

  assert!(!env.exists("export/resources/shop"));
}

#[test]
fn apply_fails_when_cluster_unreachable() {
  let env = TestEnv::new();
  env.write_file("export/resources/shop/ConfigMap-settings.yaml", CONFIG_MAP);

  env
    .migrate_cmd()
    .arg("apply")
    .arg(env.export_dir())
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to apply"));
}

#[test]
fn transfer_fails_and_reports_session() {
  let env = TestEnv::new();

  env
    .migrate_cmd()
    .args([
      "transfer",
      "data",
      "-n",
      "shop",
      "--source-context",
      "old",
      "--dest-context",
      "new",
      "--timeout",
      "2m",
    ])
    .assert()
    .failure()
    .stdout(predicate::str::contains("kmigrate-transfer-data-"))
    .stderr(predicate::str::contains("transfer"));
}
