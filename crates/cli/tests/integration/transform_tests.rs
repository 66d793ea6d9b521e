//! transform, apply-optionals and list-plugins against on-disk export trees.

use predicates::prelude::*;
use serde_json::Value;

use super::common::TestEnv;

const SERVICE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: shop
  annotations:
    kubectl.kubernetes.io/last-applied-configuration: "{}"
spec:
  type: ClusterIP
  clusterIP: 10.0.0.12
  clusterIPs:
  - 10.0.0.12
  ports:
  - port: 80
"#;

const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: shop
  labels:
    app: web
spec:
  replicas: 2
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      nodeSelector:
        disk: ssd
      containers:
      - name: web
        image: docker.io/library/nginx:1.27
"#;

const OWNED_POD: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: web-7d9f-abcde
  namespace: shop
  ownerReferences:
  - apiVersion: apps/v1
    kind: ReplicaSet
    name: web-7d9f
    uid: 1234
    controller: true
spec:
  nodeName: node-1
  containers:
  - name: web
    image: docker.io/library/nginx:1.27
"#;

fn seed_export(env: &TestEnv) {
  env.write_file("export/resources/shop/Service-web.yaml", SERVICE);
  env.write_file("export/resources/shop/Deployment-web.yaml", DEPLOYMENT);
  env.write_file("export/resources/shop/Pod-web-7d9f-abcde.yaml", OWNED_POD);
}

fn yaml(content: &str) -> Value {
  serde_yaml::from_str(content).unwrap()
}

#[test]
fn transform_strips_cluster_state_and_writes_report() {
  let env = TestEnv::new();
  seed_export(&env);

  env
    .migrate_cmd()
    .arg("transform")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .assert()
    .success()
    .stdout(predicate::str::contains("Transformed"));

  let service = yaml(&env.read_file("transform/resources/shop/Service-web.yaml"));
  assert!(service.pointer("/spec/clusterIP").is_none());
  assert!(service.pointer("/spec/clusterIPs").is_none());
  assert_eq!(service.pointer("/spec/ports/0/port"), Some(&Value::from(80)));
  assert!(
    service
      .pointer("/metadata/annotations/kubectl.kubernetes.io~1last-applied-configuration")
      .is_none()
  );

  // Controller-owned pods are recreated by their controller on the destination.
  assert!(!env.exists("transform/resources/shop/Pod-web-7d9f-abcde.yaml"));

  // Optional groups stay off unless asked for.
  let deployment = yaml(&env.read_file("transform/resources/shop/Deployment-web.yaml"));
  assert_eq!(
    deployment.pointer("/spec/template/spec/nodeSelector/disk"),
    Some(&Value::from("ssd"))
  );

  let report = yaml(&env.read_file("transform/report.yaml"));
  assert_eq!(report.pointer("/summary/resources"), Some(&Value::from(3)));
  assert_eq!(report.pointer("/summary/whiteouts"), Some(&Value::from(1)));
  assert_eq!(report.pointer("/summary/pluginErrors"), Some(&Value::from(0)));
}

#[test]
fn transform_json_output_is_the_report() {
  let env = TestEnv::new();
  seed_export(&env);

  let output = env
    .migrate_cmd()
    .args(["transform", "-o", "json", "--export-dir"])
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .output()
    .unwrap();
  assert!(output.status.success());

  let report: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(report["summary"]["transformed"], 2);
  assert_eq!(report["resources"].as_array().map(Vec::len), Some(3));
}

#[test]
fn transform_into_export_dir_is_rejected() {
  let env = TestEnv::new();
  seed_export(&env);

  env
    .migrate_cmd()
    .arg("transform")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.export_dir())
    .assert()
    .failure()
    .stderr(predicate::str::contains("must differ"));
}

#[test]
fn apply_optionals_enables_requested_groups() {
  let env = TestEnv::new();
  seed_export(&env);

  env
    .migrate_cmd()
    .arg("apply-optionals")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .args(["--optional", "registry-replacement=docker.io/library=mirror.local"])
    .assert()
    .success();

  let deployment = yaml(&env.read_file("transform/resources/shop/Deployment-web.yaml"));
  assert_eq!(
    deployment.pointer("/spec/template/spec/containers/0/image"),
    Some(&Value::from("mirror.local/nginx:1.27"))
  );
  assert!(deployment.pointer("/spec/template/spec/nodeSelector").is_some());
}

#[test]
fn apply_optionals_all_takes_values_from_flags_file() {
  let env = TestEnv::new();
  seed_export(&env);
  let flags = env.write_file(
    "flags.yaml",
    "optionals:\n  registry-replacement: docker.io/library=mirror.local\n",
  );

  env
    .migrate_cmd()
    .arg("apply-optionals")
    .arg("--all")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .arg("--flags-file")
    .arg(&flags)
    .assert()
    .success();

  let deployment = yaml(&env.read_file("transform/resources/shop/Deployment-web.yaml"));
  assert!(deployment.pointer("/spec/template/spec/nodeSelector").is_none());
  assert_eq!(
    deployment.pointer("/spec/template/spec/containers/0/image"),
    Some(&Value::from("mirror.local/nginx:1.27"))
  );
}

#[test]
fn apply_optionals_rejects_unknown_group() {
  let env = TestEnv::new();
  seed_export(&env);

  env
    .migrate_cmd()
    .arg("apply-optionals")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .args(["--optional", "no-such-group"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("unknown optional field 'no-such-group'"));
}

#[test]
fn list_plugins_shows_builtin() {
  let env = TestEnv::new();

  env
    .migrate_cmd()
    .arg("list-plugins")
    .arg("--plugin-dir")
    .arg(env.plugin_dir())
    .assert()
    .success()
    .stdout(predicate::str::contains("kubernetes"))
    .stdout(predicate::str::contains("builtin"))
    .stdout(predicate::str::contains("registry-replacement"));
}

#[cfg(unix)]
const LABEL_PLUGIN: &str = r#"#!/bin/sh
if [ "$1" = "metadata" ]; then
  echo '{"name":"migrated-label","version":"0.1.0","priority":5}'
  exit 0
fi
cat > /dev/null
echo '{"version":"v1","patches":[{"op":"add","path":"/metadata/labels","value":{"migrated":"yes"}}]}'
"#;

#[cfg(unix)]
#[test]
fn external_plugins_are_listed_in_priority_order() {
  let env = TestEnv::new();
  env.install_plugin("migrated-label", LABEL_PLUGIN);

  let output = env
    .migrate_cmd()
    .args(["list-plugins", "-o", "json", "--plugin-dir"])
    .arg(env.plugin_dir())
    .output()
    .unwrap();
  assert!(output.status.success());

  let rows: Value = serde_json::from_slice(&output.stdout).unwrap();
  let names: Vec<&str> = rows
    .as_array()
    .unwrap()
    .iter()
    .filter_map(|row| row["name"].as_str())
    .collect();
  assert_eq!(names, vec!["kubernetes", "migrated-label"]);
  assert_eq!(rows[1]["origin"], "external");
  assert_eq!(rows[1]["priority"], 5);
}

#[cfg(unix)]
#[test]
fn external_plugin_patches_every_resource() {
  let env = TestEnv::new();
  seed_export(&env);
  env.install_plugin("migrated-label", LABEL_PLUGIN);

  env
    .migrate_cmd()
    .arg("transform")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .arg("--plugin-dir")
    .arg(env.plugin_dir())
    .assert()
    .success();

  let service = yaml(&env.read_file("transform/resources/shop/Service-web.yaml"));
  assert_eq!(service.pointer("/metadata/labels/migrated"), Some(&Value::from("yes")));

  let report = yaml(&env.read_file("transform/report.yaml"));
  let plugins = report.pointer("/resources/0/plugins").and_then(Value::as_array).unwrap();
  assert!(plugins.iter().any(|p| p == "migrated-label"));
}

#[cfg(unix)]
#[test]
fn skip_plugins_runs_only_builtins() {
  let env = TestEnv::new();
  seed_export(&env);
  env.install_plugin("migrated-label", LABEL_PLUGIN);

  env
    .migrate_cmd()
    .arg("transform")
    .arg("--skip-plugins")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .arg("--plugin-dir")
    .arg(env.plugin_dir())
    .assert()
    .success();

  let service = yaml(&env.read_file("transform/resources/shop/Service-web.yaml"));
  assert!(service.pointer("/metadata/labels/migrated").is_none());
}

#[cfg(unix)]
#[test]
fn plugin_failing_everywhere_fails_the_run() {
  let env = TestEnv::new();
  env.write_file("export/resources/shop/Service-web.yaml", SERVICE);
  env.write_file("export/resources/shop/Deployment-web.yaml", DEPLOYMENT);
  env.install_plugin(
    "broken",
    "#!/bin/sh\nif [ \"$1\" = \"metadata\" ]; then echo '{\"name\":\"broken\",\"version\":\"1\"}'; exit 0; fi\ncat > /dev/null\nexit 3\n",
  );

  env
    .migrate_cmd()
    .arg("transform")
    .arg("--export-dir")
    .arg(env.export_dir())
    .arg("--transform-dir")
    .arg(env.transform_dir())
    .arg("--plugin-dir")
    .arg(env.plugin_dir())
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed to transform"));

  assert!(env.exists("transform/report.yaml"));
}
