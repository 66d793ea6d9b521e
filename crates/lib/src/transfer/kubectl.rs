//! [`DataPlane`] backed by a real cluster.
//!
//! Endpoints are pods running [`transfer_image`](crate::config::transfer_image)
//! with the claim mounted at `/data`. Object management goes through the
//! rate-limited [`ClusterClient`]; the streams are `kubectl exec` pipes whose
//! stdio this process relays, so both clusters only need to be reachable from
//! the machine running the transfer. An exec that exits unsuccessfully fails
//! the stream with its stderr.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::{ClientError, ClusterClient};
use crate::config::ClusterConfig;
use crate::consts::{APP_NAME, TRANSFER_SESSION_LABEL};
use crate::resource::{ResourceDescriptor, Scope};
use crate::util::hash::ContentHash;

use super::TransferError;
use super::plane::{ClaimInfo, DataPlane, DataSink, DataStream, Endpoint, EndpointRole, EndpointSpec, FileDigests};

/// Where endpoints mount the claim.
pub const MOUNT_PATH: &str = "/data";

const CONTAINER: &str = "endpoint";

fn claims() -> ResourceDescriptor {
  ResourceDescriptor::new("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", Scope::Namespaced)
}

fn pods() -> ResourceDescriptor {
  ResourceDescriptor::new("", "v1", "Pod", "pods", Scope::Namespaced)
}

fn claim_from_object(object: &Value) -> ClaimInfo {
  let spec = &object["spec"];
  ClaimInfo {
    namespace: object["metadata"]["namespace"].as_str().unwrap_or_default().to_string(),
    name: object["metadata"]["name"].as_str().unwrap_or_default().to_string(),
    capacity: spec["resources"]["requests"]["storage"]
      .as_str()
      .unwrap_or_default()
      .to_string(),
    storage_class: spec["storageClassName"].as_str().map(str::to_string),
    access_modes: spec["accessModes"]
      .as_array()
      .map(|modes| modes.iter().filter_map(Value::as_str).map(str::to_string).collect())
      .unwrap_or_default(),
  }
}

fn claim_manifest(claim: &ClaimInfo) -> Value {
  let mut spec = json!({
    "accessModes": claim.access_modes,
    "resources": {"requests": {"storage": claim.capacity}},
  });
  if let Some(class) = &claim.storage_class {
    spec["storageClassName"] = Value::String(class.clone());
  }
  json!({
    "apiVersion": "v1",
    "kind": "PersistentVolumeClaim",
    "metadata": {"name": claim.name, "namespace": claim.namespace},
    "spec": spec,
  })
}

/// Directory inside the endpoint container for a volume sub-path.
fn mount_dir(path: &str) -> String {
  if path.is_empty() {
    MOUNT_PATH.to_string()
  } else {
    format!("{}/{}", MOUNT_PATH, path)
  }
}

/// Pod manifest for one endpoint.
pub fn endpoint_pod(spec: &EndpointSpec) -> Value {
  let read_only = spec.role == EndpointRole::Source;
  let mut labels = Map::new();
  labels.insert(TRANSFER_SESSION_LABEL.into(), Value::String(spec.session.clone()));
  labels.insert("app.kubernetes.io/managed-by".into(), Value::String(APP_NAME.into()));
  labels.insert("kmigrate.io/transfer-role".into(), Value::String(spec.role.to_string()));

  json!({
    "apiVersion": "v1",
    "kind": "Pod",
    "metadata": {"name": spec.name, "namespace": spec.namespace, "labels": labels},
    "spec": {
      "restartPolicy": "Never",
      "terminationGracePeriodSeconds": 0,
      "containers": [{
        "name": CONTAINER,
        "image": spec.image,
        "command": ["sleep", "2147483647"],
        "volumeMounts": [{"name": "data", "mountPath": MOUNT_PATH, "readOnly": read_only}],
      }],
      "volumes": [{
        "name": "data",
        "persistentVolumeClaim": {"claimName": spec.claim, "readOnly": read_only},
      }],
    },
  })
}

/// Readiness of an endpoint pod: `Ok(true)` ready, `Ok(false)` not yet, `Err` never.
fn pod_readiness(pod: &Value) -> Result<bool, String> {
  match pod["status"]["phase"].as_str() {
    Some("Failed") | Some("Succeeded") => {
      return Err(format!(
        "pod terminated: {}",
        pod["status"]["message"].as_str().unwrap_or("no message")
      ));
    }
    Some("Running") => {}
    _ => return Ok(false),
  }
  let ready = pod["status"]["conditions"].as_array().is_some_and(|conditions| {
    conditions
      .iter()
      .any(|c| c["type"].as_str() == Some("Ready") && c["status"].as_str() == Some("True"))
  });
  Ok(ready)
}

/// Prints one `sha256sum` line per regular file under `$1`.
const DIGEST_SCRIPT: &str = r#"cd "$1" && find . -type f -exec sha256sum {} +"#;

const UNPACK_SCRIPT: &str = r#"mkdir -p "$1" && tar -C "$1" -xf -"#;

/// One cluster's side of a transfer.
pub struct KubectlDataPlane {
  client: Arc<dyn ClusterClient>,
  config: ClusterConfig,
  ready_timeout: Duration,
  poll_interval: Duration,
}

impl KubectlDataPlane {
  pub fn new(client: Arc<dyn ClusterClient>, config: ClusterConfig) -> Self {
    Self {
      client,
      config,
      ready_timeout: Duration::from_secs(300),
      poll_interval: Duration::from_secs(2),
    }
  }

  /// How long a provisioned endpoint may take to become ready.
  pub fn with_ready_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
    self.ready_timeout = timeout;
    self.poll_interval = poll_interval;
    self
  }

  fn exec_command(&self, endpoint: &Endpoint, interactive: bool, script: &[&str]) -> Command {
    let mut command = Command::new(&self.config.kubectl);
    command
      .args(self.config.kubectl_args())
      .arg("exec")
      .arg(format!("--namespace={}", endpoint.namespace))
      .arg(format!("--container={}", CONTAINER));
    if interactive {
      command.arg("-i");
    }
    command
      .arg(&endpoint.name)
      .arg("--")
      .args(script)
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    trace!(pod = %endpoint.name, ?script, "kubectl exec");
    command
  }

  fn spawn(&self, mut command: Command) -> Result<Child, TransferError> {
    command.spawn().map_err(|e| {
      TransferError::Cluster(ClientError::Transport(format!(
        "failed to run {}: {}",
        self.config.kubectl.display(),
        e
      )))
    })
  }

  async fn wait_ready(&self, spec: &EndpointSpec) -> Result<(), TransferError> {
    let deadline = tokio::time::Instant::now() + self.ready_timeout;
    loop {
      let pod = self.client.get(&pods(), Some(&spec.namespace), &spec.name).await?;
      match pod.as_ref().map(pod_readiness) {
        Some(Ok(true)) => return Ok(()),
        Some(Err(message)) => {
          return Err(TransferError::EndpointNotReady {
            name: spec.name.clone(),
            message,
          });
        }
        Some(Ok(false)) | None => {}
      }
      if tokio::time::Instant::now() >= deadline {
        return Err(TransferError::EndpointNotReady {
          name: spec.name.clone(),
          message: format!("not ready after {}s", self.ready_timeout.as_secs()),
        });
      }
      tokio::time::sleep(self.poll_interval).await;
    }
  }
}

/// Map the stderr of a failed `kubectl exec` to an error class.
fn classify_exec_failure(stderr: &str) -> ClientError {
  let message = stderr.to_string();
  if stderr.contains("(NotFound)") {
    ClientError::NotFound(message)
  } else if stderr.contains("(Forbidden)") || stderr.contains("(Unauthorized)") {
    ClientError::Forbidden(message)
  } else if ["(ServiceUnavailable)", "(InternalError)", "(TooManyRequests)", "(Timeout)"]
    .iter()
    .any(|reason| stderr.contains(reason))
  {
    ClientError::Unavailable(message)
  } else if [
    "Unable to connect",
    "connection refused",
    "i/o timeout",
    "TLS handshake timeout",
    "context deadline exceeded",
    "no route to host",
  ]
  .iter()
  .any(|marker| stderr.contains(marker))
  {
    ClientError::Transport(message)
  } else {
    ClientError::Other(message)
  }
}

/// Wait for an exec child while draining its stderr.
///
/// Resolves to `Err` with the stderr text when the child exits unsuccessfully.
fn supervise(mut child: Child, what: &'static str) -> JoinHandle<Result<(), String>> {
  let stderr = child.stderr.take();
  tokio::spawn(async move {
    let drain = async {
      let mut text = String::new();
      if let Some(mut pipe) = stderr {
        let _ = pipe.read_to_string(&mut text).await;
      }
      text
    };
    let (status, text) = tokio::join!(child.wait(), drain);
    match status {
      Ok(status) if status.success() => Ok(()),
      Ok(status) => {
        debug!(what, %status, stderr = %text.trim(), "kubectl exec failed");
        Err(format!("{} failed ({}): {}", what, status, text.trim()))
      }
      Err(e) => Err(format!("{} did not exit cleanly: {}", what, e)),
    }
  })
}

fn exit_error(outcome: Result<Result<(), String>, tokio::task::JoinError>) -> Option<String> {
  match outcome {
    Ok(Ok(())) => None,
    Ok(Err(message)) => Some(message),
    Err(e) => Some(e.to_string()),
  }
}

/// Source side: stdout of `kubectl exec ... tar -c`.
///
/// End of stream is only reported once the exec has exited successfully.
struct ExecReader {
  stdout: ChildStdout,
  exit: Option<JoinHandle<Result<(), String>>>,
}

impl AsyncRead for ExecReader {
  fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    let before = buf.filled().len();
    ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
    if buf.filled().len() > before || buf.remaining() == 0 {
      return Poll::Ready(Ok(()));
    }
    let Some(exit) = self.exit.as_mut() else {
      return Poll::Ready(Ok(()));
    };
    let outcome = ready!(Pin::new(exit).poll(cx));
    self.exit = None;
    match exit_error(outcome) {
      None => Poll::Ready(Ok(())),
      Some(message) => Poll::Ready(Err(std::io::Error::other(message))),
    }
  }
}

impl Drop for ExecReader {
  fn drop(&mut self) {
    if let Some(exit) = self.exit.take() {
      exit.abort();
    }
  }
}

/// Destination side: stdin of `kubectl exec -i ... tar -x`.
struct ExecSink {
  stdin: Option<ChildStdin>,
  exit: Option<JoinHandle<Result<(), String>>>,
}

fn closed_pipe() -> std::io::Error {
  std::io::Error::new(std::io::ErrorKind::BrokenPipe, "endpoint stream already closed")
}

impl AsyncWrite for ExecSink {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    match self.stdin.as_mut() {
      Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
      None => Poll::Ready(Err(closed_pipe())),
    }
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.stdin.as_mut() {
      Some(stdin) => Pin::new(stdin).poll_flush(cx),
      None => Poll::Ready(Ok(())),
    }
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.stdin.as_mut() {
      Some(stdin) => Pin::new(stdin).poll_shutdown(cx),
      None => Poll::Ready(Ok(())),
    }
  }
}

impl Drop for ExecSink {
  fn drop(&mut self) {
    if let Some(exit) = self.exit.take() {
      exit.abort();
    }
  }
}

#[async_trait]
impl DataSink for ExecSink {
  async fn finish(&mut self) -> Result<(), TransferError> {
    // Closing stdin ends the archive for tar.
    drop(self.stdin.take());
    let Some(exit) = self.exit.take() else {
      return Ok(());
    };
    match exit_error(exit.await) {
      None => Ok(()),
      Some(message) => Err(TransferError::Stream(message)),
    }
  }
}

#[async_trait]
impl DataPlane for KubectlDataPlane {
  fn environment(&self) -> &str {
    self.config.display_name()
  }

  async fn claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, TransferError> {
    let object = self.client.get(&claims(), Some(namespace), name).await?;
    Ok(object.as_ref().map(claim_from_object))
  }

  async fn create_claim(&self, claim: &ClaimInfo) -> Result<(), TransferError> {
    self
      .client
      .create(&claims(), Some(&claim.namespace), &claim_manifest(claim))
      .await?;
    Ok(())
  }

  async fn provision_endpoint(&self, spec: &EndpointSpec) -> Result<Endpoint, TransferError> {
    debug!(pod = %spec.name, namespace = %spec.namespace, claim = %spec.claim, role = %spec.role, "provisioning endpoint");
    self
      .client
      .create(&pods(), Some(&spec.namespace), &endpoint_pod(spec))
      .await?;
    self.wait_ready(spec).await?;
    Ok(Endpoint {
      name: spec.name.clone(),
      namespace: spec.namespace.clone(),
      claim: spec.claim.clone(),
      role: spec.role,
      root: mount_dir(&spec.path),
    })
  }

  async fn open_reader(&self, endpoint: &Endpoint) -> Result<DataStream, TransferError> {
    let mut command = self.exec_command(endpoint, false, &["tar", "-C", endpoint.root.as_str(), "-cf", "-", "."]);
    command.stdin(Stdio::null()).stdout(Stdio::piped());
    let mut child = self.spawn(command)?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| TransferError::Stream("kubectl exec has no stdout".into()))?;
    Ok(Box::new(ExecReader {
      stdout,
      exit: Some(supervise(child, "packing source")),
    }))
  }

  async fn open_writer(&self, endpoint: &Endpoint) -> Result<Box<dyn DataSink>, TransferError> {
    let mut command = self.exec_command(endpoint, true, &["sh", "-c", UNPACK_SCRIPT, "unpack", endpoint.root.as_str()]);
    command.stdin(Stdio::piped()).stdout(Stdio::null());
    let mut child = self.spawn(command)?;
    let stdin = child.stdin.take();
    Ok(Box::new(ExecSink {
      stdin,
      exit: Some(supervise(child, "unpacking")),
    }))
  }

  async fn file_digests(&self, endpoint: &Endpoint) -> Result<FileDigests, TransferError> {
    let mut command = self.exec_command(endpoint, false, &["sh", "-c", DIGEST_SCRIPT, "digest", endpoint.root.as_str()]);
    command.stdin(Stdio::null()).stdout(Stdio::piped());
    let output = self
      .spawn(command)?
      .wait_with_output()
      .await
      .map_err(|e| TransferError::Stream(format!("hashing files: {}", e)))?;
    if !output.status.success() {
      return Err(TransferError::Cluster(classify_exec_failure(
        String::from_utf8_lossy(&output.stderr).trim(),
      )));
    }
    parse_digests(&String::from_utf8_lossy(&output.stdout))
  }

  async fn teardown(&self, session: &str, namespace: &str) -> Result<usize, TransferError> {
    let selector = format!("{}={}", TRANSFER_SESSION_LABEL, session);
    let items = self.client.list(&pods(), Some(namespace), Some(&selector)).await?;
    let mut removed = 0;
    let mut last_error = None;
    for item in items {
      let name = item["metadata"]["name"].as_str().unwrap_or_default();
      match self.client.delete(&pods(), Some(namespace), name).await {
        Ok(()) | Err(ClientError::NotFound(_)) => removed += 1,
        Err(e) => {
          warn!(pod = %name, namespace = %namespace, error = %e, "failed to delete endpoint");
          last_error = Some(e);
        }
      }
    }
    match last_error {
      Some(e) => Err(e.into()),
      None => Ok(removed),
    }
  }
}

/// Parse `sha256sum` lines (`<digest>  ./<path>`).
fn parse_digests(stdout: &str) -> Result<FileDigests, TransferError> {
  let mut digests = FileDigests::new();
  for line in stdout.lines().filter(|line| !line.is_empty()) {
    let parsed = line.split_once("  ").and_then(|(digest, path)| {
      let valid = digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit());
      valid.then(|| (path.trim_start_matches("./").to_string(), ContentHash(digest.to_ascii_lowercase())))
    });
    match parsed {
      Some((path, digest)) => {
        digests.insert(path, digest);
      }
      None => return Err(TransferError::Stream(format!("unexpected sha256sum output: {:?}", line))),
    }
  }
  Ok(digests)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::MemoryCluster;

  fn cluster() -> Arc<MemoryCluster> {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    cluster.insert(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "shop"}}));
    cluster
  }

  fn plane(cluster: Arc<MemoryCluster>) -> KubectlDataPlane {
    KubectlDataPlane::new(cluster, ClusterConfig::default())
      .with_ready_timeout(Duration::from_millis(30), Duration::from_millis(5))
  }

  fn spec(session: &str) -> EndpointSpec {
    EndpointSpec {
      name: format!("kmigrate-transfer-data-{}-src", session),
      session: session.into(),
      namespace: "shop".into(),
      claim: "data".into(),
      role: EndpointRole::Source,
      path: "uploads".into(),
      image: "busybox:1.36".into(),
    }
  }

  #[test]
  fn endpoint_pod_mounts_claim_read_only_for_source() {
    let pod = endpoint_pod(&spec("abcd1234"));
    assert_eq!(pod["metadata"]["labels"][TRANSFER_SESSION_LABEL], "abcd1234");
    assert_eq!(pod["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"], "data");
    assert_eq!(pod["spec"]["containers"][0]["volumeMounts"][0]["readOnly"], true);

    let mut destination = spec("abcd1234");
    destination.role = EndpointRole::Destination;
    let pod = endpoint_pod(&destination);
    assert_eq!(pod["spec"]["containers"][0]["volumeMounts"][0]["readOnly"], false);
    assert_eq!(pod["metadata"]["labels"]["kmigrate.io/transfer-role"], "destination");
  }

  #[test]
  fn readiness_follows_phase_and_conditions() {
    assert_eq!(pod_readiness(&json!({"status": {}})), Ok(false));
    assert_eq!(pod_readiness(&json!({"status": {"phase": "Running"}})), Ok(false));
    assert_eq!(
      pod_readiness(&json!({"status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}})),
      Ok(true)
    );
    assert!(pod_readiness(&json!({"status": {"phase": "Failed", "message": "OOMKilled"}})).is_err());
  }

  #[test]
  fn digest_lines_are_parsed() {
    let empty = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    let other = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    let digests = parse_digests(&format!("{}  ./empty\n{}  ./dir/with two  spaces\n", empty, other)).unwrap();
    assert_eq!(digests["empty"].0, empty);
    assert_eq!(digests["dir/with two  spaces"].0, other);
    assert!(parse_digests("").unwrap().is_empty());
    assert!(parse_digests("sha256sum: not found").is_err());
  }

  #[test]
  fn exec_failures_are_classified() {
    assert!(matches!(
      classify_exec_failure("Error from server (NotFound): pods \"x\" not found"),
      ClientError::NotFound(_)
    ));
    assert!(classify_exec_failure("dial tcp 10.0.0.1:443: i/o timeout").is_systemic());
    assert!(classify_exec_failure("net/http: TLS handshake timeout").is_systemic());
    assert!(matches!(classify_exec_failure("find: ./x: Permission denied"), ClientError::Other(_)));
  }

  #[test]
  fn claims_round_trip_through_manifests() {
    let claim = ClaimInfo {
      namespace: "shop".into(),
      name: "data".into(),
      capacity: "10Gi".into(),
      storage_class: Some("standard".into()),
      access_modes: vec!["ReadWriteOnce".into()],
    };
    assert_eq!(claim_from_object(&claim_manifest(&claim)), claim);
    assert_eq!(mount_dir(""), "/data");
    assert_eq!(mount_dir("a/b"), "/data/a/b");
  }

  #[tokio::test]
  async fn claims_are_read_and_created_through_the_client() {
    let cluster = cluster();
    let plane = plane(cluster.clone());
    assert!(plane.claim("shop", "data").await.unwrap().is_none());

    let claim = ClaimInfo {
      namespace: "shop".into(),
      name: "data".into(),
      capacity: "1Gi".into(),
      storage_class: None,
      access_modes: vec!["ReadWriteOnce".into()],
    };
    plane.create_claim(&claim).await.unwrap();
    assert_eq!(plane.claim("shop", "data").await.unwrap(), Some(claim));
  }

  #[tokio::test]
  async fn unready_endpoint_is_removed_by_teardown() {
    let cluster = cluster();
    let plane = plane(cluster.clone());

    let err = plane.provision_endpoint(&spec("abcd1234")).await.unwrap_err();
    assert!(matches!(err, TransferError::EndpointNotReady { .. }));
    assert_eq!(cluster.count("Pod", Some("shop")), 1);

    // Another session's endpoint must survive.
    let _ = plane.provision_endpoint(&spec("ffff0000")).await;
    assert_eq!(plane.teardown("abcd1234", "shop").await.unwrap(), 1);
    assert_eq!(cluster.count("Pod", Some("shop")), 1);
    assert_eq!(plane.teardown("ffff0000", "shop").await.unwrap(), 1);
    assert_eq!(cluster.count("Pod", Some("shop")), 0);
  }

  /// Credentials that may only list inside a namespace.
  struct NamespaceScoped(Arc<MemoryCluster>);

  #[async_trait]
  impl ClusterClient for NamespaceScoped {
    async fn api_group_versions(&self) -> Result<Vec<String>, ClientError> {
      self.0.api_group_versions().await
    }

    async fn api_resources(&self, group_version: &str) -> Result<Vec<crate::client::ApiResource>, ClientError> {
      self.0.api_resources(group_version).await
    }

    async fn list(
      &self,
      descriptor: &ResourceDescriptor,
      namespace: Option<&str>,
      label_selector: Option<&str>,
    ) -> Result<Vec<Value>, ClientError> {
      if namespace.is_none() && matches!(descriptor.scope, Scope::Namespaced) {
        return Err(ClientError::Forbidden(format!(
          "{} is forbidden at the cluster scope",
          descriptor.resource
        )));
      }
      self.0.list(descriptor, namespace, label_selector).await
    }

    async fn get(
      &self,
      descriptor: &ResourceDescriptor,
      namespace: Option<&str>,
      name: &str,
    ) -> Result<Option<Value>, ClientError> {
      self.0.get(descriptor, namespace, name).await
    }

    async fn create(
      &self,
      descriptor: &ResourceDescriptor,
      namespace: Option<&str>,
      body: &Value,
    ) -> Result<Value, ClientError> {
      self.0.create(descriptor, namespace, body).await
    }

    async fn update(
      &self,
      descriptor: &ResourceDescriptor,
      namespace: Option<&str>,
      body: &Value,
    ) -> Result<Value, ClientError> {
      self.0.update(descriptor, namespace, body).await
    }

    async fn delete(
      &self,
      descriptor: &ResourceDescriptor,
      namespace: Option<&str>,
      name: &str,
    ) -> Result<(), ClientError> {
      self.0.delete(descriptor, namespace, name).await
    }
  }

  #[tokio::test]
  async fn teardown_works_with_namespace_scoped_credentials() {
    let cluster = cluster();
    let plane = KubectlDataPlane::new(Arc::new(NamespaceScoped(cluster.clone())), ClusterConfig::default())
      .with_ready_timeout(Duration::from_millis(30), Duration::from_millis(5));

    let _ = plane.provision_endpoint(&spec("abcd1234")).await;
    assert_eq!(cluster.count("Pod", Some("shop")), 1);

    assert_eq!(plane.teardown("abcd1234", "shop").await.unwrap(), 1);
    assert_eq!(cluster.count("Pod", Some("shop")), 0);
  }

  #[cfg(unix)]
  fn fake_kubectl(dir: &std::path::Path, body: &str) -> KubectlDataPlane {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("kubectl");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    let config = ClusterConfig {
      kubectl: path,
      ..ClusterConfig::default()
    };
    KubectlDataPlane::new(cluster(), config)
  }

  #[cfg(unix)]
  fn endpoint(role: EndpointRole) -> Endpoint {
    Endpoint {
      name: "kmigrate-transfer-data-abcd1234-src".into(),
      namespace: "shop".into(),
      claim: "data".into(),
      role,
      root: "/data".into(),
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn failed_source_archive_is_a_read_error() {
    let temp = tempfile::TempDir::new().unwrap();
    let plane = fake_kubectl(
      temp.path(),
      "printf partial\necho 'tar: ./secret: Permission denied' >&2\nexit 2\n",
    );

    let mut reader = plane.open_reader(&endpoint(EndpointRole::Source)).await.unwrap();
    let mut bytes = Vec::new();
    let err = reader.read_to_end(&mut bytes).await.unwrap_err();
    assert!(err.to_string().contains("Permission denied"), "{err}");
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn verbose_stderr_does_not_stall_the_source() {
    let temp = tempfile::TempDir::new().unwrap();
    let plane = fake_kubectl(
      temp.path(),
      "i=0\nwhile [ $i -lt 2000 ]; do\n  echo \"tar: removing leading / from member name $i of the archive\" >&2\n  i=$((i+1))\ndone\nprintf archive\n",
    );

    let mut reader = plane.open_reader(&endpoint(EndpointRole::Source)).await.unwrap();
    let mut bytes = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), reader.read_to_end(&mut bytes))
      .await
      .expect("reader stalled")
      .unwrap();
    assert_eq!(bytes, b"archive");
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn failed_unpack_is_reported_by_finish() {
    use tokio::io::AsyncWriteExt;

    let temp = tempfile::TempDir::new().unwrap();
    let plane = fake_kubectl(temp.path(), "cat > /dev/null\necho 'tar: short read' >&2\nexit 1\n");

    let mut sink = plane.open_writer(&endpoint(EndpointRole::Destination)).await.unwrap();
    sink.write_all(b"not really a tar archive").await.unwrap();
    let err = sink.finish().await.unwrap_err();
    assert!(matches!(&err, TransferError::Stream(message) if message.contains("short read")), "{err}");
  }
}
