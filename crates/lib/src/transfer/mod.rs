//! Volume content transfer between two environments.
//!
//! A [`TransferSession`] moves the files of one persistent volume claim from a
//! source [`DataPlane`] to a destination one:
//!
//! ```text
//! Pending -> Provisioning -> Transferring -> Verifying -> Complete
//!                  \               \              \
//!                   +---------------+--------------+--> Failed
//! ```
//!
//! Provisioning starts a transient endpoint mounting the claim on each side. The
//! tar stream read from the source endpoint is relayed through this process to
//! the destination endpoint, then both sides hash their files. Verification
//! compares the source files with their counterparts at the destination; files
//! the destination already held are left out. Every transient object carries
//! the session label, and teardown of both sides runs after every terminal
//! state, including timeout and cancellation.

pub mod kubectl;
pub mod memory;
pub mod plane;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::config::transfer_image;
use crate::consts::{MAX_NAME_LEN, TRANSFER_NAME_PREFIX};
use crate::util::hash::{ContentHash, StreamHasher, content_checksum};

pub use kubectl::KubectlDataPlane;
pub use memory::{MemoryDataPlane, Stage};
pub use plane::{ClaimInfo, DataPlane, DataSink, DataStream, Endpoint, EndpointRole, EndpointSpec, FileDigests};

/// Overall limit for one transfer unless the caller sets one.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Limit for tearing down one side.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

const RELAY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
  #[error("claim {namespace}/{name} not found in {environment}")]
  ClaimNotFound {
    environment: String,
    namespace: String,
    name: String,
  },

  #[error(transparent)]
  Cluster(#[from] ClientError),

  #[error("endpoint {name} did not become ready: {message}")]
  EndpointNotReady { name: String, message: String },

  #[error("stream failed: {0}")]
  Stream(String),

  #[error("checksum mismatch: source {expected}, destination {actual} ({missing} files missing)")]
  ChecksumMismatch {
    expected: ContentHash,
    actual: ContentHash,
    missing: usize,
  },

  #[error("transfer timed out after {}s", .0.as_secs())]
  Timeout(Duration),

  #[error("transfer cancelled")]
  Cancelled,

  #[error("invalid session transition {from} -> {to}")]
  InvalidTransition { from: TransferState, to: TransferState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
  Pending,
  Provisioning,
  Transferring,
  Verifying,
  Complete,
  Failed,
}

impl TransferState {
  pub fn is_terminal(self) -> bool {
    matches!(self, TransferState::Complete | TransferState::Failed)
  }

  fn next(self) -> Option<TransferState> {
    match self {
      TransferState::Pending => Some(TransferState::Provisioning),
      TransferState::Provisioning => Some(TransferState::Transferring),
      TransferState::Transferring => Some(TransferState::Verifying),
      TransferState::Verifying => Some(TransferState::Complete),
      TransferState::Complete | TransferState::Failed => None,
    }
  }
}

impl std::fmt::Display for TransferState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      TransferState::Pending => "pending",
      TransferState::Provisioning => "provisioning",
      TransferState::Transferring => "transferring",
      TransferState::Verifying => "verifying",
      TransferState::Complete => "complete",
      TransferState::Failed => "failed",
    };
    write!(f, "{}", name)
  }
}

/// Namespace and name of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimRef {
  pub namespace: String,
  pub name: String,
}

impl std::fmt::Display for ClaimRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.namespace, self.name)
  }
}

/// Parameters of one transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
  pub claim: ClaimRef,
  /// Defaults to the source claim.
  pub destination: Option<ClaimRef>,
  /// Directory inside the source volume, `/` when unset.
  pub source_path: Option<String>,
  pub destination_path: Option<String>,
  /// Image for the transient endpoints.
  pub endpoint_image: String,
  /// Storage class remap used when the destination claim has to be created.
  pub storage_class_map: BTreeMap<String, String>,
  pub timeout: Duration,
  pub teardown_timeout: Duration,
}

impl TransferRequest {
  pub fn new(namespace: impl Into<String>, claim: impl Into<String>) -> Self {
    Self {
      claim: ClaimRef {
        namespace: namespace.into(),
        name: claim.into(),
      },
      destination: None,
      source_path: None,
      destination_path: None,
      endpoint_image: transfer_image(),
      storage_class_map: BTreeMap::new(),
      timeout: DEFAULT_TRANSFER_TIMEOUT,
      teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
    }
  }

  pub fn destination_claim(&self) -> ClaimRef {
    self.destination.clone().unwrap_or_else(|| self.claim.clone())
  }
}

/// State and outcome of one transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
  /// Random id, used as the session label value.
  pub id: String,
  /// `kmigrate-transfer-<claim>-<id>`.
  pub name: String,
  pub source_environment: String,
  pub destination_environment: String,
  pub claim: ClaimRef,
  pub destination_claim: ClaimRef,
  /// Both endpoints once provisioned.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tunnel: Option<String>,
  pub state: TransferState,
  /// Stage the session was in when it failed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failed_in: Option<TransferState>,
  pub bytes_transferred: u64,
  /// SHA-256 of the relayed tar stream.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stream_digest: Option<ContentHash>,
  /// Verified content checksum, identical on both ends.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub checksum: Option<ContentHash>,
  pub claim_created: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Transient objects removed by teardown, both sides.
  pub removed: usize,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub teardown_errors: Vec<String>,
}

impl TransferSession {
  pub fn new(source_environment: &str, destination_environment: &str, request: &TransferRequest) -> Self {
    let id = session_id();
    Self {
      name: transient_name(&request.claim.name, &id, None),
      id,
      source_environment: source_environment.to_string(),
      destination_environment: destination_environment.to_string(),
      claim: request.claim.clone(),
      destination_claim: request.destination_claim(),
      tunnel: None,
      state: TransferState::Pending,
      failed_in: None,
      bytes_transferred: 0,
      stream_digest: None,
      checksum: None,
      claim_created: false,
      error: None,
      removed: 0,
      teardown_errors: Vec::new(),
    }
  }

  /// Move to the next stage. Skipping stages or leaving a terminal state is an error.
  pub fn advance(&mut self, to: TransferState) -> Result<(), TransferError> {
    if self.state.next() != Some(to) {
      return Err(TransferError::InvalidTransition { from: self.state, to });
    }
    debug!(session = %self.id, from = %self.state, to = %to, "session transition");
    self.state = to;
    Ok(())
  }

  /// Record `error` and move to `Failed`. A terminal session is left unchanged.
  pub fn fail(&mut self, error: &TransferError) {
    if self.state.is_terminal() {
      return;
    }
    warn!(session = %self.id, stage = %self.state, error = %error, "transfer failed");
    self.failed_in = Some(self.state);
    self.state = TransferState::Failed;
    self.error = Some(error.to_string());
  }

  pub fn is_complete(&self) -> bool {
    self.state == TransferState::Complete
  }
}

fn session_id() -> String {
  uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

/// Transient object name: `kmigrate-transfer-<claim>-<session>[-src|-dst]`.
///
/// The claim part is shortened so the result fits in a DNS label.
pub fn transient_name(claim: &str, session: &str, role: Option<EndpointRole>) -> String {
  let suffix = match role {
    Some(EndpointRole::Source) => "-src",
    Some(EndpointRole::Destination) => "-dst",
    None => "",
  };
  let fixed = TRANSFER_NAME_PREFIX.len() + 1 + 1 + session.len() + suffix.len();
  let budget = MAX_NAME_LEN.saturating_sub(fixed);
  let claim: String = claim.chars().take(budget).collect();
  let claim = claim.trim_end_matches(['-', '.']);
  format!("{}-{}-{}{}", TRANSFER_NAME_PREFIX, claim, session, suffix)
}

/// Normalized directory inside a volume: no leading or trailing slashes.
fn volume_path(path: Option<&str>) -> String {
  path.unwrap_or("").trim_matches('/').to_string()
}

/// Checksum of the sent files and of the same paths as received.
///
/// Paths only the destination has do not contribute. Returns the number of
/// sent files the destination lacks as well.
fn compare_digests(sent: &FileDigests, received: &FileDigests) -> (ContentHash, ContentHash, usize) {
  let expected = content_checksum(sent.iter().map(|(path, hash)| (path, hash.clone())));
  let counterparts: Vec<(&String, ContentHash)> = sent
    .keys()
    .filter_map(|path| received.get(path).map(|hash| (path, hash.clone())))
    .collect();
  let missing = sent.len() - counterparts.len();
  (expected, content_checksum(counterparts), missing)
}

/// Copy a tar stream into `sink`, counting and hashing the bytes.
async fn relay(
  mut reader: DataStream,
  sink: &mut dyn DataSink,
  transferred: &mut u64,
) -> Result<ContentHash, TransferError> {
  let mut hasher = StreamHasher::new();
  let mut buffer = vec![0u8; RELAY_BUFFER];
  loop {
    let read = reader
      .read(&mut buffer)
      .await
      .map_err(|e| TransferError::Stream(format!("reading from source: {}", e)))?;
    if read == 0 {
      break;
    }
    sink
      .write_all(&buffer[..read])
      .await
      .map_err(|e| TransferError::Stream(format!("writing to destination: {}", e)))?;
    hasher.update(&buffer[..read]);
    *transferred += read as u64;
  }
  Ok(hasher.finish())
}

async fn run_stages(
  source: &dyn DataPlane,
  destination: &dyn DataPlane,
  request: &TransferRequest,
  session: &mut TransferSession,
) -> Result<(), TransferError> {
  session.advance(TransferState::Provisioning)?;

  let claim = source
    .claim(&session.claim.namespace, &session.claim.name)
    .await?
    .ok_or_else(|| TransferError::ClaimNotFound {
      environment: source.environment().to_string(),
      namespace: session.claim.namespace.clone(),
      name: session.claim.name.clone(),
    })?;

  let target = session.destination_claim.clone();
  if destination.claim(&target.namespace, &target.name).await?.is_none() {
    let wanted = claim.for_destination(&target.namespace, &target.name, &request.storage_class_map);
    info!(
      claim = %target,
      capacity = %wanted.capacity,
      storage_class = ?wanted.storage_class,
      "creating destination claim"
    );
    destination.create_claim(&wanted).await?;
    session.claim_created = true;
  }

  let source_spec = EndpointSpec {
    name: transient_name(&claim.name, &session.id, Some(EndpointRole::Source)),
    session: session.id.clone(),
    namespace: claim.namespace.clone(),
    claim: claim.name.clone(),
    role: EndpointRole::Source,
    path: volume_path(request.source_path.as_deref()),
    image: request.endpoint_image.clone(),
  };
  let destination_spec = EndpointSpec {
    name: transient_name(&target.name, &session.id, Some(EndpointRole::Destination)),
    session: session.id.clone(),
    namespace: target.namespace.clone(),
    claim: target.name.clone(),
    role: EndpointRole::Destination,
    path: volume_path(request.destination_path.as_deref()),
    image: request.endpoint_image.clone(),
  };
  let (source_endpoint, destination_endpoint) = tokio::try_join!(
    source.provision_endpoint(&source_spec),
    destination.provision_endpoint(&destination_spec)
  )?;
  session.tunnel = Some(format!(
    "{}/{}/{} -> {}/{}/{}",
    source.environment(),
    source_endpoint.namespace,
    source_endpoint.name,
    destination.environment(),
    destination_endpoint.namespace,
    destination_endpoint.name
  ));

  session.advance(TransferState::Transferring)?;
  let reader = source.open_reader(&source_endpoint).await?;
  let mut sink = destination.open_writer(&destination_endpoint).await?;
  let digest = relay(reader, sink.as_mut(), &mut session.bytes_transferred).await?;
  sink.finish().await?;
  debug!(session = %session.id, bytes = session.bytes_transferred, digest = %digest, "stream relayed");
  session.stream_digest = Some(digest);

  session.advance(TransferState::Verifying)?;
  let (sent, received) = tokio::try_join!(
    source.file_digests(&source_endpoint),
    destination.file_digests(&destination_endpoint)
  )?;
  let (expected, actual, missing) = compare_digests(&sent, &received);
  debug!(
    session = %session.id,
    files = sent.len(),
    unrelated = received.len() - (sent.len() - missing),
    "comparing file digests"
  );
  if expected != actual {
    return Err(TransferError::ChecksumMismatch {
      expected,
      actual,
      missing,
    });
  }
  session.checksum = Some(actual);

  session.advance(TransferState::Complete)
}

/// Remove the session's transient objects from one side. Errors are recorded, never raised.
async fn teardown_side(plane: &dyn DataPlane, namespace: &str, session: &mut TransferSession, limit: Duration) {
  match tokio::time::timeout(limit, plane.teardown(&session.id, namespace)).await {
    Ok(Ok(removed)) => {
      debug!(session = %session.id, environment = %plane.environment(), removed, "teardown complete");
      session.removed += removed;
    }
    Ok(Err(e)) => {
      warn!(session = %session.id, environment = %plane.environment(), error = %e, "teardown failed");
      session.teardown_errors.push(format!("{}: {}", plane.environment(), e));
    }
    Err(_) => {
      warn!(session = %session.id, environment = %plane.environment(), "teardown timed out");
      session
        .teardown_errors
        .push(format!("{}: teardown timed out after {}s", plane.environment(), limit.as_secs()));
    }
  }
}

/// Run one transfer to a terminal state.
///
/// The returned session is `Complete` or `Failed`; the error of a failed session
/// is in [`TransferSession::error`]. Transient objects on both sides are torn down
/// before returning, whatever the outcome.
pub async fn transfer(
  source: &dyn DataPlane,
  destination: &dyn DataPlane,
  request: &TransferRequest,
  cancel: CancellationToken,
) -> TransferSession {
  let mut session = TransferSession::new(source.environment(), destination.environment(), request);
  info!(
    session = %session.id,
    claim = %session.claim,
    destination = %session.destination_claim,
    from = %session.source_environment,
    to = %session.destination_environment,
    "starting transfer"
  );

  let outcome = tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(TransferError::Cancelled),
    result = tokio::time::timeout(request.timeout, run_stages(source, destination, request, &mut session)) => {
      result.unwrap_or(Err(TransferError::Timeout(request.timeout)))
    }
  };
  if let Err(e) = outcome {
    session.fail(&e);
  }

  // Both sides, even if one hangs or fails. Endpoints live next to their claims.
  let source_namespace = session.claim.namespace.clone();
  let destination_namespace = session.destination_claim.namespace.clone();
  teardown_side(source, &source_namespace, &mut session, request.teardown_timeout).await;
  teardown_side(destination, &destination_namespace, &mut session, request.teardown_timeout).await;

  match session.state {
    TransferState::Complete => info!(
      session = %session.id,
      bytes = session.bytes_transferred,
      checksum = ?session.checksum,
      "transfer complete"
    ),
    _ => warn!(session = %session.id, error = ?session.error, "transfer did not complete"),
  }
  session
}
