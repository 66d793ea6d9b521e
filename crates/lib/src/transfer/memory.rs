//! In-memory [`DataPlane`] for tests.
//!
//! Claims hold a flat map of file paths to contents. Streams are real tar
//! archives built and unpacked with the `tar` crate, so the relay and checksum
//! path is the same one a cluster data plane goes through.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::client::ClientError;
use crate::util::hash::hash_bytes;

use super::TransferError;
use super::plane::{ClaimInfo, DataPlane, DataSink, DataStream, Endpoint, EndpointSpec, FileDigests};

/// Points where a failure or stall can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
  CreateClaim,
  Provision,
  Read,
  Write,
  Finish,
  Checksum,
  Teardown,
}

#[derive(Debug, Default)]
struct Claim {
  info: Option<ClaimInfo>,
  files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
  claims: BTreeMap<(String, String), Claim>,
  /// Endpoint name -> (session, endpoint).
  endpoints: BTreeMap<String, (String, Endpoint)>,
  failing: BTreeSet<Stage>,
  stalled: BTreeSet<Stage>,
  break_after: Option<usize>,
  corrupt: bool,
}

/// Shared in-memory environment. Clones see the same state.
#[derive(Debug, Clone)]
pub struct MemoryDataPlane {
  environment: String,
  state: Arc<Mutex<State>>,
}

fn join(root: &str, path: &str) -> String {
  if root.is_empty() {
    path.to_string()
  } else {
    format!("{}/{}", root, path)
  }
}

/// Files of `claim` under `root`, keyed by path relative to `root`.
fn files_under<'a>(claim: &'a Claim, root: &'a str) -> impl Iterator<Item = (&'a str, &'a Vec<u8>)> {
  claim.files.iter().filter_map(move |(path, data)| {
    if root.is_empty() {
      Some((path.as_str(), data))
    } else {
      path
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rel| (rel, data))
    }
  })
}

fn tar_error(e: std::io::Error) -> TransferError {
  TransferError::Stream(format!("tar: {}", e))
}

impl MemoryDataPlane {
  pub fn new(environment: &str) -> Self {
    Self {
      environment: environment.to_string(),
      state: Arc::new(Mutex::new(State::default())),
    }
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn add_claim(&self, info: ClaimInfo) {
    let key = (info.namespace.clone(), info.name.clone());
    self.state().claims.entry(key).or_default().info = Some(info);
  }

  pub fn put_file(&self, namespace: &str, claim: &str, path: &str, data: &[u8]) {
    self
      .state()
      .claims
      .entry((namespace.to_string(), claim.to_string()))
      .or_default()
      .files
      .insert(path.to_string(), data.to_vec());
  }

  pub fn file(&self, namespace: &str, claim: &str, path: &str) -> Option<Vec<u8>> {
    self
      .state()
      .claims
      .get(&(namespace.to_string(), claim.to_string()))
      .and_then(|c| c.files.get(path).cloned())
  }

  pub fn claim_info(&self, namespace: &str, claim: &str) -> Option<ClaimInfo> {
    self
      .state()
      .claims
      .get(&(namespace.to_string(), claim.to_string()))
      .and_then(|c| c.info.clone())
  }

  /// Transient endpoints currently present.
  pub fn transient_count(&self) -> usize {
    self.state().endpoints.len()
  }

  pub fn fail_at(&self, stage: Stage) {
    self.state().failing.insert(stage);
  }

  /// Make `stage` never complete.
  pub fn stall_at(&self, stage: Stage) {
    self.state().stalled.insert(stage);
  }

  /// Source streams error out after `bytes`.
  pub fn break_stream_after(&self, bytes: usize) {
    self.state().break_after = Some(bytes);
  }

  /// Received files are stored with altered content.
  pub fn corrupt_writes(&self) {
    self.state().corrupt = true;
  }

  async fn enter(&self, stage: Stage) -> Result<(), TransferError> {
    let (failing, stalled) = {
      let state = self.state();
      (state.failing.contains(&stage), state.stalled.contains(&stage))
    };
    if stalled {
      std::future::pending::<()>().await;
    }
    if failing {
      return Err(TransferError::Cluster(ClientError::Unavailable(format!(
        "injected failure at {:?}",
        stage
      ))));
    }
    Ok(())
  }

  fn endpoint_claim<'a>(state: &'a State, endpoint: &Endpoint) -> Result<&'a Claim, TransferError> {
    if !state.endpoints.contains_key(&endpoint.name) {
      return Err(TransferError::Stream(format!("endpoint {} is gone", endpoint.name)));
    }
    state
      .claims
      .get(&(endpoint.namespace.clone(), endpoint.claim.clone()))
      .ok_or_else(|| TransferError::Stream(format!("claim {} is gone", endpoint.claim)))
  }
}

/// Reader that fails on every read.
struct BrokenReader;

impl AsyncRead for BrokenReader {
  fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Err(std::io::Error::new(
      std::io::ErrorKind::ConnectionReset,
      "connection reset",
    )))
  }
}

/// Buffers the incoming archive and unpacks it on `finish`.
struct MemorySink {
  buffer: Vec<u8>,
  plane: MemoryDataPlane,
  endpoint: Endpoint,
}

impl AsyncWrite for MemorySink {
  fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    self.get_mut().buffer.extend_from_slice(buf);
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }
}

#[async_trait]
impl DataSink for MemorySink {
  async fn finish(&mut self) -> Result<(), TransferError> {
    self.plane.enter(Stage::Finish).await?;

    let mut files = Vec::new();
    let mut archive = tar::Archive::new(Cursor::new(std::mem::take(&mut self.buffer)));
    for entry in archive.entries().map_err(tar_error)? {
      let mut entry = entry.map_err(tar_error)?;
      if !entry.header().entry_type().is_file() {
        continue;
      }
      let path = entry.path().map_err(tar_error)?.to_string_lossy().trim_start_matches("./").to_string();
      let mut data = Vec::new();
      entry.read_to_end(&mut data).map_err(tar_error)?;
      files.push((path, data));
    }

    let mut state = self.plane.state();
    let corrupt = state.corrupt;
    let key = (self.endpoint.namespace.clone(), self.endpoint.claim.clone());
    let claim = state.claims.entry(key).or_default();
    for (path, mut data) in files {
      if corrupt {
        data.push(b'!');
      }
      claim.files.insert(join(&self.endpoint.root, &path), data);
    }
    Ok(())
  }
}

#[async_trait]
impl DataPlane for MemoryDataPlane {
  fn environment(&self) -> &str {
    &self.environment
  }

  async fn claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, TransferError> {
    Ok(self.claim_info(namespace, name))
  }

  async fn create_claim(&self, claim: &ClaimInfo) -> Result<(), TransferError> {
    self.enter(Stage::CreateClaim).await?;
    self.add_claim(claim.clone());
    Ok(())
  }

  async fn provision_endpoint(&self, spec: &EndpointSpec) -> Result<Endpoint, TransferError> {
    self.enter(Stage::Provision).await?;
    let mut state = self.state();
    if !state
      .claims
      .get(&(spec.namespace.clone(), spec.claim.clone()))
      .is_some_and(|c| c.info.is_some())
    {
      return Err(TransferError::EndpointNotReady {
        name: spec.name.clone(),
        message: format!("claim {}/{} does not exist", spec.namespace, spec.claim),
      });
    }
    if state.endpoints.contains_key(&spec.name) {
      return Err(TransferError::Cluster(ClientError::AlreadyExists(spec.name.clone())));
    }
    let endpoint = Endpoint {
      name: spec.name.clone(),
      namespace: spec.namespace.clone(),
      claim: spec.claim.clone(),
      role: spec.role,
      root: spec.path.clone(),
    };
    state
      .endpoints
      .insert(spec.name.clone(), (spec.session.clone(), endpoint.clone()));
    Ok(endpoint)
  }

  async fn open_reader(&self, endpoint: &Endpoint) -> Result<DataStream, TransferError> {
    self.enter(Stage::Read).await?;
    let state = self.state();
    let claim = Self::endpoint_claim(&state, endpoint)?;

    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files_under(claim, &endpoint.root) {
      let mut header = tar::Header::new_gnu();
      header.set_size(data.len() as u64);
      header.set_mode(0o644);
      builder
        .append_data(&mut header, path, data.as_slice())
        .map_err(tar_error)?;
    }
    let mut archive = builder.into_inner().map_err(tar_error)?;

    match state.break_after {
      Some(limit) if limit < archive.len() => {
        archive.truncate(limit);
        Ok(Box::new(AsyncReadExt::chain(Cursor::new(archive), BrokenReader)))
      }
      _ => Ok(Box::new(Cursor::new(archive))),
    }
  }

  async fn open_writer(&self, endpoint: &Endpoint) -> Result<Box<dyn DataSink>, TransferError> {
    self.enter(Stage::Write).await?;
    Self::endpoint_claim(&self.state(), endpoint)?;
    Ok(Box::new(MemorySink {
      buffer: Vec::new(),
      plane: self.clone(),
      endpoint: endpoint.clone(),
    }))
  }

  async fn file_digests(&self, endpoint: &Endpoint) -> Result<FileDigests, TransferError> {
    self.enter(Stage::Checksum).await?;
    let state = self.state();
    let claim = Self::endpoint_claim(&state, endpoint)?;
    Ok(
      files_under(claim, &endpoint.root)
        .map(|(path, data)| (path.to_string(), hash_bytes(data)))
        .collect(),
    )
  }

  async fn teardown(&self, session: &str, namespace: &str) -> Result<usize, TransferError> {
    self.enter(Stage::Teardown).await?;
    let mut state = self.state();
    let before = state.endpoints.len();
    state
      .endpoints
      .retain(|_, (owner, endpoint)| owner != session || endpoint.namespace != namespace);
    Ok(before - state.endpoints.len())
  }
}
