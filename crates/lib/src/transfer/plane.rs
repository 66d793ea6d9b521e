//! Data-plane contract for volume transfer.
//!
//! A [`DataPlane`] is one environment's side of a transfer: it can inspect and
//! create volume claims, provision a transient endpoint that mounts a claim,
//! stream the claim's content out of or into that endpoint as a tar archive,
//! hash the files it holds, and remove everything a session created.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::util::hash::ContentHash;

use super::TransferError;

/// Tar stream produced by a source endpoint.
pub type DataStream = Box<dyn AsyncRead + Unpin + Send>;

/// SHA-256 of every regular file under an endpoint root, keyed by relative path.
pub type FileDigests = BTreeMap<String, ContentHash>;

/// Persistent volume claim as seen by the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimInfo {
  pub namespace: String,
  pub name: String,
  /// Requested storage, e.g. `10Gi`.
  pub capacity: String,
  pub storage_class: Option<String>,
  pub access_modes: Vec<String>,
}

impl ClaimInfo {
  /// Copy of this claim for `namespace/name` on another environment.
  ///
  /// The storage class is remapped through `class_map` when it has an entry.
  pub fn for_destination(&self, namespace: &str, name: &str, class_map: &BTreeMap<String, String>) -> Self {
    let storage_class = self
      .storage_class
      .as_ref()
      .map(|class| class_map.get(class).cloned().unwrap_or_else(|| class.clone()));
    Self {
      namespace: namespace.to_string(),
      name: name.to_string(),
      capacity: self.capacity.clone(),
      storage_class,
      access_modes: self.access_modes.clone(),
    }
  }
}

/// Which end of the tunnel an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
  Source,
  Destination,
}

impl std::fmt::Display for EndpointRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EndpointRole::Source => write!(f, "source"),
      EndpointRole::Destination => write!(f, "destination"),
    }
  }
}

/// What to provision for one side of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
  /// Unique transient object name.
  pub name: String,
  /// Session id, attached as a label to every transient object.
  pub session: String,
  pub namespace: String,
  pub claim: String,
  pub role: EndpointRole,
  /// Directory inside the volume to read from or write to.
  pub path: String,
  pub image: String,
}

/// A provisioned, ready endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
  pub name: String,
  pub namespace: String,
  pub claim: String,
  pub role: EndpointRole,
  /// Directory inside the endpoint the stream is rooted at.
  pub root: String,
}

/// Receiving end of a tar stream.
#[async_trait]
pub trait DataSink: AsyncWrite + Unpin + Send {
  /// Flush, close the stream and wait until the endpoint has stored it.
  async fn finish(&mut self) -> Result<(), TransferError>;
}

/// One environment taking part in a transfer.
#[async_trait]
pub trait DataPlane: Send + Sync {
  /// Label for logs and reports (usually the kube context).
  fn environment(&self) -> &str;

  /// Look up a claim, `None` when it does not exist.
  async fn claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, TransferError>;

  async fn create_claim(&self, claim: &ClaimInfo) -> Result<(), TransferError>;

  /// Create a transient endpoint mounting `spec.claim` and wait until it is ready.
  async fn provision_endpoint(&self, spec: &EndpointSpec) -> Result<Endpoint, TransferError>;

  async fn open_reader(&self, endpoint: &Endpoint) -> Result<DataStream, TransferError>;

  async fn open_writer(&self, endpoint: &Endpoint) -> Result<Box<dyn DataSink>, TransferError>;

  async fn file_digests(&self, endpoint: &Endpoint) -> Result<FileDigests, TransferError>;

  /// Delete every transient object labelled with `session` in `namespace`.
  ///
  /// Only `namespace` is searched, so namespace-scoped credentials are enough.
  /// Returns how many objects were removed. Removing nothing is not an error.
  async fn teardown(&self, session: &str, namespace: &str) -> Result<usize, TransferError>;
}
