//! Cluster client configuration.
//!
//! A [`ClusterConfig`] is built once per target cluster and passed explicitly to
//! every component that talks to that cluster. There is no process-wide client.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::consts::{DEFAULT_BURST, DEFAULT_QPS, DEFAULT_TRANSFER_IMAGE, MAX_WORKERS};

/// Environment variable overriding the kubectl binary.
pub const KUBECTL_ENV: &str = "KUBECTL";

/// Environment variable overriding the data-plane endpoint image.
pub const TRANSFER_IMAGE_ENV: &str = "KMIGRATE_TRANSFER_IMAGE";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
  #[error("qps must be greater than zero")]
  ZeroQps,

  #[error("burst must be greater than zero")]
  ZeroBurst,

  #[error("invalid mapping '{0}': expected key=value")]
  InvalidMapping(String),

  #[error("failure ratio must be within 0.0..=1.0, got {0}")]
  InvalidRatio(f64),
}

/// Bounded exponential backoff applied to every cluster API call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_secs(5),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based), without jitter.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

/// Connection and rate-limit settings for one cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
  /// kubeconfig context; `None` uses the current context.
  pub context: Option<String>,

  /// kubeconfig file; `None` falls back to `KUBECONFIG`, `~/.kube/config`
  /// or the in-cluster service account.
  pub kubeconfig: Option<PathBuf>,

  /// kubectl binary, used for the `exec` streams of a transfer.
  pub kubectl: PathBuf,

  /// Sustained requests per second.
  pub qps: NonZeroU32,

  /// Requests allowed in a burst above `qps`.
  pub burst: NonZeroU32,

  pub retry: RetryPolicy,
}

impl Default for ClusterConfig {
  fn default() -> Self {
    Self {
      context: None,
      kubeconfig: None,
      kubectl: default_kubectl(),
      qps: NonZeroU32::new(DEFAULT_QPS).unwrap_or(NonZeroU32::MIN),
      burst: NonZeroU32::new(DEFAULT_BURST).unwrap_or(NonZeroU32::MIN),
      retry: RetryPolicy::default(),
    }
  }
}

impl ClusterConfig {
  /// Build a config from user-facing values, validating the rate limits.
  pub fn new(
    context: Option<String>,
    kubeconfig: Option<PathBuf>,
    qps: u32,
    burst: u32,
  ) -> Result<Self, ConfigError> {
    Ok(Self {
      context,
      kubeconfig,
      qps: NonZeroU32::new(qps).ok_or(ConfigError::ZeroQps)?,
      burst: NonZeroU32::new(burst).ok_or(ConfigError::ZeroBurst)?,
      ..Self::default()
    })
  }

  /// Worker pool size for fan-out stages, derived from the rate limits.
  ///
  /// Workers beyond `qps` would only queue on the limiter, so the pool is the
  /// smaller of qps and burst, capped at [`MAX_WORKERS`].
  pub fn workers(&self) -> usize {
    let limit = self.qps.get().min(self.burst.get()) as usize;
    limit.clamp(1, MAX_WORKERS)
  }

  /// Global kubectl arguments selecting this cluster.
  pub fn kubectl_args(&self) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(kubeconfig) = &self.kubeconfig {
      args.push(format!("--kubeconfig={}", kubeconfig.display()));
    }
    if let Some(context) = &self.context {
      args.push(format!("--context={}", context));
    }
    args
  }

  /// Short label for logs.
  pub fn display_name(&self) -> &str {
    self.context.as_deref().unwrap_or("current-context")
  }
}

/// kubectl binary, honouring the `KUBECTL` override.
pub fn default_kubectl() -> PathBuf {
  std::env::var(KUBECTL_ENV)
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from("kubectl"))
}

/// Image used for transient transfer endpoints.
pub fn transfer_image() -> String {
  std::env::var(TRANSFER_IMAGE_ENV).unwrap_or_else(|_| DEFAULT_TRANSFER_IMAGE.to_string())
}

/// Parse `key=value` pairs, as used by `--storage-class-map` and `--optional`.
pub fn parse_mapping(raw: &str) -> Result<(String, String), ConfigError> {
  match raw.split_once('=') {
    Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
    _ => Err(ConfigError::InvalidMapping(raw.to_string())),
  }
}
