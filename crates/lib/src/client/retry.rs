//! Rate limiting and bounded retry around a cluster client.
//!
//! Every call waits on a token bucket sized from the configured qps/burst and is
//! retried with capped exponential backoff while the error is retryable. The
//! limiter is shared by all tasks holding the same `RetryingClient`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ClusterConfig, RetryPolicy};
use crate::resource::ResourceDescriptor;

use super::{ApiResource, ClientError, ClusterClient};

/// A [`ClusterClient`] that applies the shared rate limit and retry policy.
#[derive(Clone)]
pub struct RetryingClient {
  inner: Arc<dyn ClusterClient>,
  limiter: Arc<DefaultDirectRateLimiter>,
  policy: RetryPolicy,
}

impl RetryingClient {
  pub fn new(inner: Arc<dyn ClusterClient>, config: &ClusterConfig) -> Self {
    let quota = Quota::per_second(config.qps).allow_burst(config.burst);
    Self {
      inner,
      limiter: Arc::new(RateLimiter::direct(quota)),
      policy: config.retry.clone(),
    }
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, ClientError>
  where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ClientError>> + Send,
  {
    let mut attempt = 1;
    loop {
      self.limiter.until_ready().await;

      match f().await {
        Ok(value) => return Ok(value),
        Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
          let delay = jittered(self.policy.delay_for(attempt));
          warn!(
            op,
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "cluster call failed, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => {
          debug!(op, attempt, error = %e, "cluster call failed");
          return Err(e);
        }
      }
    }
  }
}

/// Half fixed, half random, so concurrent workers do not retry in lockstep.
fn jittered(delay: Duration) -> Duration {
  let half = delay / 2;
  let spread = half.as_millis() as u64;
  if spread == 0 {
    return delay;
  }
  half + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[async_trait]
impl ClusterClient for RetryingClient {
  async fn api_group_versions(&self) -> Result<Vec<String>, ClientError> {
    self.call("discovery", || self.inner.api_group_versions()).await
  }

  async fn api_resources(&self, group_version: &str) -> Result<Vec<ApiResource>, ClientError> {
    self
      .call("discovery", || self.inner.api_resources(group_version))
      .await
  }

  async fn list(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    label_selector: Option<&str>,
  ) -> Result<Vec<Value>, ClientError> {
    self
      .call("list", || self.inner.list(descriptor, namespace, label_selector))
      .await
  }

  async fn get(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<Option<Value>, ClientError> {
    self.call("get", || self.inner.get(descriptor, namespace, name)).await
  }

  async fn create(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError> {
    self.call("create", || self.inner.create(descriptor, namespace, body)).await
  }

  async fn update(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    body: &Value,
  ) -> Result<Value, ClientError> {
    self.call("update", || self.inner.update(descriptor, namespace, body)).await
  }

  async fn delete(
    &self,
    descriptor: &ResourceDescriptor,
    namespace: Option<&str>,
    name: &str,
  ) -> Result<(), ClientError> {
    self.call("delete", || self.inner.delete(descriptor, namespace, name)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::MemoryCluster;
  use crate::resource::Scope;
  use serde_json::json;

  fn fast_config(max_attempts: u32) -> ClusterConfig {
    let mut config = ClusterConfig::new(None, None, 1000, 1000).unwrap();
    config.retry = RetryPolicy {
      max_attempts,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(2),
    };
    config
  }

  fn config_maps() -> ResourceDescriptor {
    ResourceDescriptor::new("", "v1", "ConfigMap", "configmaps", Scope::Namespaced)
  }

  #[tokio::test]
  async fn transient_failures_are_retried() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    cluster.insert(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "demo"}}));
    cluster.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "demo"}}));
    cluster.fail_next_calls(2, ClientError::Unavailable("etcd leader change".into()));

    let client = RetryingClient::new(cluster.clone(), &fast_config(3));
    let items = client.list(&config_maps(), Some("demo"), None).await.unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(cluster.counts().lists, 3);
  }

  #[tokio::test]
  async fn retries_are_bounded() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    cluster.fail_next_calls(10, ClientError::Unavailable("overloaded".into()));

    let client = RetryingClient::new(cluster.clone(), &fast_config(3));
    let err = client.list(&config_maps(), Some("demo"), None).await.unwrap_err();

    assert!(matches!(err, ClientError::Unavailable(_)));
    assert_eq!(cluster.counts().lists, 3);
  }

  #[tokio::test]
  async fn permanent_failures_are_not_retried() {
    let cluster = Arc::new(MemoryCluster::with_standard_resources());
    cluster.fail_list("ConfigMap", ClientError::Forbidden("configmaps is forbidden".into()));

    let client = RetryingClient::new(cluster.clone(), &fast_config(5));
    let err = client.list(&config_maps(), Some("demo"), None).await.unwrap_err();

    assert!(matches!(err, ClientError::Forbidden(_)));
    assert_eq!(cluster.counts().lists, 1);
  }

  #[test]
  fn jitter_stays_within_bounds() {
    for _ in 0..100 {
      let delay = jittered(Duration::from_millis(100));
      assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));
    }
  }
}
