mod apply;
mod export;
mod transfer;
mod transform;
mod version;

use std::sync::Arc;

use anyhow::{Context, Result};

use kmigrate_lib::client::{ClusterClient, KubeClient, RetryingClient};
use kmigrate_lib::config::ClusterConfig;

use crate::ClusterArgs;

pub use apply::{ApplyArgs, cmd_apply};
pub use export::{ExportArgs, cmd_export};
pub use transfer::{TransferArgs, cmd_transfer};
pub use transform::{PluginArgs, TransformArgs, cmd_list_plugins, cmd_transform};
pub use version::cmd_version;

fn cluster_config(args: &ClusterArgs) -> Result<ClusterConfig> {
  ClusterConfig::new(args.context.clone(), args.kubeconfig.clone(), args.qps, args.burst)
    .context("Invalid cluster settings")
}

/// API client with the shared rate limit and retry policy.
///
/// Connects lazily, so an unreachable cluster fails the first call.
fn connect(config: &ClusterConfig) -> Arc<dyn ClusterClient> {
  let api: Arc<dyn ClusterClient> = Arc::new(KubeClient::new(config.clone()));
  Arc::new(RetryingClient::new(api, config))
}
