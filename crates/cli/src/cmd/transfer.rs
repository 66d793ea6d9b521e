use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use kmigrate_lib::config::{ClusterConfig, parse_mapping};
use kmigrate_lib::consts::{DEFAULT_BURST, DEFAULT_QPS};
use kmigrate_lib::transfer::{ClaimRef, KubectlDataPlane, TransferRequest, transfer};

use crate::output::{
  OutputFormat, format_bytes, format_duration, print_checksum, print_error, print_json, print_stat, print_success,
  print_warning, route,
};

use super::connect;

#[derive(Args, Debug)]
pub struct TransferArgs {
  /// Persistent volume claim to copy
  pub claim: String,

  /// Namespace of the claim on the source cluster
  #[arg(short, long)]
  pub namespace: String,

  /// Source kubeconfig context
  #[arg(long)]
  pub source_context: Option<String>,

  /// Destination kubeconfig context
  #[arg(long)]
  pub dest_context: Option<String>,

  /// kubeconfig file for both clusters
  #[arg(long)]
  pub kubeconfig: Option<PathBuf>,

  /// Destination namespace (defaults to the source namespace)
  #[arg(long)]
  pub dest_namespace: Option<String>,

  /// Destination claim name (defaults to the source claim name)
  #[arg(long)]
  pub dest_claim: Option<String>,

  /// Image of the transient endpoint pods [env: KMIGRATE_TRANSFER_IMAGE]
  #[arg(long)]
  pub endpoint: Option<String>,

  /// Directory inside the source volume to copy
  #[arg(long)]
  pub source_path: Option<String>,

  /// Directory inside the destination volume to write to
  #[arg(long)]
  pub dest_path: Option<String>,

  /// Storage class remap for a destination claim that has to be created (old=new)
  #[arg(long = "storage-class-map")]
  pub storage_class_map: Vec<String>,

  /// Give up after this long (e.g. 30m, 2h)
  #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
  pub timeout: Duration,
}

impl TransferArgs {
  fn cluster(&self, context: Option<String>) -> Result<ClusterConfig> {
    ClusterConfig::new(context, self.kubeconfig.clone(), DEFAULT_QPS, DEFAULT_BURST).context("Invalid cluster settings")
  }

  fn request(&self) -> Result<TransferRequest> {
    let mut request = TransferRequest::new(&self.namespace, &self.claim);
    if self.dest_namespace.is_some() || self.dest_claim.is_some() {
      request.destination = Some(ClaimRef {
        namespace: self.dest_namespace.clone().unwrap_or_else(|| self.namespace.clone()),
        name: self.dest_claim.clone().unwrap_or_else(|| self.claim.clone()),
      });
    }
    if let Some(image) = &self.endpoint {
      request.endpoint_image = image.clone();
    }
    request.source_path = self.source_path.clone();
    request.destination_path = self.dest_path.clone();
    request.storage_class_map = self
      .storage_class_map
      .iter()
      .map(|raw| parse_mapping(raw))
      .collect::<Result<BTreeMap<_, _>, _>>()
      .context("Invalid --storage-class-map")?;
    request.timeout = self.timeout;
    Ok(request)
  }
}

pub fn cmd_transfer(args: &TransferArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let request = args.request()?;
  let source_config = args.cluster(args.source_context.clone())?;
  let dest_config = args.cluster(args.dest_context.clone())?;
  if source_config.context == dest_config.context && request.destination_claim() == request.claim {
    bail!("Source and destination are the same claim on the same cluster");
  }

  let source = KubectlDataPlane::new(connect(&source_config), source_config);
  let destination = KubectlDataPlane::new(connect(&dest_config), dest_config);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let session = rt.block_on(async {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cancelling transfer");
        on_interrupt.cancel();
      }
    });
    transfer(&source, &destination, &request, cancel).await
  });

  if output.is_json() {
    print_json(&session)?;
  } else {
    println!();
    if session.is_complete() {
      print_success(&format!("Copied {}", route(&session.claim, &session.destination_claim)));
    } else {
      let stage = session.failed_in.map(|s| s.to_string()).unwrap_or_else(|| "pending".to_string());
      print_error(&format!(
        "Transfer of {} failed while {}: {}",
        session.claim,
        stage,
        session.error.as_deref().unwrap_or("unknown error")
      ));
    }
    print_stat("Session", &session.name);
    print_stat(
      "Route",
      &route(&session.source_environment, &session.destination_environment),
    );
    print_stat("Transferred", &format_bytes(session.bytes_transferred));
    if let Some(checksum) = &session.checksum {
      print_checksum(checksum);
    }
    if session.claim_created {
      print_stat("Claim created", "yes");
    }
    print_stat("Cleaned up", &session.removed.to_string());
    print_stat("Duration", &format_duration(start.elapsed()));
    for error in &session.teardown_errors {
      print_warning(&format!("Cleanup incomplete: {}", error));
    }
  }

  if !session.is_complete() {
    bail!(
      "transfer {} failed: {}",
      session.id,
      session.error.as_deref().unwrap_or("unknown error")
    );
  }
  Ok(())
}
