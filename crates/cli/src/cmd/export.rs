use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use clap::Args;

use kmigrate_lib::discover::ResourceFilter;
use kmigrate_lib::export::{ExportOptions, FailurePolicy, OwnerRefPolicy, export};
use kmigrate_lib::tree::ResourceTree;

use crate::ClusterArgs;
use crate::output::{
  OutputFormat, format_duration, print_checksum, print_error, print_json, print_stat, print_success, print_warning,
};

use super::{cluster_config, connect};

#[derive(Args, Debug)]
pub struct ExportArgs {
  /// Namespace to export
  #[arg(short, long)]
  pub namespace: String,

  /// Directory receiving the export
  #[arg(long, default_value = "export")]
  pub export_dir: PathBuf,

  #[command(flatten)]
  pub cluster: ClusterArgs,

  /// Only export these kinds (kind, plural or plural.group)
  #[arg(long = "include-kinds", value_delimiter = ',')]
  pub include: Vec<String>,

  /// Never export these kinds
  #[arg(long = "exclude-kinds", value_delimiter = ',')]
  pub exclude: Vec<String>,

  /// Label selector applied to every list call
  #[arg(short = 'l', long)]
  pub label_selector: Option<String>,

  /// Also export the namespace object and the cluster-scoped RBAC and CRDs it uses
  #[arg(long)]
  pub cluster_scoped_rbac: bool,

  /// Owner reference handling: keep, drop-cluster-scoped or drop-all
  #[arg(long, default_value = "drop-cluster-scoped")]
  pub owner_refs: OwnerRefPolicy,

  /// Fail the run when more than this share of resources fails (0.0 to 1.0)
  #[arg(long, default_value_t = 1.0)]
  pub max_failure_ratio: f64,
}

pub fn cmd_export(args: &ExportArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let policy = FailurePolicy::new(args.max_failure_ratio).context("Invalid --max-failure-ratio")?;
  let config = cluster_config(&args.cluster)?;
  let client = connect(&config);
  let tree = ResourceTree::new(&args.export_dir);

  let options = ExportOptions {
    filter: ResourceFilter {
      include: args.include.clone(),
      exclude: args.exclude.clone(),
      label_selector: args.label_selector.clone(),
    },
    cluster_scoped_rbac: args.cluster_scoped_rbac,
    owner_refs: args.owner_refs,
    workers: config.workers(),
    ..ExportOptions::new(&args.namespace)
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let summary = rt
    .block_on(export(client, &tree, &options))
    .with_context(|| format!("Failed to export namespace {}", args.namespace))?;
  let verdict = policy.evaluate(&summary);

  if output.is_json() {
    print_json(&summary)?;
  } else {
    println!();
    match &verdict {
      Ok(()) => print_success(&format!("Exported namespace {}", summary.namespace)),
      Err(_) => print_error(&format!("Export of namespace {} failed", summary.namespace)),
    }
    print_stat("Directory", &args.export_dir.display().to_string());
    print_stat("Exported", &summary.exported.to_string());
    print_stat("Failed", &summary.failed.to_string());
    if let Some(checksum) = &summary.checksum {
      print_checksum(checksum);
    }
    print_stat("Duration", &format_duration(start.elapsed()));
    for failure in &summary.discovery_failures {
      print_warning(&format!("Could not discover {}: {}", failure.group_version, failure.error));
    }
    for shadowed in &summary.shadowed {
      print_warning(&format!(
        "{} is served by both {} and {}",
        shadowed.descriptor.kind,
        shadowed.kept,
        shadowed.descriptor.api_version()
      ));
    }
    if summary.failed > 0 {
      print_warning(&format!(
        "Failure details are in {}",
        tree.failures_dir(&summary.namespace).display()
      ));
    }
  }

  verdict.map_err(|violation| anyhow!(violation))
}
