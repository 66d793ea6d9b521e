use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;

use kmigrate_lib::apply::{ApplyOptions, apply};
use kmigrate_lib::tree::ResourceTree;

use crate::ClusterArgs;
use crate::output::{
  OutputFormat, format_duration, print_apply_result, print_error, print_info, print_json, print_stat, print_success,
};

use super::{cluster_config, connect};

#[derive(Args, Debug)]
pub struct ApplyArgs {
  /// Export or transform directory to apply
  #[arg(default_value = "transform")]
  pub dir: PathBuf,

  #[command(flatten)]
  pub cluster: ClusterArgs,

  /// Rewrite every namespaced resource into this namespace
  #[arg(long)]
  pub target_namespace: Option<String>,

  /// Skip namespaced resources
  #[arg(long, conflicts_with = "skip_cluster_scoped")]
  pub skip_namespaced: bool,

  /// Skip cluster-scoped resources
  #[arg(long)]
  pub skip_cluster_scoped: bool,

  /// Show what would change without modifying the cluster
  #[arg(long)]
  pub dry_run: bool,

  /// Create namespaces the tree uses but does not contain
  #[arg(long)]
  pub create_namespace: bool,
}

pub fn cmd_apply(args: &ApplyArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  if !args.dir.is_dir() {
    bail!("Directory not found: {}", args.dir.display());
  }

  let config = cluster_config(&args.cluster)?;
  let client = connect(&config);
  let tree = ResourceTree::new(&args.dir);
  let options = ApplyOptions {
    target_namespace: args.target_namespace.clone(),
    skip_namespaced: args.skip_namespaced,
    skip_cluster_scoped: args.skip_cluster_scoped,
    dry_run: args.dry_run,
    create_namespace: args.create_namespace,
    workers: config.workers(),
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(apply(client, &tree, &options))
    .with_context(|| format!("Failed to apply {}", args.dir.display()))?;
  let counts = report.counts();

  if output.is_json() {
    print_json(&report)?;
  } else {
    if report.dry_run {
      print_info(&format!("Dry run against {}, no changes made", config.display_name()));
    }
    for result in &report.results {
      print_apply_result(result, report.dry_run);
    }
    println!();
    if report.is_success() {
      print_success(&format!("Applied {} to {}", args.dir.display(), config.display_name()));
    } else {
      print_error(&format!("{} resources failed to apply", counts.failed));
    }
    print_stat("Created", &counts.created.to_string());
    print_stat("Updated", &counts.updated.to_string());
    print_stat("Unchanged", &counts.unchanged.to_string());
    print_stat("Failed", &counts.failed.to_string());
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if !report.is_success() {
    bail!("{} of {} resources failed to apply", counts.failed, report.results.len());
  }
  Ok(())
}
