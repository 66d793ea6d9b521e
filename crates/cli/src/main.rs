mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kmigrate_lib::consts::{DEFAULT_BURST, DEFAULT_QPS};

use crate::cmd::{ApplyArgs, ExportArgs, PluginArgs, TransferArgs, TransformArgs};
use crate::output::OutputFormat;

/// Migrate a namespace between Kubernetes clusters: export, transform, apply, transfer volumes.
#[derive(Parser)]
#[command(name = "kubectl-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

/// Which cluster to talk to and how fast.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
  /// kubeconfig context (defaults to the current context)
  #[arg(long)]
  pub context: Option<String>,

  /// Path to the kubeconfig file
  #[arg(long)]
  pub kubeconfig: Option<PathBuf>,

  /// Sustained API requests per second
  #[arg(long, default_value_t = DEFAULT_QPS)]
  pub qps: u32,

  /// API requests allowed in a burst
  #[arg(long, default_value_t = DEFAULT_BURST)]
  pub burst: u32,
}

#[derive(Subcommand)]
enum Commands {
  /// Export the namespace resources into a directory of manifests
  Export {
    #[command(flatten)]
    args: ExportArgs,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Run an export through the transform plugins
  Transform {
    #[command(flatten)]
    args: TransformArgs,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// List the transform plugins in execution order
  ListPlugins {
    #[command(flatten)]
    plugins: PluginArgs,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Re-run the transform with optional field groups enabled
  ApplyOptionals {
    #[command(flatten)]
    args: TransformArgs,

    /// Enable every optional field group the plugins declare
    #[arg(long)]
    all: bool,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Create the resources of an export or transform directory on a cluster
  Apply {
    #[command(flatten)]
    args: ApplyArgs,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Copy the content of a persistent volume claim to another cluster
  Transfer {
    #[command(flatten)]
    args: TransferArgs,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Print version information
  Version,
}

fn init_logging(verbose: bool) {
  let default = if verbose {
    "kmigrate_lib=debug,kubectl_migrate=debug"
  } else {
    "warn"
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  match cli.command {
    Commands::Export { args, output } => cmd::cmd_export(&args, output),
    Commands::Transform { args, output } => cmd::cmd_transform(&args, false, output),
    Commands::ListPlugins { plugins, output } => cmd::cmd_list_plugins(&plugins, output),
    Commands::ApplyOptionals { args, all, output } => cmd::cmd_transform(&args, all, output),
    Commands::Apply { args, output } => cmd::cmd_apply(&args, output),
    Commands::Transfer { args, output } => cmd::cmd_transfer(&args, output),
    Commands::Version => {
      cmd::cmd_version();
      Ok(())
    }
  }
}
