use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use kmigrate_lib::config::parse_mapping;
use kmigrate_lib::platform::paths::plugin_dir;
use kmigrate_lib::transform::plugin::OptionalField;
use kmigrate_lib::transform::{PluginOrigin, PluginRegistry, TransformFlags, TransformOptions, transform};
use kmigrate_lib::tree::ResourceTree;

use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_stat, print_success, print_warning,
};

/// Where plugins come from and how they are adjusted.
#[derive(Args, Debug, Clone)]
pub struct PluginArgs {
  /// Directory holding external plugin executables [default: ~/.config/kmigrate/plugins]
  #[arg(long)]
  pub plugin_dir: Option<PathBuf>,

  /// Only run the built-in plugins
  #[arg(long)]
  pub skip_plugins: bool,

  /// YAML flags file: optionals, disabled-plugins, priorities, extras
  #[arg(long)]
  pub flags_file: Option<PathBuf>,
}

impl PluginArgs {
  fn flags(&self) -> Result<TransformFlags> {
    match &self.flags_file {
      Some(path) => TransformFlags::load(path).context("Failed to load flags file"),
      None => Ok(TransformFlags::default()),
    }
  }

  fn external_dir(&self) -> Option<PathBuf> {
    if self.skip_plugins {
      None
    } else {
      Some(self.plugin_dir.clone().unwrap_or_else(plugin_dir))
    }
  }

  async fn registry(&self, flags: &TransformFlags) -> PluginRegistry {
    PluginRegistry::load(self.external_dir().as_deref(), flags).await
  }
}

#[derive(Args, Debug)]
pub struct TransformArgs {
  /// Export directory to read
  #[arg(long, default_value = "export")]
  pub export_dir: PathBuf,

  /// Directory receiving the transformed manifests and report.yaml
  #[arg(long, default_value = "transform")]
  pub transform_dir: PathBuf,

  #[command(flatten)]
  pub plugins: PluginArgs,

  /// Enable an optional field group, optionally with a value (key or key=value)
  #[arg(long = "optional")]
  pub optionals: Vec<String>,
}

fn requested_optionals(raw: &[String]) -> Result<BTreeMap<String, String>> {
  let mut requested = BTreeMap::new();
  for entry in raw {
    if entry.contains('=') {
      let (key, value) = parse_mapping(entry)?;
      requested.insert(key, value);
    } else {
      requested.insert(entry.trim().to_string(), String::new());
    }
  }
  Ok(requested)
}

/// Run the transform. `all_optionals` enables every declared optional group.
pub fn cmd_transform(args: &TransformArgs, all_optionals: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let flags = args.plugins.flags()?;
  let requested = requested_optionals(&args.optionals)?;
  let source = ResourceTree::new(&args.export_dir);
  let target = ResourceTree::new(&args.transform_dir);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let (registry, report) = rt.block_on(async {
    let registry = args.plugins.registry(&flags).await;
    let mut options = TransformOptions::from_flags(&flags);
    // An empty value falls back to the flags file, then to "true".
    let requested: BTreeMap<String, String> = requested
      .into_iter()
      .map(|(key, value)| {
        let value = if value.is_empty() {
          flags.optionals.get(&key).cloned().unwrap_or_else(|| "true".to_string())
        } else {
          value
        };
        (key, value)
      })
      .collect();
    options.enable_optionals(&registry, &requested, all_optionals)?;
    let report = transform(&source, &target, &registry, &options).await?;
    Ok::<_, anyhow::Error>((registry, report))
  })?;

  let failed_resources = report.resources.iter().filter(|r| !r.errors.is_empty()).count();
  let all_failed = report.summary.resources > 0 && failed_resources == report.summary.resources;

  if output.is_json() {
    print_json(&report)?;
  } else {
    println!();
    if all_failed {
      print_error("Transform failed for every resource");
    } else {
      print_success(&format!("Transformed {}", args.export_dir.display()));
    }
    print_stat("Directory", &args.transform_dir.display().to_string());
    print_stat("Plugins", &registry.ordered().len().to_string());
    print_stat("Resources", &report.summary.resources.to_string());
    print_stat("Whiteouts", &report.summary.whiteouts.to_string());
    print_stat("Plugin errors", &report.summary.plugin_errors.to_string());
    if !report.optionals.is_empty() {
      print_stat("Optionals", &report.optionals.join(", "));
    }
    print_stat("Duration", &format_duration(start.elapsed()));
    for load_error in registry.load_errors() {
      print_warning(&format!("Plugin not loaded: {}", load_error));
    }
    for invalid in &report.invalid {
      print_warning(&format!("Unreadable manifest: {}", invalid.error));
    }
    if report.has_errors() {
      print_info("See report.yaml in the transform directory for per-resource errors");
    }
  }

  if all_failed {
    bail!("all {} resources failed to transform", report.summary.resources);
  }
  Ok(())
}

#[derive(Serialize)]
struct PluginRow<'a> {
  name: &'a str,
  version: &'a str,
  priority: i32,
  origin: PluginOrigin,
  optional_fields: &'a [OptionalField],
}

pub fn cmd_list_plugins(args: &PluginArgs, output: OutputFormat) -> Result<()> {
  let flags = args.flags()?;
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let registry = rt.block_on(args.registry(&flags));

  let rows: Vec<PluginRow> = registry
    .ordered()
    .iter()
    .map(|registered| {
      let metadata = registered.plugin.metadata();
      PluginRow {
        name: &metadata.name,
        version: &metadata.version,
        priority: registered.priority,
        origin: registered.plugin.origin(),
        optional_fields: &metadata.optional_fields,
      }
    })
    .collect();

  if output.is_json() {
    return print_json(&rows);
  }

  println!("{:<24} {:<10} {:>8}  ORIGIN", "NAME", "VERSION", "PRIORITY");
  for row in &rows {
    println!(
      "{:<24} {:<10} {:>8}  {}",
      row.name, row.version, row.priority, row.origin
    );
    for field in row.optional_fields {
      let example = if field.example.is_empty() {
        String::new()
      } else {
        format!(" (e.g. {})", field.example)
      };
      println!("    optional {}: {}{}", field.key, field.help, example);
    }
  }
  for load_error in registry.load_errors() {
    print_warning(&format!("Plugin not loaded: {}", load_error));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn optionals_accept_bare_keys_and_pairs() {
    let raw = vec!["strip-node-selector".to_string(), "registry-replacement=a=b".to_string()];
    let parsed = requested_optionals(&raw).unwrap();
    assert_eq!(parsed["strip-node-selector"], "");
    assert_eq!(parsed["registry-replacement"], "a=b");
  }

  #[test]
  fn optionals_reject_empty_key() {
    assert!(requested_optionals(&["=value".to_string()]).is_err());
  }
}
