//! Terminal output for the migration commands.
//!
//! Run summaries are a status line followed by indented stats. Apply prints one
//! line per resource with a marker for its outcome.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use kmigrate_lib::apply::{ApplyOutcome, ApplyResult};
use kmigrate_lib::util::hash::ContentHash;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
}

/// Marker of an apply outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
  Created,
  Updated,
  Unchanged,
  Failed,
}

impl Marker {
  pub fn symbol(self) -> &'static str {
    match self {
      Marker::Created => "+",
      Marker::Updated => "~",
      Marker::Unchanged => "=",
      Marker::Failed => symbols::ERROR,
    }
  }

  fn colored(self) -> String {
    let symbol = self.symbol();
    match self {
      Marker::Created => format!("{}", symbol.if_supports_color(Stream::Stdout, |s| s.green())),
      Marker::Updated => format!("{}", symbol.if_supports_color(Stream::Stdout, |s| s.yellow())),
      Marker::Unchanged => format!("{}", symbol.if_supports_color(Stream::Stdout, |s| s.dimmed())),
      Marker::Failed => format!("{}", symbol.if_supports_color(Stream::Stdout, |s| s.red())),
    }
  }
}

/// `Kind namespace/name`, or `Kind name` for cluster-scoped objects.
pub fn resource_label(result: &ApplyResult) -> String {
  match &result.namespace {
    Some(namespace) => format!("{} {}/{}", result.kind, namespace, result.name),
    None => format!("{} {}", result.kind, result.name),
  }
}

/// Marker and trailing detail of one apply result. A dry run says what would happen.
pub fn describe_outcome(outcome: &ApplyOutcome, dry_run: bool) -> (Marker, Option<String>) {
  match outcome {
    ApplyOutcome::Created if dry_run => (Marker::Created, Some("would be created".to_string())),
    ApplyOutcome::Created => (Marker::Created, None),
    ApplyOutcome::Updated if dry_run => (Marker::Updated, Some("would be updated".to_string())),
    ApplyOutcome::Updated => (Marker::Updated, None),
    ApplyOutcome::Unchanged => (Marker::Unchanged, None),
    ApplyOutcome::Failed(reason) => (Marker::Failed, Some(reason.clone())),
  }
}

pub fn print_apply_result(result: &ApplyResult, dry_run: bool) {
  let (marker, detail) = describe_outcome(&result.outcome, dry_run);
  let label = resource_label(result);
  match detail {
    Some(detail) => println!(
      "  {} {} {}",
      marker.colored(),
      label,
      detail.if_supports_color(Stream::Stdout, |s| s.dimmed())
    ),
    None => println!("  {} {}", marker.colored(), label),
  }
}

/// `source → destination`, for claims and cluster contexts.
pub fn route(source: impl std::fmt::Display, destination: impl std::fmt::Display) -> String {
  format!("{} {} {}", source, symbols::ARROW, destination)
}

/// First 12 hex characters of a content checksum.
pub fn short_checksum(checksum: &ContentHash) -> &str {
  let len = checksum.0.len().min(12);
  &checksum.0[..len]
}

pub fn format_bytes(bytes: u64) -> String {
  const KB: u64 = 1024;
  const MB: u64 = KB * 1024;
  const GB: u64 = MB * 1024;

  if bytes >= GB {
    format!("{:.1} GB", bytes as f64 / GB as f64)
  } else if bytes >= MB {
    format!("{:.1} MB", bytes as f64 / MB as f64)
  } else if bytes >= KB {
    format!("{:.1} KB", bytes as f64 / KB as f64)
  } else {
    format!("{} B", bytes)
  }
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_checksum(checksum: &ContentHash) {
  print_stat("Checksum", short_checksum(checksum));
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
