//! Hashing utilities for export determinism and transfer verification.
//!
//! This module provides:
//! - `ContentHash`: a full 64-character SHA-256 hex digest
//! - `content_checksum()`: the checksum of a set of files, byte-compatible with
//!   `find . -type f | LC_ALL=C sort | xargs sha256sum | sha256sum` run in a pod
//! - `hash_directory()`: the same checksum over a local directory tree (export checksums)
//! - `hash_bytes()`: arbitrary byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A full 64-character SHA256 hash.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },
}

/// Incremental SHA-256 over a byte stream.
#[derive(Default, Clone)]
pub struct StreamHasher {
  hasher: Sha256,
  bytes: u64,
}

impl StreamHasher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update(&mut self, chunk: &[u8]) {
    self.hasher.update(chunk);
    self.bytes += chunk.len() as u64;
  }

  pub fn bytes(&self) -> u64 {
    self.bytes
  }

  pub fn finish(self) -> ContentHash {
    ContentHash(hex::encode(self.hasher.finalize()))
  }
}

/// Compute the content checksum of a set of `(relative path, file hash)` pairs.
///
/// Each entry contributes a `sha256sum`-style line (`<hash>  ./<path>\n`); lines
/// are ordered bytewise by the `./<path>` part.
pub fn content_checksum<I, P>(entries: I) -> ContentHash
where
  I: IntoIterator<Item = (P, ContentHash)>,
  P: AsRef<str>,
{
  let mut lines: Vec<(String, String)> = entries
    .into_iter()
    .map(|(path, hash)| {
      let rel = format!("./{}", path.as_ref().trim_start_matches("./").trim_start_matches('/'));
      let line = format!("{}  {}\n", hash.0, rel);
      (rel, line)
    })
    .collect();

  lines.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

  let mut hasher = Sha256::new();
  for (_, line) in lines {
    hasher.update(line.as_bytes());
  }
  ContentHash(hex::encode(hasher.finalize()))
}

/// Compute the content checksum of a directory's regular files.
///
/// Only file contents and relative paths contribute; timestamps, permissions and
/// empty directories do not.
///
/// # Arguments
///
/// * `path` - The directory to hash
/// * `exclude` - File/directory names to skip
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  let mut entries: Vec<(String, ContentHash)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    if !entry.file_type().is_file() {
      continue;
    }

    let entry_path = entry.path();
    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .replace('\\', "/");

    entries.push((rel_path, hash_file(entry_path)?));
  }

  Ok(content_checksum(entries))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut file = fs::File::open(path).map_err(|e| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = StreamHasher::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| DirHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(hasher.finish())
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = StreamHasher::new();
  hasher.update(data);
  hasher.finish()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[test]
  fn hash_empty_directory() {
    let temp = tempdir().unwrap();
    let hash = hash_directory(temp.path(), &[]).unwrap();
    // sha256 of the empty string, same as `sha256sum </dev/null`
    assert_eq!(hash.0, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
  }

  #[test]
  fn hash_is_deterministic() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::write(temp.path().join("b.txt"), "content b").unwrap();

    let hash1 = hash_directory(temp.path(), &[]).unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn hash_changes_with_content() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "original").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("file.txt"), "modified").unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn same_content_different_structure_different_hash() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("file.txt"), "content").unwrap();

    let temp2 = tempdir().unwrap();
    fs::create_dir(temp2.path().join("subdir")).unwrap();
    fs::write(temp2.path().join("subdir/file.txt"), "content").unwrap();

    assert_ne!(
      hash_directory(temp1.path(), &[]).unwrap(),
      hash_directory(temp2.path(), &[]).unwrap()
    );
  }

  #[test]
  fn hash_respects_exclusions() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "content").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("report.yaml"), "marker").unwrap();
    let hash2 = hash_directory(temp.path(), &["report.yaml"]).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn directory_and_in_memory_checksums_agree() {
    let temp = tempdir().unwrap();
    fs::create_dir(temp.path().join("data")).unwrap();
    fs::write(temp.path().join("data/b.bin"), b"bbb").unwrap();
    fs::write(temp.path().join("a.txt"), b"aaa").unwrap();

    let from_disk = hash_directory(temp.path(), &[]).unwrap();
    let in_memory = content_checksum([("data/b.bin", hash_bytes(b"bbb")), ("a.txt", hash_bytes(b"aaa"))]);

    assert_eq!(from_disk, in_memory);
  }

  #[test]
  fn stream_hasher_counts_bytes() {
    let mut hasher = StreamHasher::new();
    hasher.update(b"hello ");
    hasher.update(b"world");
    assert_eq!(hasher.bytes(), 11);
    assert_eq!(hasher.finish(), hash_bytes(b"hello world"));
  }
}
