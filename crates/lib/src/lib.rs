//! kmigrate-lib: namespace migration pipeline between clusters.
//!
//! This crate provides the four stages used by `kubectl-migrate`:
//! - `discover` + `export`: enumerate and write redeployable manifests of a namespace
//! - `transform`: rewrite an export tree through an ordered chain of patch plugins
//! - `apply`: re-create a resource tree on a destination cluster in dependency tiers
//! - `transfer`: copy persistent volume content between clusters
//!
//! Cluster access goes through the [`client::ClusterClient`] trait so every stage
//! can run against the Kubernetes API (kube-rs) or the in-memory test cluster.

pub mod apply;
pub mod client;
pub mod config;
pub mod consts;
pub mod discover;
pub mod export;
pub mod platform;
pub mod resource;
pub mod transfer;
pub mod transform;
pub mod tree;
pub mod util;
