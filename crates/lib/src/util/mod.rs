//! Shared utilities.

pub mod hash;
pub mod yaml;
