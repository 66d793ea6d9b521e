//! Platform helpers.

pub mod paths;
