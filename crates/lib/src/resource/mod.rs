//! Resource identity and object bodies.

pub mod object;
pub mod types;

pub use object::{Resource, ResourceError, selector_matches};
pub use types::{ResourceDescriptor, ResourceId, Scope, split_api_version};
