//! Destination selection subsystem.
//!
//! # Data Flow
//! ```text
//! Route selected → candidate destinations identified
//!     → Apply selection strategy:
//!         - affinity.rs (FNV-1a over source IP + user agent)
//!     → rewrite.rs (request-route prefix → backend-route prefix)
//!     → Return destination and upstream path
//! ```
//!
//! # Design Decisions
//! - Selectors are stateless; affinity comes from hashing, not a session table
//! - Identical client attributes map to the same destination while the
//!   candidate set is unchanged

use std::sync::Arc;

use crate::routing::Destination;

pub mod affinity;
pub mod rewrite;

pub use affinity::{client_identity, fnv1a32, AffinitySelector};
pub use rewrite::rewrite_path;

/// Trait for destination selection strategies.
pub trait DestinationSelector: Send + Sync + std::fmt::Debug {
    /// Pick one destination for the given client identity.
    fn select(&self, candidates: &[Arc<Destination>], client: &str) -> Option<Arc<Destination>>;
}
