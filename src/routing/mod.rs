//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → registry.rs (domain lookup: exact, memo, wildcard)
//!     → Application
//!     → types.rs select_route (prefix → extension → "/")
//!     → Return: candidate destinations or NoRoute
//!
//! Table Compilation (on every configuration change):
//!     ApplicationRecord[] + Domain[]
//!     → Build route maps per application
//!     → Build domain map
//!     → Swap the whole RouteTable
//! ```
//!
//! # Design Decisions
//! - Tables are rebuilt and swapped, never edited in place
//! - No regex in hot path (byte scanning only)
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod registry;
pub mod types;

pub use registry::{DomainRoute, RouteRegistry, RouteTable};
pub use types::{
    Application, ApplicationRecord, Certificate, Destination, Domain, InternalScheme, IpMethod,
    RouteKind,
};
