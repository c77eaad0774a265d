//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured events, access log target)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → stdout (tracing fmt layer)
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - Request ids are stamped by tower-http and flow to backends
//! - Metrics are cheap (atomic increments) and optional

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, AccessLogger};
