//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → listeners drain → routines stop
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//!
//! Routines (routines.rs):
//!     log retention, challenge sweep, data file reload
//! ```
//!
//! # Design Decisions
//! - Every long-running task holds a shutdown receiver, so the shutdown
//!   drain can tell when they are all gone
//! - Shutdown has a deadline: tasks still running after it are abandoned

pub mod routines;
pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
