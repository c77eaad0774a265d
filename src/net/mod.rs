//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Plain listener (port 80) ─────────────────────────┐
//! TLS listener (port 443)                           ├→ gateway router
//!     → tls.rs (SNI certificate, ALPN h2/http1.1) ──┘
//! ```
//!
//! # Design Decisions
//! - Both listeners serve the same router; handlers learn which one a
//!   request came through from the `ListenerKind` extension

pub mod tls;

pub use tls::{server_config, CertificateResolver, TlsError};

/// Which public listener accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Plain,
    Tls,
}
