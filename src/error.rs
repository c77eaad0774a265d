//! Top-level error type.
//!
//! Subsystems define their own `thiserror` enums; `GatewayError` wraps them
//! with the name of the operation that failed so log lines can be correlated.

use thiserror::Error;

use crate::config::ConfigError;
use crate::firewall::FirewallError;
use crate::http::UpstreamError;
use crate::net::tls::TlsError;
use crate::replication::{AuthError, ReplicationError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation}: store error: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{operation}: replication error: {source}")]
    Replication {
        operation: &'static str,
        #[source]
        source: ReplicationError,
    },

    #[error("{operation}: firewall error: {source}")]
    Firewall {
        operation: &'static str,
        #[source]
        source: FirewallError,
    },

    #[error("node key rejected: {0}")]
    NodeKey(#[from] AuthError),

    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("upstream setup failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("{operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    pub fn store(operation: &'static str, source: StoreError) -> Self {
        Self::Store { operation, source }
    }

    pub fn replication(operation: &'static str, source: ReplicationError) -> Self {
        Self::Replication { operation, source }
    }

    pub fn firewall(operation: &'static str, source: FirewallError) -> Self {
        Self::Firewall { operation, source }
    }

    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }
}
