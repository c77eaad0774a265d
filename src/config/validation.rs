//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Role specific requirements (primary needs an admin key, replica a sync address)
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{GatewayConfig, NodeRole};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("node_key must be 64 hex characters")]
    NodeKey,

    #[error("{field}: invalid socket address '{value}'")]
    Address { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("primary.admin_api_key must not be empty")]
    MissingAdminKey,

    #[error("{field} must start with '/'")]
    Path { field: &'static str },

    #[error("replica.sync_addr: {0}")]
    SyncAddr(String),

    #[error("waf.checkpoint_order lists a checkpoint more than once")]
    DuplicateCheckPoint,

    #[error("firewall.table must be a non-empty identifier")]
    TableName,
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.node_key.len() != 64 || hex::decode(&config.node_key).is_err() {
        errors.push(ValidationError::NodeKey);
    }

    check_address(&mut errors, "listener.http_address", &config.listener.http_address);
    if config.listener.https_enabled {
        check_address(&mut errors, "listener.https_address", &config.listener.https_address);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero { field: "listener.max_connections" });
    }

    match config.node_role {
        NodeRole::Primary => {
            check_address(&mut errors, "primary.admin_address", &config.primary.admin_address);
            if config.primary.admin_api_key.is_empty() {
                errors.push(ValidationError::MissingAdminKey);
            }
            if !config.primary.rpc_path.starts_with('/') {
                errors.push(ValidationError::Path { field: "primary.rpc_path" });
            }
        }
        NodeRole::Replica => {
            match url::Url::parse(&config.replica.sync_addr) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => errors.push(ValidationError::SyncAddr(format!(
                    "unsupported scheme '{}'",
                    url.scheme()
                ))),
                Err(e) => errors.push(ValidationError::SyncAddr(e.to_string())),
            }
            if config.replica.initial_sync_seconds == 0 {
                errors.push(ValidationError::Zero { field: "replica.initial_sync_seconds" });
            }
            if config.replica.request_timeout_secs == 0 {
                errors.push(ValidationError::Zero { field: "replica.request_timeout_secs" });
            }
            if config.replica.startup_attempts == 0 {
                errors.push(ValidationError::Zero { field: "replica.startup_attempts" });
            }
        }
    }

    for (field, value) in [
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("timeouts.tls_handshake_secs", config.timeouts.tls_handshake_secs),
        ("waf.challenge_ttl_secs", config.waf.challenge_ttl_secs),
        ("waf.challenge_sweep_secs", config.waf.challenge_sweep_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if !config.waf.challenge_path.starts_with('/') {
        errors.push(ValidationError::Path { field: "waf.challenge_path" });
    }

    let mut seen = HashSet::new();
    if !config.waf.checkpoint_order.iter().all(|cp| seen.insert(*cp)) {
        errors.push(ValidationError::DuplicateCheckPoint);
    }

    let table = &config.firewall.table;
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        errors.push(ValidationError::TableName);
    }

    if config.dispatch.queue_capacity == 0 {
        errors.push(ValidationError::Zero { field: "dispatch.queue_capacity" });
    }

    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::Address { field, value: value.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_primary() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.node_key = "11".repeat(32);
        config.primary.admin_api_key = "secret".into();
        config
    }

    #[test]
    fn test_valid_primary_passes() {
        assert_eq!(validate_config(&valid_primary()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = valid_primary();
        config.node_key = "zz".into();
        config.primary.admin_api_key.clear();
        config.timeouts.request_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::NodeKey));
        assert!(errors.contains(&ValidationError::MissingAdminKey));
        assert!(errors.contains(&ValidationError::Zero { field: "timeouts.request_secs" }));
    }

    #[test]
    fn test_replica_requires_http_sync_addr() {
        let mut config = valid_primary();
        config.node_role = NodeRole::Replica;
        config.replica.sync_addr = "ftp://primary/api".into();

        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::SyncAddr(_)));
    }

    #[test]
    fn test_duplicate_checkpoint_rejected() {
        let mut config = valid_primary();
        config.waf.checkpoint_order.push(config.waf.checkpoint_order[0]);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::DuplicateCheckPoint]);
    }
}
