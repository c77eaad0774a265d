//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a gateway node.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::firewall::CheckPoint;

/// Role of this node in the replication topology.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Authoritative node owning the data store.
    #[default]
    Primary,
    /// Pulls its configuration from a primary.
    Replica,
}

/// Root configuration for a gateway node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub node_role: NodeRole,

    /// Hex encoded 32 byte key shared by the primary and every replica.
    pub node_key: String,

    /// Version string reported to the primary on every replication call.
    pub node_version: String,

    pub listener: ListenerConfig,
    pub primary: PrimaryConfig,
    pub replica: ReplicaConfig,
    pub timeouts: TimeoutConfig,
    pub waf: WafConfig,
    pub firewall: FirewallConfig,
    pub dispatch: DispatchConfig,
    pub observability: ObservabilityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_role: NodeRole::Primary,
            node_key: String::new(),
            node_version: env!("CARGO_PKG_VERSION").to_string(),
            listener: ListenerConfig::default(),
            primary: PrimaryConfig::default(),
            replica: ReplicaConfig::default(),
            timeouts: TimeoutConfig::default(),
            waf: WafConfig::default(),
            firewall: FirewallConfig::default(),
            dispatch: DispatchConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn is_primary(&self) -> bool {
        self.node_role == NodeRole::Primary
    }
}

/// Public listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Plaintext bind address.
    pub http_address: String,

    /// TLS bind address.
    pub https_address: String,

    /// Serve TLS with SNI certificate selection.
    pub https_enabled: bool,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0:80".to_string(),
            https_address: "0.0.0.0:443".to_string(),
            https_enabled: true,
            max_connections: 10_000,
        }
    }
}

/// Settings only used when `node_role = "primary"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrimaryConfig {
    /// JSON data file backing the store.
    pub data_path: String,

    /// Bind address for the admin API and the replication endpoint.
    pub admin_address: String,

    /// Bearer token for the admin API.
    pub admin_api_key: String,

    /// Path of the replication RPC endpoint.
    pub rpc_path: String,

    /// Reload when the data file changes on disk.
    pub watch_data_file: bool,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            data_path: "./data/gateway.json".to_string(),
            admin_address: "127.0.0.1:9527".to_string(),
            admin_api_key: String::new(),
            rpc_path: "/gateway/api".to_string(),
            watch_data_file: true,
        }
    }
}

/// Settings only used when `node_role = "replica"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Full URL of the primary's replication endpoint.
    pub sync_addr: String,

    /// Poll interval used until the primary reports `Sync_Seconds`.
    pub initial_sync_seconds: u64,

    /// Timeout for a single replication call.
    pub request_timeout_secs: u64,

    /// Attempts at the first sync before startup is abandoned.
    pub startup_attempts: u32,

    /// Delay before the second attempt; doubles after each failure.
    pub startup_backoff_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            sync_addr: "http://127.0.0.1:9527/gateway/api".to_string(),
            initial_sync_seconds: 120,
            request_timeout_secs: 10,
            startup_attempts: 5,
            startup_backoff_ms: 1000,
        }
    }
}

/// Timeout configuration for backend traffic.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Idle pooled backend connection timeout in seconds.
    pub idle_secs: u64,

    /// Client TLS handshake timeout in seconds.
    pub tls_handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 60,
            idle_secs: 30,
            tls_handshake_secs: 10,
        }
    }
}

/// Request inspection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WafConfig {
    /// Order in which checkpoint buckets are evaluated. First match wins.
    pub checkpoint_order: Vec<CheckPoint>,

    /// Mount point of the challenge endpoints.
    pub challenge_path: String,

    /// Lifetime of a pending challenge and of a granted pass.
    pub challenge_ttl_secs: u64,

    /// Interval of the challenge cache sweep.
    pub challenge_sweep_secs: u64,

    /// Extensions that skip flood and policy inspection.
    pub static_extensions: Vec<String>,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            checkpoint_order: CheckPoint::default_order().to_vec(),
            challenge_path: "/captcha".to_string(),
            challenge_ttl_secs: 300,
            challenge_sweep_secs: 60,
            static_extensions: [
                ".js", ".css", ".png", ".jpg", ".jpeg", ".gif", ".ico", ".svg", ".bmp",
                ".webp", ".woff", ".woff2", ".ttf", ".eot", ".mp4", ".mp3",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Kernel packet filter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Mirror flood blocks into an nftables timed set.
    pub kernel_blocklist: bool,

    /// nftables table name.
    pub table: String,

    /// Path or name of the `nft` binary.
    pub nft_binary: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            kernel_blocklist: true,
            table: "waf_gateway".to_string(),
            nft_binary: "nft".to_string(),
        }
    }
}

/// Background task queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit one `access` event per proxied request.
    pub access_log: bool,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Prometheus listener address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            access_log: true,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
