//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared by value or Arc to all subsystems
//!
//! On the primary, the data file (not the node config) is hot reloaded:
//!     watcher.rs detects change
//!     → store refresh
//!     → ConfigManager::reload (rebuild then swap)
//!     → replicas observe bumped watermarks
//! ```
//!
//! # Design Decisions
//! - Node config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    DispatchConfig, FirewallConfig, GatewayConfig, ListenerConfig, NodeRole, ObservabilityConfig,
    PrimaryConfig, ReplicaConfig, TimeoutConfig, WafConfig,
};
pub use validation::ValidationError;
