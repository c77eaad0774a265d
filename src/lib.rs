//! WAF gateway library: a reverse proxy with flood detection, group policy
//! inspection and primary/replica configuration replication.

pub mod admin;
pub mod clock;
pub mod config;
pub mod error;
pub mod firewall;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod manager;
pub mod net;
pub mod observability;
pub mod replication;
pub mod routing;
pub mod security;
pub mod store;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use lifecycle::Shutdown;
