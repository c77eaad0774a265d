//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Emit access log events on their own target
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level
//! - Access events go to target `access` so they can be filtered or routed
//!   separately from diagnostics

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Safe to call once per process.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("waf_gateway={level},tower_http=info,access=info").into());
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Access log collaborator.
#[derive(Debug, Clone, Copy)]
pub struct AccessLogger {
    enabled: bool,
}

impl AccessLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn log(&self, domain: &str, method: &str, ip: &str, url: &str, user_agent: &str) {
        if self.enabled {
            tracing::info!(target: "access", domain, method, ip, url, user_agent, "request");
        }
    }
}
