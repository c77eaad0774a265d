//! Configuration lifecycle of a node.
//!
//! # Responsibilities
//! - Pull backend and firewall configuration from the local store (primary)
//!   or from the primary over RPC (replica)
//! - Rebuild routing, certificates, flood policies and group policies
//! - Track the watermarks the current configuration corresponds to
//!
//! # Data Flow
//! ```text
//! Store / ReplicationClient
//!     → snapshot (records)
//!     → RouteTable::build + CertificateResolver::rebuild   (backend)
//!     → FloodDetector::load + PolicyEngine::load           (firewall)
//!     → swap into the live registries
//! ```
//!
//! # Design Decisions
//! - Snapshots are fetched completely before anything is swapped, so a failed
//!   fetch leaves the running configuration untouched
//! - Watermarks on the primary only move forward, by at least one second per
//!   bump, so two edits within the same second are both seen by replicas

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::clock::unix_now;
use crate::error::GatewayError;
use crate::firewall::{CcPolicy, FloodDetector, GroupPolicy, PolicyEngine, VulnType};
use crate::net::tls::CertificateResolver;
use crate::replication::ReplicationClient;
use crate::routing::{ApplicationRecord, Certificate, Domain, RouteRegistry, RouteTable};
use crate::store::{OAuthConfig, Store, SyncSettings};

const MAX_INITIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Where configuration comes from.
#[derive(Clone)]
pub enum ConfigSource {
    Store(Arc<dyn Store>),
    Primary(Arc<ReplicationClient>),
}

struct BackendSnapshot {
    applications: Vec<ApplicationRecord>,
    domains: Vec<Domain>,
    certificates: Vec<Certificate>,
    oauth: OAuthConfig,
}

struct FirewallSnapshot {
    cc_policies: Vec<CcPolicy>,
    group_policies: Vec<GroupPolicy>,
    vuln_types: Vec<VulnType>,
}

/// Which subsystem a reload or watermark refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Backend,
    Firewall,
}

impl Subsystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Backend => "backend",
            Subsystem::Firewall => "firewall",
        }
    }
}

pub struct ConfigManager {
    source: ConfigSource,
    routes: Arc<RouteRegistry>,
    certificates: Arc<CertificateResolver>,
    flood: Arc<FloodDetector>,
    policies: Arc<PolicyEngine>,
    oauth: ArcSwap<OAuthConfig>,
    applied: Mutex<SyncSettings>,
    backend_in_flight: AtomicBool,
    firewall_in_flight: AtomicBool,
}

impl ConfigManager {
    pub fn new(
        source: ConfigSource,
        routes: Arc<RouteRegistry>,
        certificates: Arc<CertificateResolver>,
        flood: Arc<FloodDetector>,
        policies: Arc<PolicyEngine>,
    ) -> Self {
        let applied = SyncSettings {
            backend_last_modified: 0,
            firewall_last_modified: 0,
            ..SyncSettings::default()
        };
        Self {
            source,
            routes,
            certificates,
            flood,
            policies,
            oauth: ArcSwap::from_pointee(OAuthConfig::default()),
            applied: Mutex::new(applied),
            backend_in_flight: AtomicBool::new(false),
            firewall_in_flight: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn flood(&self) -> &Arc<FloodDetector> {
        &self.flood
    }

    pub fn policies(&self) -> &Arc<PolicyEngine> {
        &self.policies
    }

    pub fn certificates(&self) -> &Arc<CertificateResolver> {
        &self.certificates
    }

    pub fn oauth(&self) -> Arc<OAuthConfig> {
        self.oauth.load_full()
    }

    /// The store, when this node owns one.
    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        match &self.source {
            ConfigSource::Store(store) => Some(store),
            ConfigSource::Primary(_) => None,
        }
    }

    /// Watermarks of the configuration currently applied.
    pub fn applied(&self) -> SyncSettings {
        *self.applied.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Settings as reported by the source.
    pub async fn fetch_settings(&self) -> Result<SyncSettings, GatewayError> {
        match &self.source {
            ConfigSource::Store(store) => store.settings().map_err(|e| GatewayError::store("settings", e)),
            ConfigSource::Primary(client) => client
                .fetch_settings()
                .await
                .map_err(|e| GatewayError::replication("getsettings", e)),
        }
    }

    /// Load everything and record the source's watermarks as applied.
    pub async fn reload_all(&self) -> Result<(), GatewayError> {
        let settings = self.fetch_settings().await?;
        self.reload_backend().await?;
        self.reload_firewall().await?;
        self.mark_applied(Subsystem::Backend, settings.backend_last_modified);
        self.mark_applied(Subsystem::Firewall, settings.firewall_last_modified);
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).sync_seconds = settings.sync_seconds;
        Ok(())
    }

    /// Startup load. Retries with doubling backoff and returns the last error
    /// once `attempts` are spent; nothing may be served before this succeeds.
    pub async fn load_initial(&self, attempts: u32, backoff: Duration) -> Result<(), GatewayError> {
        let mut delay = backoff;
        let mut attempt = 1;
        loop {
            match self.reload_all().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts.max(1) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, retry_in_ms = delay.as_millis() as u64, "Initial configuration load failed");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_INITIAL_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }

    pub async fn reload_backend(&self) -> Result<(), GatewayError> {
        let snapshot = self.backend_snapshot().await?;
        let table = RouteTable::build(&snapshot.applications, &snapshot.domains);
        let with_certs = self.certificates.rebuild(&snapshot.domains, &snapshot.certificates);
        tracing::info!(
            applications = snapshot.applications.len(),
            domains = table.domain_count(),
            tls_names = with_certs,
            "Backend configuration loaded"
        );
        self.routes.replace(table);
        self.oauth.store(Arc::new(snapshot.oauth));
        Ok(())
    }

    pub async fn reload_firewall(&self) -> Result<(), GatewayError> {
        let snapshot = self.firewall_snapshot().await?;
        let cc_count = snapshot.cc_policies.len();
        let group_count = snapshot.group_policies.len();
        self.flood
            .load(snapshot.cc_policies)
            .map_err(|e| GatewayError::firewall("load cc policies", e))?;
        self.policies
            .load(snapshot.group_policies, snapshot.vuln_types)
            .map_err(|e| GatewayError::firewall("load group policies", e))?;
        tracing::info!(
            cc_policies = cc_count,
            group_policies = group_count,
            check_items = self.policies.indexed_items(),
            "Firewall configuration loaded"
        );
        Ok(())
    }

    /// Reload one subsystem unless a reload of it is already running. Returns
    /// `false` when skipped.
    pub async fn reload_guarded(&self, subsystem: Subsystem, watermark: i64) -> Result<bool, GatewayError> {
        let flag = match subsystem {
            Subsystem::Backend => &self.backend_in_flight,
            Subsystem::Firewall => &self.firewall_in_flight,
        };
        if flag.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = match subsystem {
            Subsystem::Backend => self.reload_backend().await,
            Subsystem::Firewall => self.reload_firewall().await,
        };
        flag.store(false, Ordering::Release);
        result?;
        self.mark_applied(subsystem, watermark);
        Ok(true)
    }

    pub fn mark_applied(&self, subsystem: Subsystem, watermark: i64) {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        match subsystem {
            Subsystem::Backend => applied.backend_last_modified = applied.backend_last_modified.max(watermark),
            Subsystem::Firewall => applied.firewall_last_modified = applied.firewall_last_modified.max(watermark),
        }
    }

    pub fn set_sync_seconds(&self, seconds: u64) {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).sync_seconds = seconds;
    }

    /// Record a configuration change in the store so replicas pick it up.
    /// No-op on replicas.
    pub fn bump_watermark(&self, subsystem: Subsystem) -> Result<i64, GatewayError> {
        let Some(store) = self.store() else {
            return Ok(0);
        };
        let mut settings = store.settings().map_err(|e| GatewayError::store("settings", e))?;
        let slot = match subsystem {
            Subsystem::Backend => &mut settings.backend_last_modified,
            Subsystem::Firewall => &mut settings.firewall_last_modified,
        };
        *slot = unix_now().max(*slot + 1);
        let watermark = *slot;
        store
            .save_settings(settings)
            .map_err(|e| GatewayError::store("save settings", e))?;
        self.mark_applied(subsystem, watermark);
        tracing::debug!(subsystem = subsystem.as_str(), watermark, "Watermark bumped");
        Ok(watermark)
    }

    /// The data file changed on disk: re-read it and, if the configuration
    /// differs, rebuild everything and bump both watermarks.
    pub async fn refresh_from_store(&self) -> Result<bool, GatewayError> {
        let Some(store) = self.store() else {
            return Ok(false);
        };
        if !store.refresh().map_err(|e| GatewayError::store("refresh", e))? {
            return Ok(false);
        }
        self.reload_backend().await?;
        self.reload_firewall().await?;
        self.bump_watermark(Subsystem::Backend)?;
        self.bump_watermark(Subsystem::Firewall)?;
        tracing::info!("Data file change applied");
        Ok(true)
    }

    async fn backend_snapshot(&self) -> Result<BackendSnapshot, GatewayError> {
        match &self.source {
            ConfigSource::Store(store) => {
                let e = |op| move |source| GatewayError::store(op, source);
                Ok(BackendSnapshot {
                    applications: store.applications().map_err(e("applications"))?,
                    domains: store.domains().map_err(e("domains"))?,
                    certificates: store.certificates().map_err(e("certificates"))?,
                    oauth: store.oauth_config().map_err(e("oauth config"))?,
                })
            }
            ConfigSource::Primary(client) => {
                let e = |op| move |source| GatewayError::replication(op, source);
                Ok(BackendSnapshot {
                    applications: client.fetch_applications().await.map_err(e("getapps"))?,
                    domains: client.fetch_domains().await.map_err(e("getdomains"))?,
                    certificates: client.fetch_certificates().await.map_err(e("getcerts"))?,
                    oauth: client.fetch_oauth_config().await.map_err(e("getoauthconf"))?,
                })
            }
        }
    }

    async fn firewall_snapshot(&self) -> Result<FirewallSnapshot, GatewayError> {
        match &self.source {
            ConfigSource::Store(store) => {
                let e = |op| move |source| GatewayError::store(op, source);
                Ok(FirewallSnapshot {
                    cc_policies: store.cc_policies().map_err(e("cc policies"))?,
                    group_policies: store.group_policies().map_err(e("group policies"))?,
                    vuln_types: store.vuln_types().map_err(e("vuln types"))?,
                })
            }
            ConfigSource::Primary(client) => {
                let e = |op| move |source| GatewayError::replication(op, source);
                Ok(FirewallSnapshot {
                    cc_policies: client.fetch_cc_policies().await.map_err(e("getccpolicies"))?,
                    group_policies: client.fetch_group_policies().await.map_err(e("getgrouppolicies"))?,
                    vuln_types: client.fetch_vuln_types().await.map_err(e("getvulntypes"))?,
                })
            }
        }
    }
}
