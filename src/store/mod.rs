//! Persistent store collaborator.
//!
//! # Responsibilities
//! - CRUD for every configuration entity owned by the primary
//! - Settings, including the replication watermarks
//! - Append-only hit and CC logs with age based purge
//!
//! # Design Decisions
//! - The trait is synchronous; implementations are expected to be fast local
//!   stores and callers on the request path never touch them directly
//! - Entities submitted with id 0 get an id assigned by the store

pub mod json;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::firewall::{CcLog, CcPolicy, GroupHitLog, GroupPolicy, VulnType};
use crate::replication::types::Node;
use crate::routing::{ApplicationRecord, Certificate, Domain};

pub use json::JsonStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed data file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Global CC policy cannot be deleted")]
    GlobalPolicyProtected,

    #[error("Invalid {entity}: {reason}")]
    Invalid { entity: &'static str, reason: String },
}

/// Replication watermarks and routine intervals.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct SyncSettings {
    /// Unix seconds of the last backend configuration change.
    #[serde(rename = "Backend_Last_Modified", default)]
    pub backend_last_modified: i64,

    /// Unix seconds of the last firewall configuration change.
    #[serde(rename = "Firewall_Last_Modified", default)]
    pub firewall_last_modified: i64,

    /// Replica poll interval.
    #[serde(rename = "Sync_Seconds", default = "default_sync_seconds")]
    pub sync_seconds: u64,

    /// Age after which hit logs are purged.
    #[serde(rename = "Log_Expire_Seconds", default = "default_log_expire_seconds")]
    pub log_expire_seconds: i64,
}

fn default_sync_seconds() -> u64 {
    600
}

fn default_log_expire_seconds() -> i64 {
    7 * 86_400
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backend_last_modified: 0,
            firewall_last_modified: 0,
            sync_seconds: default_sync_seconds(),
            log_expire_seconds: default_log_expire_seconds(),
        }
    }
}

/// OAuth gate settings. Provider internals are external.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct OAuthConfig {
    pub enabled: bool,
    pub provider: String,
    /// Where unauthenticated clients are sent.
    pub entrance: String,
}

pub trait Store: Send + Sync {
    fn applications(&self) -> StoreResult<Vec<ApplicationRecord>>;
    fn upsert_application(&self, app: ApplicationRecord) -> StoreResult<ApplicationRecord>;
    /// Removes the application and every domain pointing at it.
    fn delete_application(&self, id: i64) -> StoreResult<()>;

    fn domains(&self) -> StoreResult<Vec<Domain>>;
    fn upsert_domain(&self, domain: Domain) -> StoreResult<Domain>;
    fn delete_domain(&self, id: i64) -> StoreResult<()>;

    fn certificates(&self) -> StoreResult<Vec<Certificate>>;
    fn upsert_certificate(&self, cert: Certificate) -> StoreResult<Certificate>;

    fn cc_policies(&self) -> StoreResult<Vec<CcPolicy>>;
    fn upsert_cc_policy(&self, policy: CcPolicy) -> StoreResult<CcPolicy>;
    fn delete_cc_policy(&self, app_id: i64) -> StoreResult<()>;

    fn group_policies(&self) -> StoreResult<Vec<GroupPolicy>>;
    /// Check items with id 0 get fresh ids; their `group_policy_id` is set.
    fn upsert_group_policy(&self, group: GroupPolicy) -> StoreResult<GroupPolicy>;
    fn delete_group_policy(&self, id: i64) -> StoreResult<()>;

    fn vuln_types(&self) -> StoreResult<Vec<VulnType>>;

    fn settings(&self) -> StoreResult<SyncSettings>;
    fn save_settings(&self, settings: SyncSettings) -> StoreResult<()>;

    fn oauth_config(&self) -> StoreResult<OAuthConfig>;

    fn nodes(&self) -> StoreResult<Vec<Node>>;
    /// Record a replica call, inserting the node on first contact from `ip`.
    fn touch_node(&self, version: &str, ip: &str, now: i64) -> StoreResult<Node>;

    fn insert_group_hit(&self, log: GroupHitLog) -> StoreResult<()>;
    fn insert_cc_log(&self, log: CcLog) -> StoreResult<()>;
    /// Drop logs with `request_time` before `cutoff`. Returns how many went.
    fn purge_logs_before(&self, cutoff: i64) -> StoreResult<usize>;

    /// Re-read the backing data. Returns whether configuration changed.
    fn refresh(&self) -> StoreResult<bool> {
        Ok(false)
    }
}
