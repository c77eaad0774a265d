//! Flood (CC) detection.
//!
//! # Responsibilities
//! - Count requests per client fingerprint under the owning CC policy
//! - Flip a client to blocked once it reaches the policy's threshold
//! - Decay counters on a per-policy timer
//!
//! # Design Decisions
//! - Counters live in a sharded map per policy; mutations happen under the
//!   shard lock of the fingerprint's entry, never as read-then-write
//! - Every timer tick evicts all clients that are not blocked, so the window
//!   restarts on each tick instead of sliding
//! - Applications without a dedicated policy share the global policy's table,
//!   keyed by fingerprint only
//! - Timers are tokio tasks aborted when their handle is dropped; policy
//!   updates therefore need a running runtime

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::firewall::fingerprint::flood_fingerprint;
use crate::firewall::types::{CcPolicy, ClientStat, RequestView};
use crate::firewall::FirewallError;

type StatTable = Arc<DashMap<String, ClientStat>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloodVerdict {
    Clean,
    Attack {
        policy: Arc<CcPolicy>,
        client_id: String,
        /// True only for the first request seen while blocked.
        need_log: bool,
    },
}

impl FloodVerdict {
    pub fn is_attack(&self) -> bool {
        matches!(self, FloodVerdict::Attack { .. })
    }
}

struct DecayTimer {
    interval_ms: u64,
    handle: JoinHandle<()>,
}

impl DecayTimer {
    fn start(app_id: i64, interval_ms: u64, stats: StatTable) -> Self {
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms);
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(app_id, interval_ms, "CC decay timer started");
            loop {
                ticker.tick().await;
                decay(&stats, interval_ms as i64);
            }
        });
        Self { interval_ms, handle }
    }
}

impl Drop for DecayTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One decay step: blocked clients lose `elapsed_ms` of block time and are
/// evicted when it runs out; everyone else is evicted.
fn decay(stats: &DashMap<String, ClientStat>, elapsed_ms: i64) {
    stats.retain(|_, stat| {
        if stat.is_bad {
            stat.remain_ms -= elapsed_ms;
            stat.remain_ms > 0
        } else {
            false
        }
    });
}

pub struct FloodDetector {
    policies: DashMap<i64, Arc<CcPolicy>>,
    stats: DashMap<i64, StatTable>,
    timers: DashMap<i64, DecayTimer>,
}

impl FloodDetector {
    /// A detector holding only the default global policy, with no timer.
    pub fn new() -> Self {
        let policies = DashMap::new();
        policies.insert(CcPolicy::GLOBAL_ID, Arc::new(CcPolicy::global()));
        Self {
            policies,
            stats: DashMap::new(),
            timers: DashMap::new(),
        }
    }

    /// Policy governing `app_id`: its own, else the global one.
    pub fn policy_for(&self, app_id: i64) -> Arc<CcPolicy> {
        if let Some(policy) = self.policies.get(&app_id) {
            return policy.value().clone();
        }
        match self.policies.get(&CcPolicy::GLOBAL_ID) {
            Some(policy) => policy.value().clone(),
            None => Arc::new(CcPolicy::global()),
        }
    }

    pub fn policies(&self) -> Vec<CcPolicy> {
        let mut policies: Vec<CcPolicy> = self.policies.iter().map(|p| p.value().as_ref().clone()).collect();
        policies.sort_by_key(|p| p.app_id);
        policies
    }

    /// Count one request and report whether the client is flooding.
    pub fn inspect(&self, app_id: i64, src_ip: &str, view: &RequestView<'_>) -> FloodVerdict {
        let policy = self.policy_for(app_id);
        if !policy.is_enabled {
            return FloodVerdict::Clean;
        }

        let client_id = flood_fingerprint(&policy, src_ip, view);
        let stats = self.stat_table(policy.app_id);
        let mut stat = stats.entry(client_id.clone()).or_default();

        if stat.is_bad {
            stat.count += 1;
            let need_log = stat.count == 1;
            drop(stat);
            return FloodVerdict::Attack { policy, client_id, need_log };
        }

        if stat.count >= policy.max_count {
            stat.is_bad = true;
            stat.count = 0;
            stat.remain_ms = (policy.block_seconds as i64).saturating_mul(1000);
            tracing::info!(
                app_id = policy.app_id,
                client_id = %client_id,
                block_seconds = policy.block_seconds,
                "Client flagged by CC policy"
            );
        } else {
            stat.count += 1;
        }
        FloodVerdict::Clean
    }

    /// Add or replace a policy. The decay timer is restarted when the interval
    /// changed and stopped when the policy is disabled.
    pub fn upsert_policy(&self, policy: CcPolicy) -> Result<(), FirewallError> {
        validate(&policy)?;

        let app_id = policy.app_id;
        let interval_ms = policy.interval_ms;
        let enabled = policy.is_enabled;
        self.policies.insert(app_id, Arc::new(policy));
        let stats = self.stat_table(app_id);

        if enabled {
            let restart = match self.timers.get(&app_id) {
                Some(timer) => timer.interval_ms != interval_ms,
                None => true,
            };
            if restart {
                // Replacing the entry drops, and so aborts, the previous timer.
                self.timers.insert(app_id, DecayTimer::start(app_id, interval_ms, stats));
            }
        } else if self.timers.remove(&app_id).is_some() {
            tracing::debug!(app_id, "CC decay timer stopped");
        }
        Ok(())
    }

    /// Remove an application's policy. The global policy cannot be deleted.
    pub fn delete_policy(&self, app_id: i64) -> Result<(), FirewallError> {
        if app_id == CcPolicy::GLOBAL_ID {
            return Err(FirewallError::GlobalPolicyProtected);
        }
        self.timers.remove(&app_id);
        self.policies.remove(&app_id);
        self.stats.remove(&app_id);
        Ok(())
    }

    /// Replace every policy. All policies are validated before any is applied.
    pub fn load(&self, policies: Vec<CcPolicy>) -> Result<(), FirewallError> {
        for policy in &policies {
            validate(policy)?;
        }

        let keep: HashSet<i64> = policies.iter().map(|p| p.app_id).collect();
        let stale: Vec<i64> = self
            .policies
            .iter()
            .map(|p| *p.key())
            .filter(|id| *id != CcPolicy::GLOBAL_ID && !keep.contains(id))
            .collect();
        for app_id in stale {
            self.delete_policy(app_id)?;
        }

        for policy in policies {
            self.upsert_policy(policy)?;
        }
        if !keep.contains(&CcPolicy::GLOBAL_ID) {
            // Keep the global policy in force and make sure its counters decay.
            let global = self.policy_for(CcPolicy::GLOBAL_ID).as_ref().clone();
            self.upsert_policy(global)?;
        }
        Ok(())
    }

    /// Forget a client, e.g. after it solved a challenge.
    pub fn clear_client(&self, app_id: i64, client_id: &str) {
        let table_id = self.policy_for(app_id).app_id;
        if let Some(stats) = self.stats.get(&table_id) {
            stats.remove(client_id);
        }
    }

    /// Run one decay step on the table used by `app_id`.
    pub fn decay(&self, app_id: i64, elapsed_ms: i64) {
        let table_id = self.policy_for(app_id).app_id;
        if let Some(stats) = self.stats.get(&table_id) {
            decay(stats.value(), elapsed_ms);
        }
    }

    pub fn client_stat(&self, app_id: i64, client_id: &str) -> Option<ClientStat> {
        let table_id = self.policy_for(app_id).app_id;
        self.stats.get(&table_id)?.get(client_id).map(|s| *s)
    }

    pub fn tracked_clients(&self, app_id: i64) -> usize {
        let table_id = self.policy_for(app_id).app_id;
        self.stats.get(&table_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Interval of the running timer for a policy, if any.
    pub fn timer_interval(&self, app_id: i64) -> Option<u64> {
        self.timers.get(&app_id).map(|t| t.interval_ms)
    }

    /// Abort every decay timer.
    pub fn stop_timers(&self) {
        self.timers.clear();
    }

    fn stat_table(&self, table_id: i64) -> StatTable {
        self.stats.entry(table_id).or_default().value().clone()
    }
}

impl Default for FloodDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(policy: &CcPolicy) -> Result<(), FirewallError> {
    if policy.interval_ms == 0 {
        return Err(FirewallError::InvalidPolicy(format!(
            "CC policy {}: interval_ms must be greater than zero",
            policy.app_id
        )));
    }
    if policy.max_count == 0 {
        return Err(FirewallError::InvalidPolicy(format!(
            "CC policy {}: max_count must be greater than zero",
            policy.app_id
        )));
    }
    Ok(())
}
