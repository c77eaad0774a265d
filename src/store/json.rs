//! Reference store over a JSON data file.
//!
//! The whole dataset lives in memory. Every mutation is applied to a copy,
//! written to `<path>.tmp` and renamed over the data file, and only then
//! committed to memory, so a failed write leaves both unchanged. Hit logs are
//! kept in memory only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::clock::unix_now;
use crate::firewall::{CcLog, CcPolicy, GroupHitLog, GroupPolicy, VulnType};
use crate::replication::types::Node;
use crate::routing::{ApplicationRecord, Certificate, Domain};
use crate::store::{OAuthConfig, Store, StoreError, StoreResult, SyncSettings};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
struct StoreData {
    applications: Vec<ApplicationRecord>,
    domains: Vec<Domain>,
    certificates: Vec<Certificate>,
    cc_policies: Vec<CcPolicy>,
    group_policies: Vec<GroupPolicy>,
    vuln_types: Vec<VulnType>,
    settings: SyncSettings,
    oauth: OAuthConfig,
    nodes: Vec<Node>,
}

impl StoreData {
    /// Fill in what a fresh or hand-written data file may lack.
    fn seed(&mut self) {
        if !self.cc_policies.iter().any(CcPolicy::is_global) {
            self.cc_policies.insert(0, CcPolicy::global());
        }
        if self.vuln_types.is_empty() {
            self.vuln_types = VulnType::defaults();
        }
        let now = unix_now();
        if self.settings.backend_last_modified == 0 {
            self.settings.backend_last_modified = now;
        }
        if self.settings.firewall_last_modified == 0 {
            self.settings.firewall_last_modified = now;
        }
    }
}

#[derive(Debug, Default)]
struct LogData {
    group_hits: Vec<GroupHitLog>,
    cc_logs: Vec<CcLog>,
}

#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
    logs: RwLock<LogData>,
}

impl JsonStore {
    /// Open the data file, creating and seeding it when it does not exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            StoreData::default()
        };
        let before = data.clone();
        data.seed();

        let store = Self {
            path: Some(path),
            data: RwLock::new(StoreData::default()),
            logs: RwLock::new(LogData::default()),
        };
        if data != before || !store.path_exists() {
            store.persist(&data)?;
        }
        *store.write() = data;
        Ok(store)
    }

    /// A seeded store that never touches disk.
    pub fn in_memory() -> Self {
        let mut data = StoreData::default();
        data.seed();
        Self {
            path: None,
            data: RwLock::new(data),
            logs: RwLock::new(LogData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn group_hits(&self) -> Vec<GroupHitLog> {
        self.logs.read().unwrap_or_else(|e| e.into_inner()).group_hits.clone()
    }

    pub fn cc_logs(&self) -> Vec<CcLog> {
        self.logs.read().unwrap_or_else(|e| e.into_inner()).cc_logs.clone()
    }

    fn path_exists(&self) -> bool {
        self.path.as_deref().is_some_and(Path::exists)
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreData> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, data: &StoreData) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> StoreResult<T>) -> StoreResult<T> {
        let mut data = self.write();
        let mut next = data.clone();
        let out = f(&mut next)?;
        if next != *data {
            self.persist(&next)?;
            *data = next;
        }
        Ok(out)
    }
}

fn next_id(ids: impl Iterator<Item = i64>) -> i64 {
    ids.max().unwrap_or(0).max(0) + 1
}

/// Insert or replace by id, assigning a fresh id when it is 0.
fn upsert_by_id<T: Clone>(
    items: &mut Vec<T>,
    mut item: T,
    id_of: impl Fn(&T) -> i64,
    set_id: impl FnOnce(&mut T, i64),
) -> T {
    let id = match id_of(&item) {
        0 => {
            let id = next_id(items.iter().map(&id_of));
            set_id(&mut item, id);
            id
        }
        id => id,
    };
    match items.iter_mut().find(|existing| id_of(existing) == id) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
    item
}

impl Store for JsonStore {
    fn applications(&self) -> StoreResult<Vec<ApplicationRecord>> {
        Ok(self.read().applications.clone())
    }

    fn upsert_application(&self, app: ApplicationRecord) -> StoreResult<ApplicationRecord> {
        if app.name.trim().is_empty() {
            return Err(StoreError::Invalid { entity: "application", reason: "name is empty".into() });
        }
        self.mutate(|data| {
            let mut app = app;
            if app.id == 0 {
                app.id = next_id(data.applications.iter().map(|a| a.id));
            }
            let mut next_dest = next_id(data.applications.iter().flat_map(|a| a.destinations.iter().map(|d| d.id)));
            for dest in &mut app.destinations {
                dest.app_id = app.id;
                if dest.id == 0 {
                    dest.id = next_dest;
                    next_dest += 1;
                }
            }
            Ok(upsert_by_id(&mut data.applications, app, |a| a.id, |_, _| {}))
        })
    }

    fn delete_application(&self, id: i64) -> StoreResult<()> {
        self.mutate(|data| {
            let before = data.applications.len();
            data.applications.retain(|a| a.id != id);
            if data.applications.len() == before {
                return Err(StoreError::NotFound { entity: "application", id });
            }
            data.domains.retain(|d| d.app_id != id);
            Ok(())
        })
    }

    fn domains(&self) -> StoreResult<Vec<Domain>> {
        Ok(self.read().domains.clone())
    }

    fn upsert_domain(&self, mut domain: Domain) -> StoreResult<Domain> {
        domain.name = domain.name.trim().to_ascii_lowercase();
        if domain.name.is_empty() {
            return Err(StoreError::Invalid { entity: "domain", reason: "name is empty".into() });
        }
        self.mutate(|data| {
            if !data.applications.iter().any(|a| a.id == domain.app_id) {
                return Err(StoreError::NotFound { entity: "application", id: domain.app_id });
            }
            if data.domains.iter().any(|d| d.name == domain.name && d.id != domain.id) {
                return Err(StoreError::Invalid {
                    entity: "domain",
                    reason: format!("{} already exists", domain.name),
                });
            }
            Ok(upsert_by_id(&mut data.domains, domain, |d| d.id, |d, id| d.id = id))
        })
    }

    fn delete_domain(&self, id: i64) -> StoreResult<()> {
        self.mutate(|data| {
            let before = data.domains.len();
            data.domains.retain(|d| d.id != id);
            if data.domains.len() == before {
                return Err(StoreError::NotFound { entity: "domain", id });
            }
            Ok(())
        })
    }

    fn certificates(&self) -> StoreResult<Vec<Certificate>> {
        Ok(self.read().certificates.clone())
    }

    fn upsert_certificate(&self, cert: Certificate) -> StoreResult<Certificate> {
        self.mutate(|data| Ok(upsert_by_id(&mut data.certificates, cert, |c| c.id, |c, id| c.id = id)))
    }

    fn cc_policies(&self) -> StoreResult<Vec<CcPolicy>> {
        Ok(self.read().cc_policies.clone())
    }

    fn upsert_cc_policy(&self, policy: CcPolicy) -> StoreResult<CcPolicy> {
        self.mutate(|data| {
            match data.cc_policies.iter_mut().find(|p| p.app_id == policy.app_id) {
                Some(existing) => *existing = policy.clone(),
                None => data.cc_policies.push(policy.clone()),
            }
            Ok(policy)
        })
    }

    fn delete_cc_policy(&self, app_id: i64) -> StoreResult<()> {
        if app_id == CcPolicy::GLOBAL_ID {
            return Err(StoreError::GlobalPolicyProtected);
        }
        self.mutate(|data| {
            let before = data.cc_policies.len();
            data.cc_policies.retain(|p| p.app_id != app_id);
            if data.cc_policies.len() == before {
                return Err(StoreError::NotFound { entity: "cc policy", id: app_id });
            }
            Ok(())
        })
    }

    fn group_policies(&self) -> StoreResult<Vec<GroupPolicy>> {
        Ok(self.read().group_policies.clone())
    }

    fn upsert_group_policy(&self, group: GroupPolicy) -> StoreResult<GroupPolicy> {
        self.mutate(|data| {
            let mut next_item =
                next_id(data.group_policies.iter().flat_map(|g| g.check_items.iter().map(|i| i.id)));
            let mut group = group;
            if group.id == 0 {
                group.id = next_id(data.group_policies.iter().map(|g| g.id));
            }
            for item in &mut group.check_items {
                item.group_policy_id = group.id;
                if item.id == 0 {
                    item.id = next_item;
                    next_item += 1;
                }
            }
            group.updated_time = unix_now();
            Ok(upsert_by_id(&mut data.group_policies, group, |g| g.id, |_, _| {}))
        })
    }

    fn delete_group_policy(&self, id: i64) -> StoreResult<()> {
        self.mutate(|data| {
            let before = data.group_policies.len();
            data.group_policies.retain(|g| g.id != id);
            if data.group_policies.len() == before {
                return Err(StoreError::NotFound { entity: "group policy", id });
            }
            Ok(())
        })
    }

    fn vuln_types(&self) -> StoreResult<Vec<VulnType>> {
        Ok(self.read().vuln_types.clone())
    }

    fn settings(&self) -> StoreResult<SyncSettings> {
        Ok(self.read().settings)
    }

    fn save_settings(&self, settings: SyncSettings) -> StoreResult<()> {
        self.mutate(|data| {
            data.settings = settings;
            Ok(())
        })
    }

    fn oauth_config(&self) -> StoreResult<OAuthConfig> {
        Ok(self.read().oauth.clone())
    }

    fn nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self.read().nodes.clone())
    }

    fn touch_node(&self, version: &str, ip: &str, now: i64) -> StoreResult<Node> {
        self.mutate(|data| {
            let id = match data.nodes.iter().find(|n| n.last_ip == ip) {
                Some(node) => node.id,
                None => next_id(data.nodes.iter().map(|n| n.id)),
            };
            let node = Node {
                id,
                name: data
                    .nodes
                    .iter()
                    .find(|n| n.id == id)
                    .map(|n| n.name.clone())
                    .unwrap_or_default(),
                version: version.to_string(),
                last_ip: ip.to_string(),
                last_request_time: now,
            };
            Ok(upsert_by_id(&mut data.nodes, node, |n| n.id, |_, _| {}))
        })
    }

    fn insert_group_hit(&self, log: GroupHitLog) -> StoreResult<()> {
        self.logs.write().unwrap_or_else(|e| e.into_inner()).group_hits.push(log);
        Ok(())
    }

    fn insert_cc_log(&self, log: CcLog) -> StoreResult<()> {
        self.logs.write().unwrap_or_else(|e| e.into_inner()).cc_logs.push(log);
        Ok(())
    }

    fn purge_logs_before(&self, cutoff: i64) -> StoreResult<usize> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let before = logs.group_hits.len() + logs.cc_logs.len();
        logs.group_hits.retain(|l| l.request.request_time >= cutoff);
        logs.cc_logs.retain(|l| l.request.request_time >= cutoff);
        Ok(before - logs.group_hits.len() - logs.cc_logs.len())
    }

    fn refresh(&self) -> StoreResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mut fresh: StoreData = serde_json::from_str(&fs::read_to_string(path)?)?;
        fresh.seed();

        let mut data = self.write();
        if fresh == *data {
            return Ok(false);
        }
        *data = fresh;
        Ok(true)
    }
}
