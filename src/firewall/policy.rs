//! Group policy evaluation.
//!
//! # Responsibilities
//! - Hold group policies, vulnerability names and the check item index
//! - Evaluate a request against the index, first match wins
//!
//! # Design Decisions
//! - Buckets are visited in the configured checkpoint order, URL-category
//!   first by default; items inside a bucket in insertion order
//! - Checkpoints missing from the configured order are appended in the
//!   default order so no bucket is silently skipped
//! - Full loads build a fresh index and swap it; single group updates edit
//!   the live index in place

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::firewall::check_item::{CheckItemIndex, CompiledCheckItem};
use crate::firewall::types::{CheckPoint, GroupPolicy, RequestView, VulnType};
use crate::firewall::FirewallError;
use crate::routing::matcher::file_extension;

/// A request matched a check item of an enabled group policy.
#[derive(Debug, Clone)]
pub struct PolicyHit {
    pub group: Arc<GroupPolicy>,
    pub vuln_name: String,
    pub check_item_id: i64,
}

pub struct PolicyEngine {
    groups: ArcSwap<HashMap<i64, Arc<GroupPolicy>>>,
    index: ArcSwap<CheckItemIndex>,
    vuln_types: ArcSwap<HashMap<i64, String>>,
    order: Vec<CheckPoint>,
}

impl PolicyEngine {
    pub fn new(order: &[CheckPoint]) -> Self {
        let mut full: Vec<CheckPoint> = Vec::with_capacity(CheckPoint::default_order().len());
        for cp in order.iter().chain(CheckPoint::default_order()) {
            if !full.contains(cp) {
                full.push(*cp);
            }
        }

        Self {
            groups: ArcSwap::from_pointee(HashMap::new()),
            index: ArcSwap::from_pointee(CheckItemIndex::new()),
            vuln_types: ArcSwap::from_pointee(
                VulnType::defaults().into_iter().map(|v| (v.id, v.name)).collect(),
            ),
            order: full,
        }
    }

    pub fn order(&self) -> &[CheckPoint] {
        &self.order
    }

    /// Replace every group policy and vulnerability name. Nothing is applied
    /// if any check item fails to compile.
    pub fn load(&self, groups: Vec<GroupPolicy>, vuln_types: Vec<VulnType>) -> Result<(), FirewallError> {
        let index = CheckItemIndex::new();
        let mut by_id = HashMap::with_capacity(groups.len());
        for group in groups {
            for item in compile_items(&group)? {
                index.insert(item);
            }
            by_id.insert(group.id, Arc::new(group));
        }

        self.groups.store(Arc::new(by_id));
        self.index.store(Arc::new(index));
        if !vuln_types.is_empty() {
            self.vuln_types
                .store(Arc::new(vuln_types.into_iter().map(|v| (v.id, v.name)).collect()));
        }
        Ok(())
    }

    /// Add or replace one group policy, syncing its check items: items absent
    /// from `group` are deleted, others inserted or updated.
    pub fn upsert_group(&self, group: GroupPolicy) -> Result<(), FirewallError> {
        let compiled = compile_items(&group)?;
        let keep: HashSet<i64> = compiled.iter().map(|c| c.id()).collect();

        let previous = self.groups.load().get(&group.id).cloned();
        let group_id = group.id;
        let group = Arc::new(group);
        self.groups.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(group_id, group.clone());
            next
        });

        let index = self.index.load();
        if let Some(previous) = previous {
            for item in previous.check_items.iter().filter(|i| !keep.contains(&i.id)) {
                index.delete(item.id);
            }
        }
        for item in compiled {
            index.update(item);
        }
        Ok(())
    }

    pub fn delete_group(&self, id: i64) -> Option<Arc<GroupPolicy>> {
        let removed = self.groups.load().get(&id).cloned()?;
        self.groups.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&id);
            next
        });
        let index = self.index.load();
        for item in &removed.check_items {
            index.delete(item.id);
        }
        Some(removed)
    }

    pub fn group(&self, id: i64) -> Option<Arc<GroupPolicy>> {
        self.groups.load().get(&id).cloned()
    }

    pub fn groups(&self) -> Vec<GroupPolicy> {
        let mut groups: Vec<GroupPolicy> = self.groups.load().values().map(|g| g.as_ref().clone()).collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    pub fn vuln_name(&self, vuln_id: i64) -> String {
        self.vuln_types
            .load()
            .get(&vuln_id)
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn indexed_items(&self) -> usize {
        self.index.load().len()
    }

    /// First check item that matches the request, within an enabled group
    /// policy that applies to `app_id`.
    pub fn evaluate(&self, view: &RequestView<'_>, app_id: i64, src_ip: &str) -> Option<PolicyHit> {
        let index = self.index.load();
        let groups = self.groups.load();

        for check_point in &self.order {
            let Some(bucket) = index.bucket(*check_point) else {
                continue;
            };
            for compiled in bucket.iter() {
                let Some(value) = checkpoint_value(view, src_ip, *check_point, &compiled.item.key_name) else {
                    continue;
                };
                if !compiled.matches(&value) {
                    continue;
                }
                let Some(group) = groups.get(&compiled.item.group_policy_id) else {
                    continue;
                };
                if !group.applies_to(app_id) {
                    continue;
                }
                return Some(PolicyHit {
                    group: group.clone(),
                    vuln_name: self.vuln_name(group.vuln_id),
                    check_item_id: compiled.id(),
                });
            }
        }
        None
    }
}

fn compile_items(group: &GroupPolicy) -> Result<Vec<Arc<CompiledCheckItem>>, FirewallError> {
    group
        .check_items
        .iter()
        .map(|item| {
            if item.id == 0 {
                return Err(FirewallError::InvalidPolicy(format!(
                    "group policy {}: check item without id",
                    group.id
                )));
            }
            let mut item = item.clone();
            item.group_policy_id = group.id;
            CompiledCheckItem::compile(item).map(Arc::new)
        })
        .collect()
}

/// Request attribute inspected by a checkpoint, `None` when the request
/// does not carry it.
fn checkpoint_value<'a>(
    view: &RequestView<'a>,
    src_ip: &'a str,
    check_point: CheckPoint,
    key_name: &str,
) -> Option<Cow<'a, str>> {
    let value: &'a str = match check_point {
        CheckPoint::UrlPath => return Some(percent_decode(view.path)),
        CheckPoint::UrlQuery => {
            return (!view.query.is_empty()).then(|| percent_decode(view.query));
        }
        CheckPoint::FileExt => match file_extension(view.path) {
            "" => return None,
            ext => ext,
        },
        CheckPoint::Host => view.host,
        CheckPoint::Method => view.method,
        CheckPoint::IpAddress => src_ip,
        CheckPoint::UserAgent => return view.header("user-agent"),
        CheckPoint::Referer => return view.header("referer"),
        CheckPoint::ContentType => return view.header("content-type"),
        CheckPoint::Header => return view.header(key_name),
        CheckPoint::Cookie if key_name.is_empty() => {
            return view.headers.contains_key("cookie").then(|| view.cookie_header());
        }
        CheckPoint::Cookie => return view.cookie(key_name).map(Cow::Owned),
    };
    Some(Cow::Borrowed(value))
}

/// Decode `%XX` escapes. Invalid escapes are kept verbatim.
fn percent_decode(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') {
        return Cow::Borrowed(raw);
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
