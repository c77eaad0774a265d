//! Check items indexed by checkpoint.
//!
//! Buckets are copy-on-write `Arc<Vec<_>>` values: readers clone the `Arc`
//! and iterate without locks, writers build a new vector and store it. Writers
//! are serialized by one mutex so read-modify-write of a bucket never loses an
//! update.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use regex::Regex;

use crate::firewall::types::{CheckItem, CheckPoint, Operation};
use crate::firewall::FirewallError;

/// A check item with its pattern compiled.
#[derive(Debug)]
pub struct CompiledCheckItem {
    pub item: CheckItem,
    matcher: Matcher,
}

#[derive(Debug)]
enum Matcher {
    Equals(String),
    Contains(String),
    Prefix(String),
    Regex(Regex),
    NotRegex(Regex),
    LengthGreaterThan(usize),
}

impl CompiledCheckItem {
    pub fn compile(item: CheckItem) -> Result<Self, FirewallError> {
        let invalid = |reason: String| FirewallError::InvalidPattern { id: item.id, reason };
        let matcher = match item.operation {
            Operation::Equals => Matcher::Equals(item.pattern.clone()),
            Operation::Contains => Matcher::Contains(item.pattern.clone()),
            Operation::Prefix => Matcher::Prefix(item.pattern.clone()),
            Operation::Regex => Matcher::Regex(Regex::new(&item.pattern).map_err(|e| invalid(e.to_string()))?),
            Operation::NotRegex => {
                Matcher::NotRegex(Regex::new(&item.pattern).map_err(|e| invalid(e.to_string()))?)
            }
            Operation::LengthGreaterThan => Matcher::LengthGreaterThan(
                item.pattern.trim().parse().map_err(|_| invalid(format!("'{}' is not a length", item.pattern)))?,
            ),
        };
        if item.check_point == CheckPoint::Header && item.key_name.is_empty() {
            return Err(invalid("header checks need a key_name".to_string()));
        }
        Ok(Self { item, matcher })
    }

    pub fn matches(&self, value: &str) -> bool {
        match &self.matcher {
            Matcher::Equals(p) => value == p,
            Matcher::Contains(p) => value.contains(p.as_str()),
            Matcher::Prefix(p) => value.starts_with(p.as_str()),
            Matcher::Regex(re) => re.is_match(value),
            Matcher::NotRegex(re) => !re.is_match(value),
            Matcher::LengthGreaterThan(n) => value.len() > *n,
        }
    }

    pub fn id(&self) -> i64 {
        self.item.id
    }
}

pub type Bucket = Arc<Vec<Arc<CompiledCheckItem>>>;

#[derive(Debug, Default)]
pub struct CheckItemIndex {
    buckets: DashMap<CheckPoint, Bucket>,
    write_lock: Mutex<()>,
}

impl CheckItemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items of one checkpoint, in insertion order.
    pub fn bucket(&self, check_point: CheckPoint) -> Option<Bucket> {
        self.buckets.get(&check_point).map(|b| b.value().clone())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append to the item's checkpoint bucket.
    pub fn insert(&self, item: Arc<CompiledCheckItem>) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.append(item);
    }

    /// Replace the item with the same id. It keeps its position when the
    /// checkpoint is unchanged and moves to the end of the new bucket when it
    /// changed. Unknown ids are inserted.
    pub fn update(&self, item: Arc<CompiledCheckItem>) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let id = item.id();

        if let Some(current) = self.locate(id) {
            if current == item.item.check_point {
                if let Some(bucket) = self.bucket(current) {
                    let replaced: Vec<_> = bucket
                        .iter()
                        .map(|existing| if existing.id() == id { item.clone() } else { existing.clone() })
                        .collect();
                    self.buckets.insert(current, Arc::new(replaced));
                }
                return;
            }
            self.remove_from(current, id);
        }
        self.append(item);
    }

    /// Remove by id. Returns whether the item was present.
    pub fn delete(&self, id: i64) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.locate(id) {
            Some(check_point) => {
                self.remove_from(check_point, id);
                true
            }
            None => false,
        }
    }

    fn append(&self, item: Arc<CompiledCheckItem>) {
        let check_point = item.item.check_point;
        let mut items = self.bucket(check_point).map(|b| b.as_ref().clone()).unwrap_or_default();
        items.push(item);
        self.buckets.insert(check_point, Arc::new(items));
    }

    fn remove_from(&self, check_point: CheckPoint, id: i64) {
        if let Some(bucket) = self.bucket(check_point) {
            let remaining: Vec<_> = bucket.iter().filter(|i| i.id() != id).cloned().collect();
            self.buckets.insert(check_point, Arc::new(remaining));
        }
    }

    fn locate(&self, id: i64) -> Option<CheckPoint> {
        self.buckets
            .iter()
            .find(|bucket| bucket.iter().any(|i| i.id() == id))
            .map(|bucket| *bucket.key())
    }
}
