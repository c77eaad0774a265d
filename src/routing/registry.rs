//! Domain → application registry.
//!
//! A `RouteTable` is built in full from records and never mutated afterwards,
//! except for its wildcard memo. `RouteRegistry` swaps whole tables, so a
//! reader holding a table sees one generation of every route map.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::routing::matcher::{normalize_host, wildcard_name};
use crate::routing::types::{Application, ApplicationRecord, Domain};

/// A resolved domain.
#[derive(Debug, Clone)]
pub struct DomainRoute {
    pub name: String,
    pub app: Arc<Application>,
    pub cert_id: i64,
    pub redirect: bool,
    pub location: String,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    applications: HashMap<i64, Arc<Application>>,
    domains: HashMap<String, Arc<DomainRoute>>,
    // Wildcard hits keyed by the original hostname. Lives and dies with the table.
    wildcard_hits: DashMap<String, Arc<DomainRoute>>,
}

impl RouteTable {
    pub fn build(applications: &[ApplicationRecord], domains: &[Domain]) -> Self {
        let applications: HashMap<i64, Arc<Application>> = applications
            .iter()
            .map(|record| (record.id, Arc::new(Application::from_record(record))))
            .collect();

        let mut domain_routes = HashMap::with_capacity(domains.len());
        for domain in domains {
            let Some(app) = applications.get(&domain.app_id) else {
                tracing::warn!(
                    domain = %domain.name,
                    app_id = domain.app_id,
                    "Domain references unknown application, skipping"
                );
                continue;
            };
            let name = domain.name.to_ascii_lowercase();
            domain_routes.insert(
                name.clone(),
                Arc::new(DomainRoute {
                    name,
                    app: app.clone(),
                    cert_id: domain.cert_id,
                    redirect: domain.redirect,
                    location: domain.location.clone(),
                }),
            );
        }

        Self {
            applications,
            domains: domain_routes,
            wildcard_hits: DashMap::new(),
        }
    }

    pub fn application(&self, id: i64) -> Option<Arc<Application>> {
        self.applications.get(&id).cloned()
    }

    pub fn applications(&self) -> impl Iterator<Item = &Arc<Application>> {
        self.applications.values()
    }

    /// Exact match, then the memo, then the wildcard form. A wildcard hit is
    /// memoized under `host` without its redirect.
    pub fn resolve_domain(&self, host: &str) -> Option<Arc<DomainRoute>> {
        let host = normalize_host(host);
        if let Some(route) = self.domains.get(&host) {
            return Some(route.clone());
        }
        if let Some(route) = self.wildcard_hits.get(&host) {
            return Some(route.clone());
        }

        let wildcard = self.domains.get(&wildcard_name(&host)?)?;
        let route = Arc::new(DomainRoute {
            name: host.clone(),
            app: wildcard.app.clone(),
            cert_id: wildcard.cert_id,
            redirect: false,
            location: String::new(),
        });
        self.wildcard_hits.insert(host, route.clone());
        Some(route)
    }

    pub fn resolve_application(&self, host: &str) -> Option<Arc<Application>> {
        self.resolve_domain(host).map(|route| route.app.clone())
    }

    /// Memoized wildcard entry for `host`, if an earlier lookup created one.
    pub fn memoized(&self, host: &str) -> Option<Arc<DomainRoute>> {
        self.wildcard_hits.get(&normalize_host(host)).map(|r| r.clone())
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }
}

/// Process-wide holder of the current `RouteTable`.
#[derive(Debug)]
pub struct RouteRegistry {
    table: ArcSwap<RouteTable>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
        }
    }

    /// Snapshot of the current table. Keep it for the whole request.
    pub fn load(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn replace(&self, table: RouteTable) {
        self.table.store(Arc::new(table));
    }

    pub fn resolve_application(&self, host: &str) -> Option<Arc<Application>> {
        self.table.load().resolve_application(host)
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::types::{Destination, RouteKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn record(id: i64, destinations: &[(&str, &str)]) -> ApplicationRecord {
        ApplicationRecord {
            id,
            name: format!("app-{id}"),
            internal_scheme: Default::default(),
            redirect_https: false,
            hsts_enabled: false,
            waf_enabled: false,
            ip_method: Default::default(),
            description: String::new(),
            oauth_required: false,
            session_seconds: 0,
            owner: String::new(),
            destinations: destinations
                .iter()
                .enumerate()
                .map(|(i, (route, addr))| Destination {
                    id: i as i64 + 1,
                    route_kind: RouteKind::ReverseProxy,
                    request_route: route.to_string(),
                    backend_route: route.to_string(),
                    destination: addr.to_string(),
                    app_id: id,
                    node_id: 0,
                })
                .collect(),
        }
    }

    fn domain(name: &str, app_id: i64, redirect: bool) -> Domain {
        Domain {
            id: 0,
            name: name.into(),
            app_id,
            cert_id: 0,
            redirect,
            location: if redirect { "https://elsewhere.example".into() } else { String::new() },
        }
    }

    #[test]
    fn test_exact_domain_match() {
        let table = RouteTable::build(&[record(1, &[("/", "10.0.0.1:80")])], &[domain("shop.example.com", 1, false)]);

        let app = table.resolve_application("Shop.Example.com:443").unwrap();
        assert_eq!(app.id, 1);
        assert!(table.resolve_application("other.example.com").is_none());
    }

    #[test]
    fn test_wildcard_hit_is_memoized() {
        let table = RouteTable::build(&[record(7, &[("/", "10.0.0.7:80")])], &[domain("*.example.com", 7, true)]);

        assert!(table.memoized("www.example.com").is_none());
        let first = table.resolve_domain("www.example.com").unwrap();
        assert_eq!(first.app.id, 7);
        assert!(!first.redirect, "memo entries never redirect");

        let memo = table.memoized("www.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &memo));
        let second = table.resolve_domain("www.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_domain_with_unknown_app_is_skipped() {
        let table = RouteTable::build(&[], &[domain("ghost.example.com", 3, false)]);
        assert_eq!(table.domain_count(), 0);
    }

    #[test]
    fn test_swap_never_mixes_generations() {
        let registry = Arc::new(RouteRegistry::new());
        let gen_a = record(1, &[("/", "10.0.0.1:80"), ("/", "10.0.0.2:80"), ("/", "10.0.0.3:80")]);
        let gen_b = record(1, &[("/", "10.0.1.1:80"), ("/", "10.0.1.2:80")]);
        let domains = vec![domain("a.example.com", 1, false)];
        registry.replace(RouteTable::build(&[gen_a.clone()], &domains));

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let app = registry.resolve_application("a.example.com").unwrap();
                        let dests = app.select_route("/").unwrap();
                        let old = dests.iter().filter(|d| d.destination.starts_with("10.0.0.")).count();
                        assert!(old == 0 || old == dests.len(), "observed a mixed destination list");
                        assert!(dests.len() == 3 || dests.len() == 2);
                    }
                })
            })
            .collect();

        for i in 0..500 {
            let next = if i % 2 == 0 { &gen_b } else { &gen_a };
            registry.replace(RouteTable::build(std::slice::from_ref(next), &domains));
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
