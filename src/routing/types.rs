//! Backend entities: applications, destinations, domains and certificates.
//!
//! Records are the wire and storage form. `Application` is the routing form
//! built from a record, with its route map precomputed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::routing::matcher::{file_extension, route_prefix};

/// How a destination is served.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    #[default]
    ReverseProxy,
    StaticFiles,
    FastCgi,
}

/// Scheme used towards the backend.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InternalScheme {
    #[default]
    Http,
    Https,
}

impl InternalScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            InternalScheme::Http => "http",
            InternalScheme::Https => "https",
        }
    }
}

/// Where the client address is read from.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IpMethod {
    /// Socket peer address.
    #[default]
    RemoteAddr,
    /// Last element of `X-Forwarded-For`.
    XForwardedFor,
    /// `X-Real-IP` header.
    XRealIp,
    /// `Real-IP` header.
    RealIp,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Destination {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub route_kind: RouteKind,
    /// Request prefix (`/abc/`), extension (`.php`) or `/`.
    pub request_route: String,
    /// Prefix substituted for `request_route` before forwarding.
    pub backend_route: String,
    /// `host:port` of the backend.
    pub destination: String,
    #[serde(default)]
    pub app_id: i64,
    /// Node the destination is pinned to, 0 for any.
    #[serde(default)]
    pub node_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApplicationRecord {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub internal_scheme: InternalScheme,
    #[serde(default)]
    pub redirect_https: bool,
    #[serde(default)]
    pub hsts_enabled: bool,
    #[serde(default)]
    pub waf_enabled: bool,
    #[serde(default)]
    pub ip_method: IpMethod,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub oauth_required: bool,
    #[serde(default)]
    pub session_seconds: i64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Domain {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    /// Certificate id, 0 when the domain is plaintext only.
    #[serde(default)]
    pub cert_id: i64,
    #[serde(default)]
    pub redirect: bool,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Certificate {
    #[serde(default)]
    pub id: i64,
    pub common_name: String,
    pub cert_pem: String,
    pub key_pem: String,
    #[serde(default)]
    pub expire_time: i64,
}

/// Routing view of an application.
#[derive(Debug)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub internal_scheme: InternalScheme,
    pub redirect_https: bool,
    pub hsts_enabled: bool,
    pub waf_enabled: bool,
    pub ip_method: IpMethod,
    pub oauth_required: bool,
    pub session_seconds: i64,
    routes: HashMap<String, Vec<Arc<Destination>>>,
}

impl Application {
    /// Build the runtime form. Destinations owned by another application are
    /// ignored so a destination always belongs to exactly one route map.
    pub fn from_record(record: &ApplicationRecord) -> Self {
        let mut routes: HashMap<String, Vec<Arc<Destination>>> = HashMap::new();
        for dest in &record.destinations {
            if dest.app_id != record.id {
                tracing::warn!(
                    app_id = record.id,
                    destination_id = dest.id,
                    owner = dest.app_id,
                    "Skipping destination owned by another application"
                );
                continue;
            }
            routes
                .entry(dest.request_route.clone())
                .or_default()
                .push(Arc::new(dest.clone()));
        }

        Self {
            id: record.id,
            name: record.name.clone(),
            internal_scheme: record.internal_scheme,
            redirect_https: record.redirect_https,
            hsts_enabled: record.hsts_enabled,
            waf_enabled: record.waf_enabled,
            ip_method: record.ip_method,
            oauth_required: record.oauth_required,
            session_seconds: record.session_seconds,
            routes,
        }
    }

    /// Candidate destinations for a request path.
    ///
    /// Precedence: first path segment (`/abc/`), then file extension (`.php`),
    /// then the catch-all `/`. `None` when nothing matches.
    pub fn select_route(&self, path: &str) -> Option<&[Arc<Destination>]> {
        let prefix = route_prefix(path);
        if prefix != "/" {
            if let Some(dests) = self.routes.get(prefix) {
                return Some(dests);
            }
        }

        let ext = file_extension(path);
        if !ext.is_empty() {
            if let Some(dests) = self.routes.get(ext) {
                return Some(dests);
            }
        }

        self.routes.get("/").map(Vec::as_slice)
    }

    pub fn route_keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}
