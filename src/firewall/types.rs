//! Firewall entities and the request view they inspect.

use std::borrow::Cow;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// What to do with a request that tripped a policy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Block,
    BypassAndLog,
    Challenge,
    Pass,
}

impl PolicyAction {
    /// Numeric code used in logs and block pages.
    pub fn code(self) -> u16 {
        match self {
            PolicyAction::Block => 100,
            PolicyAction::BypassAndLog => 200,
            PolicyAction::Challenge => 300,
            PolicyAction::Pass => 400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyAction::Block => "block",
            PolicyAction::BypassAndLog => "bypass_and_log",
            PolicyAction::Challenge => "challenge",
            PolicyAction::Pass => "pass",
        }
    }
}

/// Flood control rule of one application, or the global fallback (`app_id` 0).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CcPolicy {
    pub app_id: i64,
    pub interval_ms: u64,
    pub max_count: u64,
    pub block_seconds: u64,
    pub action: PolicyAction,
    #[serde(default)]
    pub stat_by_url: bool,
    #[serde(default)]
    pub stat_by_user_agent: bool,
    #[serde(default)]
    pub stat_by_cookie: bool,
    #[serde(default)]
    pub is_enabled: bool,
}

impl CcPolicy {
    pub const GLOBAL_ID: i64 = 0;

    /// The global policy seeded on first start.
    pub fn global() -> Self {
        Self {
            app_id: Self::GLOBAL_ID,
            interval_ms: 100,
            max_count: 5,
            block_seconds: 7200,
            action: PolicyAction::Block,
            stat_by_url: true,
            stat_by_user_agent: false,
            stat_by_cookie: false,
            is_enabled: true,
        }
    }

    pub fn is_global(&self) -> bool {
        self.app_id == Self::GLOBAL_ID
    }
}

/// Counter of one client fingerprint under one policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStat {
    pub count: u64,
    pub is_bad: bool,
    /// Remaining block time in milliseconds.
    pub remain_ms: i64,
}

/// Request attribute category inspected by a check item.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckPoint {
    UrlPath,
    UrlQuery,
    FileExt,
    Host,
    Method,
    IpAddress,
    UserAgent,
    Referer,
    ContentType,
    Header,
    Cookie,
}

impl CheckPoint {
    /// URL-category buckets first, then request line attributes, then headers
    /// and cookies.
    pub fn default_order() -> &'static [CheckPoint] {
        &[
            CheckPoint::UrlPath,
            CheckPoint::UrlQuery,
            CheckPoint::FileExt,
            CheckPoint::Host,
            CheckPoint::Method,
            CheckPoint::IpAddress,
            CheckPoint::UserAgent,
            CheckPoint::Referer,
            CheckPoint::ContentType,
            CheckPoint::Header,
            CheckPoint::Cookie,
        ]
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Equals,
    Contains,
    Prefix,
    Regex,
    NotRegex,
    LengthGreaterThan,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CheckItem {
    #[serde(default)]
    pub id: i64,
    pub check_point: CheckPoint,
    pub operation: Operation,
    /// Header or cookie name for keyed checkpoints.
    #[serde(default)]
    pub key_name: String,
    /// Literal, regex or decimal length depending on `operation`.
    pub pattern: String,
    #[serde(default)]
    pub group_policy_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GroupPolicy {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Application scope, 0 for every application.
    #[serde(default)]
    pub app_id: i64,
    pub vuln_id: i64,
    pub action: PolicyAction,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub check_items: Vec<CheckItem>,
    #[serde(default)]
    pub updated_time: i64,
}

impl GroupPolicy {
    pub fn applies_to(&self, app_id: i64) -> bool {
        self.is_enabled && (self.app_id == 0 || self.app_id == app_id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct VulnType {
    pub id: i64,
    pub name: String,
}

impl VulnType {
    pub fn defaults() -> Vec<VulnType> {
        [
            (1, "SQL Injection"),
            (2, "Cross-site Scripting"),
            (3, "Remote Code Execution"),
            (4, "Path Traversal"),
            (5, "Web Shell"),
            (6, "Sensitive Data Exposure"),
            (100, "Custom"),
        ]
        .into_iter()
        .map(|(id, name)| VulnType { id, name: name.to_string() })
        .collect()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HitKind {
    Flood,
    Group,
}

/// What the enforcer shows and remembers about a hit.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HitInfo {
    pub kind: HitKind,
    pub policy_id: i64,
    pub vuln_name: String,
    pub action: PolicyAction,
    pub client_id: String,
    /// Path plus `?query` of the request that tripped the policy.
    pub target_url: String,
    pub block_time: i64,
}

/// Request metadata stored with hit logs.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RequestSummary {
    pub request_time: i64,
    pub client_ip: String,
    pub host: String,
    pub method: String,
    pub url_path: String,
    #[serde(default)]
    pub url_query: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub referer: String,
}

impl RequestSummary {
    pub fn capture(view: &RequestView<'_>, src_ip: &str, now: i64) -> Self {
        Self {
            request_time: now,
            client_ip: src_ip.to_string(),
            host: view.host.to_string(),
            method: view.method.to_string(),
            url_path: view.path.to_string(),
            url_query: view.query.to_string(),
            user_agent: view.user_agent().to_string(),
            referer: view.header("referer").unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GroupHitLog {
    #[serde(flatten)]
    pub request: RequestSummary,
    pub app_id: i64,
    pub policy_id: i64,
    pub vuln_id: i64,
    pub action: PolicyAction,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CcLog {
    #[serde(flatten)]
    pub request: RequestSummary,
    pub app_id: i64,
    pub action: PolicyAction,
}

/// Borrowed view of the request attributes the firewall inspects.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub host: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
}

impl<'a> RequestView<'a> {
    /// Header value with invalid UTF-8 replaced, so opaque bytes never hide
    /// the rest of the value from inspection.
    pub fn header(&self, name: &str) -> Option<Cow<'a, str>> {
        self.headers.get(name).map(|v| String::from_utf8_lossy(v.as_bytes()))
    }

    pub fn user_agent(&self) -> Cow<'a, str> {
        self.header("user-agent").unwrap_or_default()
    }

    /// Every `Cookie` field joined with `"; "`. HTTP/2 clients send one
    /// field per cookie.
    pub fn cookie_header(&self) -> Cow<'a, str> {
        let mut fields = self.headers.get_all("cookie").iter();
        let Some(first) = fields.next() else {
            return Cow::Borrowed("");
        };
        let first = String::from_utf8_lossy(first.as_bytes());
        let mut rest = fields.peekable();
        if rest.peek().is_none() {
            return first;
        }
        let mut joined = first.into_owned();
        for field in rest {
            joined.push_str("; ");
            joined.push_str(&String::from_utf8_lossy(field.as_bytes()));
        }
        Cow::Owned(joined)
    }

    /// Value of one cookie across all `Cookie` fields.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookie_header().split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    /// Path plus `?query` when a query is present.
    pub fn target_url(&self) -> String {
        if self.query.is_empty() {
            self.path.to_string()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}
