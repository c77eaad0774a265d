//! Typed bodies of the management API.
//!
//! Every request is checked as a whole before anything is written; all
//! problems are reported together.

use serde::Deserialize;

use crate::admin::AdminError;
use crate::firewall::{
    CcPolicy, CheckItem, CheckPoint, CompiledCheckItem, GroupPolicy, Operation, PolicyAction,
};
use crate::routing::{ApplicationRecord, Destination, Domain, InternalScheme, IpMethod, RouteKind};
use crate::store::SyncSettings;

fn finish<T>(value: T, problems: Vec<String>) -> Result<T, AdminError> {
    if problems.is_empty() {
        Ok(value)
    } else {
        Err(AdminError::Invalid(problems.join("; ")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationUpdate {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub route_kind: RouteKind,
    pub request_route: String,
    pub backend_route: String,
    pub destination: String,
    #[serde(default)]
    pub node_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationUpdate {
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
    pub destinations: Vec<DestinationUpdate>,
}

impl ApplicationUpdate {
    pub fn into_record(self) -> Result<ApplicationRecord, AdminError> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.session_seconds < 0 {
            problems.push("session_seconds must not be negative".to_string());
        }
        for (i, dest) in self.destinations.iter().enumerate() {
            if !(dest.request_route.starts_with('/') || dest.request_route.starts_with('.')) {
                problems.push(format!(
                    "destinations[{i}].request_route must be a /prefix/, an .ext or /"
                ));
            }
            if dest.route_kind == RouteKind::ReverseProxy && dest.destination.trim().is_empty() {
                problems.push(format!("destinations[{i}].destination must not be empty"));
            }
        }

        let record = ApplicationRecord {
            id: self.id,
            name: self.name.trim().to_string(),
            internal_scheme: self.internal_scheme,
            redirect_https: self.redirect_https,
            hsts_enabled: self.hsts_enabled,
            waf_enabled: self.waf_enabled,
            ip_method: self.ip_method,
            description: self.description,
            oauth_required: self.oauth_required,
            session_seconds: self.session_seconds,
            owner: self.owner,
            destinations: self
                .destinations
                .into_iter()
                .map(|d| Destination {
                    id: d.id,
                    route_kind: d.route_kind,
                    request_route: d.request_route,
                    backend_route: d.backend_route,
                    destination: d.destination.trim().to_string(),
                    app_id: self.id,
                    node_id: d.node_id,
                })
                .collect(),
        };
        finish(record, problems)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainUpdate {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    #[serde(default)]
    pub cert_id: i64,
    #[serde(default)]
    pub redirect: bool,
    #[serde(default)]
    pub location: String,
}

impl DomainUpdate {
    pub fn into_record(self) -> Result<Domain, AdminError> {
        let mut problems = Vec::new();
        let name = self.name.trim().to_ascii_lowercase();
        if name.is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if name.contains(['/', ' ', ':']) {
            problems.push("name must be a bare host name".to_string());
        }
        if name.starts_with('*') && !name.starts_with("*.") {
            problems.push("wildcard names must start with '*.'".to_string());
        }
        if self.redirect && self.location.trim().is_empty() {
            problems.push("redirect domains need a location".to_string());
        }
        let record = Domain {
            id: self.id,
            name,
            app_id: self.app_id,
            cert_id: self.cert_id,
            redirect: self.redirect,
            location: self.location.trim().to_string(),
        };
        finish(record, problems)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CcPolicyUpdate {
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
    pub is_enabled: bool,
}

impl CcPolicyUpdate {
    pub fn into_policy(self) -> Result<CcPolicy, AdminError> {
        let mut problems = Vec::new();
        if self.app_id < 0 {
            problems.push("app_id must not be negative".to_string());
        }
        if self.interval_ms == 0 {
            problems.push("interval_ms must be positive".to_string());
        }
        if self.max_count == 0 {
            problems.push("max_count must be positive".to_string());
        }
        if self.action == PolicyAction::Block && self.block_seconds == 0 {
            problems.push("block_seconds must be positive for block".to_string());
        }
        let policy = CcPolicy {
            app_id: self.app_id,
            interval_ms: self.interval_ms,
            max_count: self.max_count,
            block_seconds: self.block_seconds,
            action: self.action,
            stat_by_url: self.stat_by_url,
            stat_by_user_agent: self.stat_by_user_agent,
            stat_by_cookie: self.stat_by_cookie,
            is_enabled: self.is_enabled,
        };
        finish(policy, problems)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckItemUpdate {
    #[serde(default)]
    pub id: i64,
    pub check_point: CheckPoint,
    pub operation: Operation,
    #[serde(default)]
    pub key_name: String,
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupPolicyUpdate {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub app_id: i64,
    pub vuln_id: i64,
    pub action: PolicyAction,
    pub is_enabled: bool,
    #[serde(default)]
    pub check_items: Vec<CheckItemUpdate>,
}

impl GroupPolicyUpdate {
    /// Check items are compiled here so a bad pattern is rejected before
    /// anything is stored.
    pub fn into_policy(self) -> Result<GroupPolicy, AdminError> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.check_items.is_empty() {
            problems.push("at least one check item is required".to_string());
        }

        let check_items: Vec<CheckItem> = self
            .check_items
            .into_iter()
            .map(|item| CheckItem {
                id: item.id,
                check_point: item.check_point,
                operation: item.operation,
                key_name: item.key_name,
                pattern: item.pattern,
                group_policy_id: self.id,
            })
            .collect();
        for (i, item) in check_items.iter().enumerate() {
            if let Err(e) = CompiledCheckItem::compile(item.clone()) {
                problems.push(format!("check_items[{i}]: {e}"));
            }
        }

        let group = GroupPolicy {
            id: self.id,
            name: self.name.trim().to_string(),
            description: self.description,
            app_id: self.app_id,
            vuln_id: self.vuln_id,
            action: self.action,
            is_enabled: self.is_enabled,
            check_items,
            updated_time: 0,
        };
        finish(group, problems)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    #[serde(rename = "Sync_Seconds", default)]
    pub sync_seconds: Option<u64>,
    #[serde(rename = "Log_Expire_Seconds", default)]
    pub log_expire_seconds: Option<i64>,
}

impl SettingsUpdate {
    pub fn apply(self, mut settings: SyncSettings) -> Result<SyncSettings, AdminError> {
        let mut problems = Vec::new();
        if let Some(seconds) = self.sync_seconds {
            if seconds == 0 {
                problems.push("Sync_Seconds must be positive".to_string());
            }
            settings.sync_seconds = seconds;
        }
        if let Some(seconds) = self.log_expire_seconds {
            if seconds <= 0 {
                problems.push("Log_Expire_Seconds must be positive".to_string());
            }
            settings.log_expire_seconds = seconds;
        }
        finish(settings, problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_problems_reported_together() {
        let update: ApplicationUpdate = serde_json::from_value(serde_json::json!({
            "name": " ",
            "destinations": [
                { "request_route": "abc", "backend_route": "/", "destination": "" }
            ]
        }))
        .unwrap();
        let AdminError::Invalid(message) = update.into_record().unwrap_err() else {
            panic!("expected validation error");
        };
        assert!(message.contains("name"));
        assert!(message.contains("request_route"));
        assert!(message.contains("destination must not be empty"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = serde_json::from_value::<DomainUpdate>(serde_json::json!({
            "name": "a.example.com", "app_id": 1, "redirect_to": "x"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_domain_normalized() {
        let update: DomainUpdate =
            serde_json::from_value(serde_json::json!({ "name": " WWW.Example.com ", "app_id": 1 })).unwrap();
        assert_eq!(update.into_record().unwrap().name, "www.example.com");
    }

    #[test]
    fn test_group_policy_bad_regex_rejected() {
        let update: GroupPolicyUpdate = serde_json::from_value(serde_json::json!({
            "name": "sqli",
            "vuln_id": 1,
            "action": "block",
            "is_enabled": true,
            "check_items": [
                { "check_point": "url_query", "operation": "regex", "pattern": "(select" }
            ]
        }))
        .unwrap();
        assert!(matches!(update.into_policy(), Err(AdminError::Invalid(_))));
    }

    #[test]
    fn test_settings_partial_update() {
        let update: SettingsUpdate = serde_json::from_value(serde_json::json!({ "Sync_Seconds": 30 })).unwrap();
        let settings = update.apply(SyncSettings::default()).unwrap();
        assert_eq!(settings.sync_seconds, 30);
        assert_eq!(settings.log_expire_seconds, 7 * 86_400);

        let zero: SettingsUpdate = serde_json::from_value(serde_json::json!({ "Sync_Seconds": 0 })).unwrap();
        assert!(zero.apply(SyncSettings::default()).is_err());
    }
}
