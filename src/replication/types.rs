//! Wire types of the replication RPC.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation requested by a replica.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum RpcAction {
    #[serde(rename = "getapps")]
    GetApps,
    #[serde(rename = "getdomains")]
    GetDomains,
    #[serde(rename = "getcerts")]
    GetCerts,
    #[serde(rename = "getccpolicies")]
    GetCcPolicies,
    #[serde(rename = "getgrouppolicies")]
    GetGroupPolicies,
    #[serde(rename = "getvulntypes")]
    GetVulnTypes,
    #[serde(rename = "getsettings")]
    GetSettings,
    #[serde(rename = "getoauthconf")]
    GetOAuthConf,
    #[serde(rename = "log_group_hit")]
    LogGroupHit,
    #[serde(rename = "log_cc")]
    LogCc,
}

impl RpcAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcAction::GetApps => "getapps",
            RpcAction::GetDomains => "getdomains",
            RpcAction::GetCerts => "getcerts",
            RpcAction::GetCcPolicies => "getccpolicies",
            RpcAction::GetGroupPolicies => "getgrouppolicies",
            RpcAction::GetVulnTypes => "getvulntypes",
            RpcAction::GetSettings => "getsettings",
            RpcAction::GetOAuthConf => "getoauthconf",
            RpcAction::LogGroupHit => "log_group_hit",
            RpcAction::LogCc => "log_cc",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcRequest {
    pub action: RpcAction,
    pub node_version: String,
    pub auth_key: String,
    /// Payload of log submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
}

/// Envelope of every RPC answer. `status` is 0 on success.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcResponse<T> {
    pub status: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    pub object: Option<T>,
}

impl<T> RpcResponse<T> {
    pub fn ok(object: T) -> Self {
        Self { status: 0, err: None, object: Some(object) }
    }

    pub fn error(status: i64, err: impl Into<String>) -> Self {
        Self { status, err: Some(err.into()), object: None }
    }
}

/// Plaintext of the node authentication token.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeAuth {
    pub cur_time: i64,
}

/// A replica as seen by the primary.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Node {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub version: String,
    pub last_ip: String,
    pub last_request_time: i64,
}
