//! Replica side of the replication RPC.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::clock::unix_now;
use crate::firewall::{CcLog, CcPolicy, GroupHitLog, GroupPolicy, VulnType};
use crate::observability::metrics;
use crate::replication::auth::{AuthError, NodeKey};
use crate::replication::types::{RpcAction, RpcRequest, RpcResponse};
use crate::routing::{ApplicationRecord, Certificate, Domain};
use crate::store::{OAuthConfig, SyncSettings};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token error: {0}")]
    Auth(#[from] AuthError),

    #[error("primary answered {status}: {message}")]
    Remote { status: i64, message: String },

    #[error("primary sent no object for {0}")]
    MissingObject(&'static str),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct ReplicationClient {
    http: reqwest::Client,
    sync_addr: String,
    node_version: String,
    key: Arc<NodeKey>,
}

impl ReplicationClient {
    pub fn new(
        sync_addr: impl Into<String>,
        node_version: impl Into<String>,
        key: Arc<NodeKey>,
        timeout: Duration,
    ) -> Result<Self, ReplicationError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            sync_addr: sync_addr.into(),
            node_version: node_version.into(),
            key,
        })
    }

    pub fn sync_addr(&self) -> &str {
        &self.sync_addr
    }

    /// One authenticated call. A fresh token is issued for every request.
    pub async fn call<T: DeserializeOwned>(
        &self,
        action: RpcAction,
        object: Option<serde_json::Value>,
    ) -> Result<Option<T>, ReplicationError> {
        let request = RpcRequest {
            action,
            node_version: self.node_version.clone(),
            auth_key: self.key.issue_token(unix_now())?,
            object,
        };

        let result = self.send::<T>(&request).await;
        metrics::record_replication_call(action.as_str(), if result.is_ok() { "ok" } else { "error" });
        result
    }

    async fn send<T: DeserializeOwned>(&self, request: &RpcRequest) -> Result<Option<T>, ReplicationError> {
        let response = self.http.post(&self.sync_addr).json(request).send().await?;
        let http_status = response.status();
        let body = response.bytes().await?;

        match serde_json::from_slice::<RpcResponse<T>>(&body) {
            Ok(envelope) if envelope.status == 0 => Ok(envelope.object),
            Ok(envelope) => Err(ReplicationError::Remote {
                status: envelope.status,
                message: envelope.err.unwrap_or_default(),
            }),
            Err(_) if !http_status.is_success() => Err(ReplicationError::Remote {
                status: i64::from(http_status.as_u16()),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, action: RpcAction) -> Result<T, ReplicationError> {
        self.call(action, None)
            .await?
            .ok_or(ReplicationError::MissingObject(action.as_str()))
    }

    async fn submit<T: Serialize>(&self, action: RpcAction, object: &T) -> Result<(), ReplicationError> {
        let object = serde_json::to_value(object)?;
        self.call::<serde_json::Value>(action, Some(object)).await?;
        Ok(())
    }

    pub async fn fetch_applications(&self) -> Result<Vec<ApplicationRecord>, ReplicationError> {
        self.fetch(RpcAction::GetApps).await
    }

    pub async fn fetch_domains(&self) -> Result<Vec<Domain>, ReplicationError> {
        self.fetch(RpcAction::GetDomains).await
    }

    pub async fn fetch_certificates(&self) -> Result<Vec<Certificate>, ReplicationError> {
        self.fetch(RpcAction::GetCerts).await
    }

    pub async fn fetch_cc_policies(&self) -> Result<Vec<CcPolicy>, ReplicationError> {
        self.fetch(RpcAction::GetCcPolicies).await
    }

    pub async fn fetch_group_policies(&self) -> Result<Vec<GroupPolicy>, ReplicationError> {
        self.fetch(RpcAction::GetGroupPolicies).await
    }

    pub async fn fetch_vuln_types(&self) -> Result<Vec<VulnType>, ReplicationError> {
        self.fetch(RpcAction::GetVulnTypes).await
    }

    pub async fn fetch_settings(&self) -> Result<SyncSettings, ReplicationError> {
        self.fetch(RpcAction::GetSettings).await
    }

    pub async fn fetch_oauth_config(&self) -> Result<OAuthConfig, ReplicationError> {
        self.fetch(RpcAction::GetOAuthConf).await
    }

    pub async fn submit_group_hit(&self, log: &GroupHitLog) -> Result<(), ReplicationError> {
        self.submit(RpcAction::LogGroupHit, log).await
    }

    pub async fn submit_cc_log(&self, log: &CcLog) -> Result<(), ReplicationError> {
        self.submit(RpcAction::LogCc, log).await
    }
}

impl std::fmt::Debug for ReplicationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationClient")
            .field("sync_addr", &self.sync_addr)
            .field("node_version", &self.node_version)
            .finish()
    }
}
