//! Management API of the primary.
//!
//! # Responsibilities
//! - Bearer protected CRUD over the store
//! - Apply each change to the running node and bump the matching watermark
//!   so replicas follow
//!
//! # Design Decisions
//! - Bodies are typed update requests (`requests.rs`) validated before any
//!   write
//! - Firewall edits are applied incrementally (one policy); backend edits
//!   rebuild the route table from the store and swap it in
//! - The replication RPC endpoint is merged onto the same listener

pub mod auth;
pub mod handlers;
pub mod requests;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{middleware, Json, Router};
use thiserror::Error;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::GatewayError;
use crate::firewall::FirewallError;
use crate::manager::ConfigManager;
use crate::replication::server::{rpc_router, RpcState};
use crate::store::{Store, StoreError};

use self::auth::admin_auth_middleware;
use self::handlers::*;

#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<ConfigManager>,
    pub store: Arc<dyn Store>,
    pub api_key: Arc<str>,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Firewall(#[from] FirewallError),

    #[error("{0}")]
    Gateway(#[from] GatewayError),
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::Invalid(_) => StatusCode::BAD_REQUEST,
            AdminError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            AdminError::Store(StoreError::Invalid { .. }) => StatusCode::BAD_REQUEST,
            AdminError::Store(StoreError::GlobalPolicyProtected)
            | AdminError::Firewall(FirewallError::GlobalPolicyProtected) => StatusCode::CONFLICT,
            AdminError::Firewall(FirewallError::InvalidPolicy(_) | FirewallError::InvalidPattern { .. }) => {
                StatusCode::BAD_REQUEST
            }
            AdminError::Store(_) | AdminError::Firewall(_) | AdminError::Gateway(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Admin operation failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Certificates are the largest bodies the management API sees.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Admin routes behind bearer auth, plus the RPC endpoint, which carries its
/// own node token instead.
pub fn setup_admin_router(state: AdminState, rpc: RpcState, rpc_path: &str) -> Router {
    let admin = Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/nodes", get(get_nodes))
        .route("/admin/applications", get(list_applications).put(put_application))
        .route("/admin/applications/{id}", delete(delete_application))
        .route("/admin/domains", get(list_domains).put(put_domain))
        .route("/admin/domains/{id}", delete(delete_domain))
        .route("/admin/cc-policies", get(list_cc_policies).put(put_cc_policy))
        .route("/admin/cc-policies/{app_id}", delete(delete_cc_policy))
        .route("/admin/group-policies", get(list_group_policies).put(put_group_policy))
        .route("/admin/group-policies/{id}", delete(delete_group_policy))
        .route("/admin/settings", get(get_settings).put(put_settings))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state);

    admin
        .merge(rpc_router(rpc, rpc_path))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}
