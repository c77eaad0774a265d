//! Primary side of the replication RPC.
//!
//! Every call is authenticated by its node token before the action runs, and
//! an accepted call refreshes the caller's node record.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::unix_now;
use crate::firewall::{CcLog, GroupHitLog};
use crate::observability::metrics;
use crate::replication::auth::{AuthError, NodeKey};
use crate::replication::types::{RpcAction, RpcRequest, RpcResponse};
use crate::store::{Store, StoreResult};

#[derive(Clone)]
pub struct RpcState {
    pub store: Arc<dyn Store>,
    pub key: Arc<NodeKey>,
}

pub fn rpc_router(state: RpcState, path: &str) -> Router {
    Router::new().route(path, post(handle_rpc)).with_state(state)
}

async fn handle_rpc(
    State(state): State<RpcState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<RpcRequest>,
) -> Response {
    let action = request.action.as_str();
    if let Err(e) = state.key.verify_token(&request.auth_key, unix_now()) {
        let reason = match e {
            AuthError::Expired { .. } => "expired",
            AuthError::Decrypt => "decrypt",
            _ => "malformed",
        };
        metrics::record_auth_rejected(reason);
        tracing::warn!(peer = %peer, action, error = %e, "Replication call rejected");
        return (StatusCode::UNAUTHORIZED, Json(RpcResponse::<()>::error(401, "unauthorized"))).into_response();
    }

    // Recording the node rewrites the data file.
    let store = state.store.clone();
    let version = request.node_version.clone();
    let ip = peer.ip().to_string();
    match tokio::task::spawn_blocking(move || store.touch_node(&version, &ip, unix_now())).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(peer = %peer, error = %e, "Failed to record node"),
        Err(e) => tracing::warn!(peer = %peer, error = %e, "Node recording task failed"),
    }
    tracing::debug!(peer = %peer, action, node_version = %request.node_version, "Replication call");

    let store = state.store.as_ref();
    let response = match request.action {
        RpcAction::GetApps => reply(store.applications()),
        RpcAction::GetDomains => reply(store.domains()),
        RpcAction::GetCerts => reply(store.certificates()),
        RpcAction::GetCcPolicies => reply(store.cc_policies()),
        RpcAction::GetGroupPolicies => reply(store.group_policies()),
        RpcAction::GetVulnTypes => reply(store.vuln_types()),
        RpcAction::GetSettings => reply(store.settings()),
        RpcAction::GetOAuthConf => reply(store.oauth_config()),
        RpcAction::LogGroupHit => match payload::<GroupHitLog>(request.object) {
            Ok(log) => reply(store.insert_group_hit(log)),
            Err(response) => response,
        },
        RpcAction::LogCc => match payload::<CcLog>(request.object) {
            Ok(log) => reply(store.insert_cc_log(log)),
            Err(response) => response,
        },
    };
    let result = if response.status().is_success() { "ok" } else { "error" };
    metrics::record_replication_call(action, result);
    response
}

fn reply<T: Serialize>(result: StoreResult<T>) -> Response {
    match result {
        Ok(object) => Json(RpcResponse::ok(object)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Replication action failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(RpcResponse::<()>::error(500, e.to_string()))).into_response()
        }
    }
}

fn payload<T: DeserializeOwned>(object: Option<serde_json::Value>) -> Result<T, Response> {
    let bad_request = |msg: String| {
        (StatusCode::BAD_REQUEST, Json(RpcResponse::<()>::error(400, msg))).into_response()
    };
    let object = object.ok_or_else(|| bad_request("missing object".to_string()))?;
    serde_json::from_value(object).map_err(|e| bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::store::JsonStore;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn router(store: Arc<JsonStore>) -> Router {
        let state = RpcState { store, key: Arc::new(NodeKey::from_hex(KEY).unwrap()) };
        rpc_router(state, "/gateway/api").layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 7], 40000))))
    }

    fn call(body: serde_json::Value) -> Request<Body> {
        Request::post("/gateway/api")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_authenticated_call_records_node() {
        let store = Arc::new(JsonStore::in_memory());
        let key = NodeKey::from_hex(KEY).unwrap();
        let token = key.issue_token(unix_now()).unwrap();

        let response = router(store.clone())
            .oneshot(call(serde_json::json!({
                "action": "getccpolicies", "node_version": "2.0.1", "auth_key": token
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], 0);
        assert_eq!(json["object"][0]["app_id"], 0);

        let nodes = store.nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].last_ip, "10.0.0.7");
        assert_eq!(nodes[0].version, "2.0.1");
    }

    #[tokio::test]
    async fn test_stale_token_rejected() {
        let store = Arc::new(JsonStore::in_memory());
        let key = NodeKey::from_hex(KEY).unwrap();
        let token = key.issue_token(unix_now() - 181).unwrap();

        let response = router(store.clone())
            .oneshot(call(serde_json::json!({
                "action": "getapps", "node_version": "2.0.1", "auth_key": token
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.nodes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_submission_stored() {
        let store = Arc::new(JsonStore::in_memory());
        let key = NodeKey::from_hex(KEY).unwrap();
        let token = key.issue_token(unix_now()).unwrap();

        let response = router(store.clone())
            .oneshot(call(serde_json::json!({
                "action": "log_cc",
                "node_version": "2.0.1",
                "auth_key": token,
                "object": {
                    "request_time": 100, "client_ip": "1.2.3.4", "host": "h", "method": "GET",
                    "url_path": "/", "app_id": 3, "action": "block"
                }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.cc_logs()[0].app_id, 3);
    }

    #[tokio::test]
    async fn test_log_submission_without_object_is_bad_request() {
        let store = Arc::new(JsonStore::in_memory());
        let token = NodeKey::from_hex(KEY).unwrap().issue_token(unix_now()).unwrap();

        let response = router(store)
            .oneshot(call(serde_json::json!({
                "action": "log_group_hit", "node_version": "1", "auth_key": token
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
