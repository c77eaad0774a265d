use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::admin::requests::{
    ApplicationUpdate, CcPolicyUpdate, DomainUpdate, GroupPolicyUpdate, SettingsUpdate,
};
use crate::admin::{AdminError, AdminState};
use crate::firewall::{CcPolicy, GroupPolicy};
use crate::manager::Subsystem;
use crate::replication::types::Node;
use crate::routing::{ApplicationRecord, Domain};
use crate::store::SyncSettings;

type AdminResult<T> = Result<Json<T>, AdminError>;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub applied: SyncSettings,
    pub applications: usize,
    pub domains: usize,
    pub cc_policies: usize,
    pub group_policies: usize,
    pub check_items: usize,
    pub nodes: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> AdminResult<SystemStatus> {
    let table = state.manager.routes().load();
    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        applied: state.manager.applied(),
        applications: table.applications().count(),
        domains: table.domain_count(),
        cc_policies: state.manager.flood().policies().len(),
        group_policies: state.manager.policies().groups().len(),
        check_items: state.manager.policies().indexed_items(),
        nodes: state.store.nodes()?.len(),
    }))
}

pub async fn get_nodes(State(state): State<AdminState>) -> AdminResult<Vec<Node>> {
    Ok(Json(state.store.nodes()?))
}

/// Rebuild routing from the store and tell replicas.
async fn backend_changed(state: &AdminState) -> Result<(), AdminError> {
    state.manager.reload_backend().await?;
    state.manager.bump_watermark(Subsystem::Backend)?;
    Ok(())
}

pub async fn list_applications(State(state): State<AdminState>) -> AdminResult<Vec<ApplicationRecord>> {
    Ok(Json(state.store.applications()?))
}

pub async fn put_application(
    State(state): State<AdminState>,
    Json(update): Json<ApplicationUpdate>,
) -> AdminResult<ApplicationRecord> {
    let saved = state.store.upsert_application(update.into_record()?)?;
    backend_changed(&state).await?;
    tracing::info!(app_id = saved.id, name = %saved.name, "Application saved");
    Ok(Json(saved))
}

pub async fn delete_application(State(state): State<AdminState>, Path(id): Path<i64>) -> Result<StatusCode, AdminError> {
    state.store.delete_application(id)?;
    backend_changed(&state).await?;
    tracing::info!(app_id = id, "Application deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_domains(State(state): State<AdminState>) -> AdminResult<Vec<Domain>> {
    Ok(Json(state.store.domains()?))
}

pub async fn put_domain(State(state): State<AdminState>, Json(update): Json<DomainUpdate>) -> AdminResult<Domain> {
    let saved = state.store.upsert_domain(update.into_record()?)?;
    backend_changed(&state).await?;
    tracing::info!(domain_id = saved.id, name = %saved.name, app_id = saved.app_id, "Domain saved");
    Ok(Json(saved))
}

pub async fn delete_domain(State(state): State<AdminState>, Path(id): Path<i64>) -> Result<StatusCode, AdminError> {
    state.store.delete_domain(id)?;
    backend_changed(&state).await?;
    tracing::info!(domain_id = id, "Domain deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_cc_policies(State(state): State<AdminState>) -> AdminResult<Vec<CcPolicy>> {
    Ok(Json(state.store.cc_policies()?))
}

pub async fn put_cc_policy(
    State(state): State<AdminState>,
    Json(update): Json<CcPolicyUpdate>,
) -> AdminResult<CcPolicy> {
    let saved = state.store.upsert_cc_policy(update.into_policy()?)?;
    state.manager.flood().upsert_policy(saved.clone())?;
    state.manager.bump_watermark(Subsystem::Firewall)?;
    tracing::info!(app_id = saved.app_id, enabled = saved.is_enabled, "CC policy saved");
    Ok(Json(saved))
}

pub async fn delete_cc_policy(
    State(state): State<AdminState>,
    Path(app_id): Path<i64>,
) -> Result<StatusCode, AdminError> {
    state.store.delete_cc_policy(app_id)?;
    state.manager.flood().delete_policy(app_id)?;
    state.manager.bump_watermark(Subsystem::Firewall)?;
    tracing::info!(app_id, "CC policy deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_group_policies(State(state): State<AdminState>) -> AdminResult<Vec<GroupPolicy>> {
    Ok(Json(state.store.group_policies()?))
}

pub async fn put_group_policy(
    State(state): State<AdminState>,
    Json(update): Json<GroupPolicyUpdate>,
) -> AdminResult<GroupPolicy> {
    let saved = state.store.upsert_group_policy(update.into_policy()?)?;
    state.manager.policies().upsert_group(saved.clone())?;
    state.manager.bump_watermark(Subsystem::Firewall)?;
    tracing::info!(
        policy_id = saved.id,
        check_items = saved.check_items.len(),
        action = saved.action.as_str(),
        "Group policy saved"
    );
    Ok(Json(saved))
}

pub async fn delete_group_policy(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AdminError> {
    state.store.delete_group_policy(id)?;
    state.manager.policies().delete_group(id);
    state.manager.bump_watermark(Subsystem::Firewall)?;
    tracing::info!(policy_id = id, "Group policy deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_settings(State(state): State<AdminState>) -> AdminResult<SyncSettings> {
    Ok(Json(state.store.settings()?))
}

pub async fn put_settings(
    State(state): State<AdminState>,
    Json(update): Json<SettingsUpdate>,
) -> AdminResult<SyncSettings> {
    let settings = update.apply(state.store.settings()?)?;
    state.store.save_settings(settings)?;
    state.manager.set_sync_seconds(settings.sync_seconds);
    tracing::info!(
        sync_seconds = settings.sync_seconds,
        log_expire_seconds = settings.log_expire_seconds,
        "Settings saved"
    );
    Ok(Json(settings))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::admin::{setup_admin_router, AdminState};
    use crate::firewall::{FloodDetector, PolicyEngine};
    use crate::manager::{ConfigManager, ConfigSource};
    use crate::net::tls::CertificateResolver;
    use crate::replication::auth::NodeKey;
    use crate::replication::server::RpcState;
    use crate::routing::RouteRegistry;
    use crate::store::{JsonStore, Store};

    const API_KEY: &str = "secret";

    async fn router() -> (axum::Router, Arc<ConfigManager>, Arc<JsonStore>) {
        let store = Arc::new(JsonStore::in_memory());
        let manager = Arc::new(ConfigManager::new(
            ConfigSource::Store(store.clone()),
            Arc::new(RouteRegistry::new()),
            Arc::new(CertificateResolver::new()),
            Arc::new(FloodDetector::new()),
            Arc::new(PolicyEngine::new(crate::firewall::CheckPoint::default_order())),
        ));
        manager.reload_all().await.unwrap();
        let state = AdminState {
            manager: manager.clone(),
            store: store.clone(),
            api_key: Arc::from(API_KEY),
        };
        let rpc = RpcState {
            store: store.clone(),
            key: Arc::new(NodeKey::from_hex(&NodeKey::generate_hex().unwrap()).unwrap()),
        };
        let router = setup_admin_router(state, rpc, "/gateway/api")
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50000))));
        (router, manager, store)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {API_KEY}"))
            .header("content-type", "application/json");
        match body {
            Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let (router, _, _) = router().await;
        let response = router
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_application_and_domain_update_routes() {
        let (router, manager, store) = router().await;
        let before = store.settings().unwrap().backend_last_modified;

        let response = router
            .clone()
            .oneshot(request(
                "PUT",
                "/admin/applications",
                Some(serde_json::json!({
                    "name": "shop",
                    "destinations": [
                        { "request_route": "/", "backend_route": "/", "destination": "127.0.0.1:9000" }
                    ]
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let app_id = store.applications().unwrap()[0].id;

        let response = router
            .oneshot(request(
                "PUT",
                "/admin/domains",
                Some(serde_json::json!({ "name": "shop.example.com", "app_id": app_id })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let app = manager.routes().resolve_application("shop.example.com").unwrap();
        assert_eq!(app.id, app_id);
        assert!(store.settings().unwrap().backend_last_modified > before);
    }

    #[tokio::test]
    async fn test_global_cc_policy_delete_conflicts() {
        let (router, manager, store) = router().await;
        let response = router.oneshot(request("DELETE", "/admin/cc-policies/0", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(store.cc_policies().unwrap().len(), 1);
        assert!(manager.flood().policies().iter().any(|p| p.app_id == 0));
    }

    #[tokio::test]
    async fn test_group_policy_applied_incrementally() {
        let (router, manager, _) = router().await;
        let response = router
            .oneshot(request(
                "PUT",
                "/admin/group-policies",
                Some(serde_json::json!({
                    "name": "sqli",
                    "vuln_id": 1,
                    "action": "block",
                    "is_enabled": true,
                    "check_items": [
                        { "check_point": "url_query", "operation": "contains", "pattern": "union select" }
                    ]
                })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(manager.policies().indexed_items(), 1);
    }

    #[tokio::test]
    async fn test_invalid_body_is_bad_request() {
        let (router, _, _) = router().await;
        let response = router
            .oneshot(request(
                "PUT",
                "/admin/cc-policies",
                Some(serde_json::json!({
                    "app_id": 3, "interval_ms": 0, "max_count": 5, "block_seconds": 60,
                    "action": "block", "is_enabled": true
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
