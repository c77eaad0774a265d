//! Shared utilities for the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, Response};
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use waf_gateway::config::TimeoutConfig;
use waf_gateway::firewall::{CheckPoint, FloodDetector, KernelBlocklist, PolicyEngine};
use waf_gateway::http::{gateway_router, GatewayState, Upstream};
use waf_gateway::load_balancer::AffinitySelector;
use waf_gateway::manager::{ConfigManager, ConfigSource};
use waf_gateway::net::{CertificateResolver, ListenerKind};
use waf_gateway::observability::AccessLogger;
use waf_gateway::routing::{ApplicationRecord, Destination, Domain, RouteRegistry};
use waf_gateway::security::{ArithmeticChallenge, ChallengeStore, Enforcer, HitLogSink, NoIdentity, TaskDispatcher, TaskWorker};
use waf_gateway::store::{JsonStore, OAuthConfig, Store};

pub const CLIENT: [u8; 4] = [127, 0, 0, 1];

/// Start a backend that answers every request with a JSON description of it.
pub async fn start_echo_backend() -> SocketAddr {
    async fn echo(request: Request<Body>) -> Json<Value> {
        let headers: BTreeMap<String, String> = request
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        Json(json!({
            "method": request.method().as_str(),
            "path": request.uri().path(),
            "query": request.uri().query().unwrap_or_default(),
            "headers": headers,
        }))
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, Router::new().fallback(echo)).await;
    });
    addr
}

pub fn application(name: &str, routes: &[(&str, &str, String)]) -> ApplicationRecord {
    ApplicationRecord {
        id: 0,
        name: name.to_string(),
        internal_scheme: Default::default(),
        redirect_https: false,
        hsts_enabled: false,
        waf_enabled: true,
        ip_method: Default::default(),
        description: String::new(),
        oauth_required: false,
        session_seconds: 0,
        owner: String::new(),
        destinations: routes
            .iter()
            .map(|(request_route, backend_route, destination)| Destination {
                id: 0,
                route_kind: Default::default(),
                request_route: request_route.to_string(),
                backend_route: backend_route.to_string(),
                destination: destination.clone(),
                app_id: 0,
                node_id: 0,
            })
            .collect(),
    }
}

pub fn domain(name: &str, app_id: i64) -> Domain {
    Domain {
        id: 0,
        name: name.to_string(),
        app_id,
        cert_id: 0,
        redirect: false,
        location: String::new(),
    }
}

/// A primary's gateway over a JSON store in a temp directory.
pub struct TestGateway {
    pub router: Router,
    pub manager: Arc<ConfigManager>,
    pub store: Arc<JsonStore>,
    pub shutdown: broadcast::Sender<()>,
    _dir: TempDir,
}

impl TestGateway {
    /// `seed` fills the store before the first reload.
    pub async fn start(oauth: Option<OAuthConfig>, seed: impl FnOnce(&JsonStore)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        if let Some(oauth) = oauth {
            std::fs::write(&path, json!({ "oauth": oauth }).to_string()).unwrap();
        }
        let store = Arc::new(JsonStore::open(&path).unwrap());
        seed(&store);

        let manager = Arc::new(ConfigManager::new(
            ConfigSource::Store(store.clone()),
            Arc::new(RouteRegistry::new()),
            Arc::new(CertificateResolver::new()),
            Arc::new(FloodDetector::new()),
            Arc::new(PolicyEngine::new(CheckPoint::default_order())),
        ));
        manager.reload_all().await.unwrap();

        let (shutdown, _) = broadcast::channel(1);
        let (dispatcher, tasks) = TaskDispatcher::channel(64);
        let sink_store: Arc<dyn Store> = store.clone();
        let worker = TaskWorker::new(HitLogSink::Store(sink_store), Arc::new(KernelBlocklist::disabled()));
        tokio::spawn(worker.run(tasks, shutdown.subscribe()));

        let challenges = Arc::new(ChallengeStore::new(Duration::from_secs(300), Box::new(ArithmeticChallenge)));
        let state = GatewayState {
            manager: manager.clone(),
            enforcer: Arc::new(Enforcer::new(dispatcher, challenges, "/captcha")),
            upstream: Arc::new(Upstream::new(&TimeoutConfig::default()).unwrap()),
            identity: Arc::new(NoIdentity),
            access_log: AccessLogger::new(false),
            selector: AffinitySelector::new(),
            static_extensions: Arc::new([".css".to_string(), ".png".to_string()].into_iter().collect::<HashSet<_>>()),
        };
        let router = gateway_router(state, 64)
            .layer(Extension(ListenerKind::Plain))
            .layer(MockConnectInfo(SocketAddr::from((CLIENT, 40000))));

        Self {
            router,
            manager,
            store,
            shutdown,
            _dir: dir,
        }
    }
}

pub fn get(host: &str, uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("host", host)
        .header("user-agent", "integration-test")
        .body(Body::empty())
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Poll until `check` holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
