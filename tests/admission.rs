//! End-to-end admission tests against a JSON store and an echo backend.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use waf_gateway::firewall::{sha256_hex, CcPolicy, CheckItem, CheckPoint, GroupPolicy, Operation, PolicyAction};
use waf_gateway::http::response::NO_ROUTE_BODY;
use waf_gateway::routing::RouteKind;
use waf_gateway::store::{OAuthConfig, Store};

mod common;
use common::{application, body_json, body_text, domain, eventually, get, start_echo_backend, TestGateway};

const HOST: &str = "shop.example.com";

fn cc_policy(app_id: i64, action: PolicyAction) -> CcPolicy {
    CcPolicy {
        app_id,
        interval_ms: 60_000,
        max_count: 5,
        block_seconds: 60,
        action,
        stat_by_url: true,
        stat_by_user_agent: false,
        stat_by_cookie: false,
        is_enabled: true,
    }
}

#[tokio::test]
async fn test_unknown_host_gets_block_page() {
    let gateway = TestGateway::start(None, |_| {}).await;
    let response = gateway.router.oneshot(get("nowhere.example.com", "/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_text(response).await.contains("Reason: Unknown Host, Policy ID: 0"));
}

#[tokio::test]
async fn test_redirect_domain_keeps_query() {
    let gateway = TestGateway::start(None, |store| {
        let app = store.upsert_application(application("shop", &[])).unwrap();
        let mut old = domain("old.example.com", app.id);
        old.redirect = true;
        old.location = "https://shop.example.com/landing".to_string();
        store.upsert_domain(old).unwrap();
    })
    .await;

    let response = gateway.router.oneshot(get("old.example.com", "/x?ref=mail")).await.unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://shop.example.com/landing?ref=mail"
    );
}

#[tokio::test]
async fn test_plaintext_upgraded_to_https() {
    let gateway = TestGateway::start(None, |store| {
        let mut record = application("shop", &[("/", "/", "127.0.0.1:1".to_string())]);
        record.redirect_https = true;
        let app = store.upsert_application(record).unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
    })
    .await;

    let response = gateway.router.oneshot(get(HOST, "/cart?item=3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()[header::LOCATION], "https://shop.example.com/cart?item=3");
}

#[tokio::test]
async fn test_request_proxied_with_rewritten_path() {
    let backend = start_echo_backend().await;
    let gateway = TestGateway::start(None, |store| {
        let app = store
            .upsert_application(application("shop", &[("/api/", "/v1/", backend.to_string())]))
            .unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
    })
    .await;

    let response = gateway.router.oneshot(get(HOST, "/api/users?page=2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let echoed = body_json(response).await;
    assert_eq!(echoed["path"], "/v1/users");
    assert_eq!(echoed["query"], "page=2");
    assert_eq!(echoed["headers"]["host"], HOST);
    assert_eq!(echoed["headers"]["x-forwarded-for"], "127.0.0.1");
}

#[tokio::test]
async fn test_unmatched_path_is_no_route() {
    let gateway = TestGateway::start(None, |store| {
        let app = store
            .upsert_application(application("shop", &[("/api/", "/", "127.0.0.1:1".to_string())]))
            .unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
    })
    .await;

    let response = gateway.router.oneshot(get(HOST, "/other")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_text(response).await, NO_ROUTE_BODY);
}

#[tokio::test]
async fn test_unsupported_route_kind() {
    let gateway = TestGateway::start(None, |store| {
        let mut record = application("docs", &[("/", "/", String::new())]);
        record.destinations[0].route_kind = RouteKind::StaticFiles;
        let app = store.upsert_application(record).unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
    })
    .await;

    let response = gateway.router.oneshot(get(HOST, "/index.html")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_backend_down_is_bad_gateway() {
    let gateway = TestGateway::start(None, |store| {
        let app = store
            .upsert_application(application("shop", &[("/", "/", "127.0.0.1:1".to_string())]))
            .unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
    })
    .await;

    let response = gateway.router.oneshot(get(HOST, "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_flood_blocked_after_threshold() {
    let backend = start_echo_backend().await;
    let gateway = TestGateway::start(None, |store| {
        let app = store
            .upsert_application(application("shop", &[("/", "/", backend.to_string())]))
            .unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
        store.upsert_cc_policy(cc_policy(app.id, PolicyAction::Block)).unwrap();
    })
    .await;

    for i in 1..=6 {
        let response = gateway.router.clone().oneshot(get(HOST, "/search")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
    }

    let response = gateway.router.clone().oneshot(get(HOST, "/search")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_text(response).await.contains("Reason: CC"));

    let response = gateway.router.clone().oneshot(get(HOST, "/search")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Only the first blocked request is logged.
    assert!(eventually(|| gateway.store.cc_logs().len() == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(gateway.store.cc_logs().len(), 1);

    // Static resources are not counted.
    let response = gateway.router.oneshot(get(HOST, "/site.css")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_group_policy_blocks_and_logs() {
    let backend = start_echo_backend().await;
    let gateway = TestGateway::start(None, |store| {
        let app = store
            .upsert_application(application("shop", &[("/", "/", backend.to_string())]))
            .unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
        store
            .upsert_group_policy(GroupPolicy {
                id: 0,
                name: "traversal".to_string(),
                description: String::new(),
                app_id: 0,
                vuln_id: 4,
                action: PolicyAction::Block,
                is_enabled: true,
                check_items: vec![CheckItem {
                    id: 0,
                    check_point: CheckPoint::UrlQuery,
                    operation: Operation::Contains,
                    key_name: String::new(),
                    pattern: "/etc/passwd".to_string(),
                    group_policy_id: 0,
                }],
                updated_time: 0,
            })
            .unwrap();
    })
    .await;
    let policy_id = gateway.store.group_policies().unwrap()[0].id;

    let response = gateway.router.clone().oneshot(get(HOST, "/file?name=%2Fetc%2Fpasswd")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_text(response).await;
    assert!(body.contains(&format!("Reason: Path Traversal, Policy ID: {policy_id}")));

    assert!(eventually(|| gateway.store.group_hits().len() == 1).await);
    let hit = &gateway.store.group_hits()[0];
    assert_eq!(hit.policy_id, policy_id);
    assert_eq!(hit.request.client_ip, "127.0.0.1");

    let response = gateway.router.oneshot(get(HOST, "/file?name=report.pdf")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Answer of the addition shown on a challenge page.
fn solve(html: &str) -> u32 {
    let caps = regex::Regex::new(r"(\d+) \+ (\d+) = \?").unwrap().captures(html).unwrap();
    caps[1].parse::<u32>().unwrap() + caps[2].parse::<u32>().unwrap()
}

#[tokio::test]
async fn test_challenge_solved_once_lets_client_through() {
    let backend = start_echo_backend().await;
    let gateway = TestGateway::start(None, |store| {
        let app = store
            .upsert_application(application("shop", &[("/", "/", backend.to_string())]))
            .unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
        store.upsert_cc_policy(cc_policy(app.id, PolicyAction::Challenge)).unwrap();
    })
    .await;

    for _ in 0..6 {
        gateway.router.clone().oneshot(get(HOST, "/items?page=1")).await.unwrap();
    }
    let response = gateway.router.clone().oneshot(get(HOST, "/items?page=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with("/captcha/confirm?id="));
    let id = location.split("id=").nth(1).unwrap().to_string();

    let page = gateway.router.clone().oneshot(get(HOST, &location)).await.unwrap();
    assert_eq!(page.status(), StatusCode::OK);
    let answer = solve(&body_text(page).await);

    let wrong = Request::post("/captcha/validate")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("id={id}&answer={}", answer + 1)))
        .unwrap();
    let response = gateway.router.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let answer = solve(&body_text(response).await);

    let right = Request::post("/captcha/validate")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("id={id}&answer={answer}")))
        .unwrap();
    let response = gateway.router.clone().oneshot(right).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/items?page=1");

    // Counters start over; solving leaves nothing behind for the next flood.
    for _ in 0..6 {
        let response = gateway.router.clone().oneshot(get(HOST, "/items?page=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = gateway.router.oneshot(get(HOST, "/items?page=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
}

#[tokio::test]
async fn test_oauth_gate_redirects_with_state() {
    let oauth = OAuthConfig {
        enabled: true,
        provider: "corp".to_string(),
        entrance: "https://sso.example.com/login".to_string(),
    };
    let gateway = TestGateway::start(Some(oauth), |store| {
        let mut record = application("intranet", &[("/", "/", "127.0.0.1:1".to_string())]);
        record.oauth_required = true;
        let app = store.upsert_application(record).unwrap();
        store.upsert_domain(domain(HOST, app.id)).unwrap();
    })
    .await;

    let response = gateway.router.oneshot(get(HOST, "/private?x=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let expected = sha256_hex(&format!("127.0.0.1http://{HOST}/privateintegration-test"));
    assert_eq!(
        response.headers()[header::LOCATION].to_str().unwrap(),
        format!("https://sso.example.com/login?state={expected}")
    );
}
