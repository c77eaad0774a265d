//! Request admission.
//!
//! # Data Flow
//! ```text
//! Request
//!     → domain lookup (redirect domain → 301, unknown → 403 block page)
//!     → HTTPS upgrade (plaintext + redirect_https → 301)
//!     → client address
//!     → WAF (skipped for static resources): flood, then group policies
//!     → OAuth gate
//!     → route + destination selection (miss → 403 no route)
//!     → access log → upstream
//! ```
//!
//! # Design Decisions
//! - One route table snapshot is taken per request, so a concurrent reload
//!   is either fully seen or not at all
//! - Logging and blocklist work is queued, never awaited here

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, Request};
use axum::response::Response;
use axum::Extension;

use crate::clock::unix_now;
use crate::firewall::{sha256_hex, FloodVerdict, RequestView};
use crate::http::response;
use crate::http::upstream::{append_forwarded_for, Upstream, UpstreamTarget};
use crate::load_balancer::{client_identity, rewrite_path, AffinitySelector, DestinationSelector};
use crate::manager::ConfigManager;
use crate::net::ListenerKind;
use crate::observability::{metrics, AccessLogger};
use crate::routing::matcher::file_extension;
use crate::routing::{Application, RouteKind};
use crate::security::{client_ip, Enforcement, Enforcer, HitContext, Identity, IdentityResolver, Verdict};

const HSTS_VALUE: &str = "max-age=31536000";

/// Shared by every gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<ConfigManager>,
    pub enforcer: Arc<Enforcer>,
    pub upstream: Arc<Upstream>,
    pub identity: Arc<dyn IdentityResolver>,
    pub access_log: AccessLogger,
    pub selector: AffinitySelector,
    /// Lowercase extensions including the dot.
    pub static_extensions: Arc<HashSet<String>>,
}

impl GatewayState {
    pub fn is_static(&self, path: &str) -> bool {
        let ext = file_extension(path);
        !ext.is_empty() && self.static_extensions.contains(&ext.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    DomainRedirect,
    UnknownHost,
    HttpsUpgrade,
    Blocked,
    Challenged,
    OAuthRedirect,
    NoRoute,
    Unsupported,
    Proxied,
    UpstreamError,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::DomainRedirect => "domain_redirect",
            Outcome::UnknownHost => "unknown_host",
            Outcome::HttpsUpgrade => "https_upgrade",
            Outcome::Blocked => "blocked",
            Outcome::Challenged => "challenged",
            Outcome::OAuthRedirect => "oauth_redirect",
            Outcome::NoRoute => "no_route",
            Outcome::Unsupported => "unsupported",
            Outcome::Proxied => "proxied",
            Outcome::UpstreamError => "upstream_error",
        }
    }
}

/// Fallback handler of the public listeners.
pub async fn admit(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(listener): Extension<ListenerKind>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let (outcome, response) = admission(&state, peer, listener, request).await;
    metrics::record_request(outcome.as_str(), response.status().as_u16(), started.elapsed());
    response
}

/// Host from the URI authority (HTTP/2) or the `Host` header.
pub fn request_host(request: &Request<Body>) -> String {
    request
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

async fn admission(
    state: &GatewayState,
    peer: SocketAddr,
    listener: ListenerKind,
    mut request: Request<Body>,
) -> (Outcome, Response) {
    let raw_host = request_host(&request);
    let table = state.manager.routes().load();

    let Some(domain) = table.resolve_domain(&raw_host) else {
        metrics::record_routing_miss("unknown_host");
        tracing::debug!(host = %raw_host, peer = %peer, "Unknown host");
        return (Outcome::UnknownHost, response::unknown_host());
    };
    let host = domain.name.clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    if domain.redirect {
        return (
            Outcome::DomainRedirect,
            response::permanent_redirect(&domain.location, query.as_deref()),
        );
    }

    let app = domain.app.clone();
    if listener == ListenerKind::Plain && app.redirect_https {
        return (
            Outcome::HttpsUpgrade,
            response::permanent_redirect(&format!("https://{host}{path}"), query.as_deref()),
        );
    }

    let src_ip = client_ip(app.ip_method, request.headers(), peer);

    if app.waf_enabled && !state.is_static(&path) {
        if let Some(response) = inspect(state, &app, &host, &src_ip, &request) {
            return response;
        }
    }

    let identity = if app.oauth_required && state.manager.oauth().enabled {
        match state.identity.resolve(request.headers()) {
            Some(identity) => Some(identity),
            None => return (Outcome::OAuthRedirect, oauth_redirect(state, listener, &host, &src_ip, &request)),
        }
    } else {
        None
    };

    let user_agent = header_str(&request, header::USER_AGENT).to_string();
    let Some(dest) = app
        .select_route(&path)
        .and_then(|candidates| state.selector.select(candidates, &client_identity(&src_ip, &user_agent)))
    else {
        metrics::record_routing_miss("no_route");
        tracing::debug!(host = %host, path = %path, app_id = app.id, "No route");
        return (Outcome::NoRoute, response::no_route());
    };

    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    state
        .access_log
        .log(&host, request.method().as_str(), &src_ip, &url, &user_agent);

    match dest.route_kind {
        RouteKind::ReverseProxy => {}
        RouteKind::StaticFiles => return (Outcome::Unsupported, response::not_implemented("Static file")),
        RouteKind::FastCgi => return (Outcome::Unsupported, response::not_implemented("FastCGI")),
    }

    prepare_headers(request.headers_mut(), &raw_host, &src_ip, identity.as_ref());
    let upstream_path = rewrite_path(&dest, &path);
    let target = UpstreamTarget {
        scheme: app.internal_scheme,
        destination: &dest.destination,
        server_name: &host,
        path: &upstream_path,
        query: query.as_deref(),
    };

    match state.upstream.forward(request, target).await {
        Ok(mut response) => {
            if listener == ListenerKind::Tls && app.hsts_enabled {
                response
                    .headers_mut()
                    .insert(header::STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS_VALUE));
            }
            (Outcome::Proxied, response)
        }
        Err(e) => {
            tracing::warn!(host = %host, destination = %dest.destination, error = %e, "Upstream request failed");
            (Outcome::UpstreamError, response::bad_gateway())
        }
    }
}

/// Flood check, then group policies. `Some` when the request ends here.
fn inspect(
    state: &GatewayState,
    app: &Application,
    host: &str,
    src_ip: &str,
    request: &Request<Body>,
) -> Option<(Outcome, Response)> {
    let view = RequestView {
        host,
        method: request.method().as_str(),
        path: request.uri().path(),
        query: request.uri().query().unwrap_or_default(),
        headers: request.headers(),
    };
    let ctx = HitContext {
        view: &view,
        app_id: app.id,
        ip_method: app.ip_method,
        src_ip,
        now: unix_now(),
    };

    if let FloodVerdict::Attack { policy, client_id, need_log } = state.manager.flood().inspect(app.id, src_ip, &view) {
        let enforcement = state
            .enforcer
            .enforce(Verdict::Flood { policy, client_id, need_log }, &ctx);
        if let Some(response) = render(enforcement) {
            return Some(response);
        }
    }

    let hit = state.manager.policies().evaluate(&view, app.id, src_ip)?;
    render(state.enforcer.enforce(Verdict::Group(hit), &ctx))
}

fn render(enforcement: Enforcement) -> Option<(Outcome, Response)> {
    match enforcement {
        Enforcement::Continue => None,
        Enforcement::Block { policy_id, vuln_name } => {
            Some((Outcome::Blocked, response::block_page(policy_id, &vuln_name)))
        }
        Enforcement::Challenge { location } => Some((Outcome::Challenged, response::temporary_redirect(&location))),
    }
}

fn header_str(request: &Request<Body>, name: header::HeaderName) -> &str {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// 307 to the OAuth entrance with `state` = SHA-256(ip + url + user agent).
fn oauth_redirect(
    state: &GatewayState,
    listener: ListenerKind,
    host: &str,
    src_ip: &str,
    request: &Request<Body>,
) -> Response {
    let scheme = match listener {
        ListenerKind::Plain => "http",
        ListenerKind::Tls => "https",
    };
    let url = format!("{scheme}://{host}{}", request.uri().path());
    let oauth_state = sha256_hex(&format!("{src_ip}{url}{}", header_str(request, header::USER_AGENT)));

    let entrance = state.manager.oauth().entrance.clone();
    let separator = if entrance.contains('?') { '&' } else { '?' };
    tracing::debug!(host = %host, src_ip = %src_ip, "Redirecting to OAuth entrance");
    response::temporary_redirect(&format!("{entrance}{separator}state={oauth_state}"))
}

fn prepare_headers(headers: &mut axum::http::HeaderMap, host: &str, src_ip: &str, identity: Option<&Identity>) {
    if !headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(header::HOST, value);
        }
    }
    append_forwarded_for(headers, src_ip);

    if let Some(identity) = identity {
        match (
            HeaderValue::from_str(&format!("Bearer {}", identity.access_token)),
            HeaderValue::from_str(&identity.user_id),
        ) {
            (Ok(token), Ok(user)) => {
                headers.insert(header::AUTHORIZATION, token);
                headers.insert("x-auth-user", user);
            }
            _ => tracing::warn!(user_id = %identity.user_id, "Identity not representable as headers"),
        }
    }
}
