//! Forwarding to backend destinations.
//!
//! # Responsibilities
//! - Keep one pooled client for plain and TLS backends
//! - Point the request at the selected destination and rewritten path
//! - Strip hop-by-hop headers in both directions
//!
//! # Design Decisions
//! - The client speaks HTTP/1.1 to every backend
//! - The original `Host` is kept so name-based backends see the public name
//! - TLS backends are dialled at the destination address but shown the
//!   public host for SNI and certificate checks. The name rides in the URI
//!   userinfo (`name@host:port`), which also keys the connection pool and
//!   never reaches the wire
//! - Dropping the response future (client went away) cancels the backend
//!   exchange; nothing else is tied to it

use std::time::Duration;

use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Uri, Version};
use axum::response::Response;
use hyper_rustls::builderstates::WantsSchemes;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::{InvalidDnsNameError, ServerName};
use rustls::ClientConfig;
use thiserror::Error;

use crate::config::TimeoutConfig;
use crate::routing::InternalScheme;

pub type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream uri: {0}")]
    Uri(String),

    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("tls client setup failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// Where one request goes.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTarget<'a> {
    pub scheme: InternalScheme,
    /// `host:port` of the destination.
    pub destination: &'a str,
    /// Public host name presented to TLS backends.
    pub server_name: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
}

impl UpstreamTarget<'_> {
    pub fn uri(&self) -> Result<Uri, UpstreamError> {
        let scheme = match self.scheme {
            InternalScheme::Http => Scheme::HTTP,
            InternalScheme::Https => Scheme::HTTPS,
        };
        let authority = match self.scheme {
            InternalScheme::Https if is_dns_label_text(self.server_name) => {
                Authority::try_from(format!("{}@{}", self.server_name, self.destination))
            }
            _ => Authority::try_from(self.destination),
        }
        .map_err(|e| UpstreamError::Uri(e.to_string()))?;
        let path_and_query = match self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.to_string(),
        };
        let path_and_query =
            PathAndQuery::try_from(path_and_query).map_err(|e| UpstreamError::Uri(e.to_string()))?;
        Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| UpstreamError::Uri(e.to_string()))
    }
}

pub struct Upstream {
    client: HttpsClient,
    request_timeout: Duration,
}

/// Host names made of letters, digits, `-` and `.` only, so they fit into URI
/// userinfo unescaped.
fn is_dns_label_text(name: &str) -> bool {
    !name.is_empty()
        && name.parse::<std::net::IpAddr>().is_err()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

/// Name for SNI and verification: the userinfo when present, else the host.
fn tls_server_name(uri: &Uri) -> Result<ServerName<'static>, InvalidDnsNameError> {
    let authority = uri.authority().map(Authority::as_str).unwrap_or_default();
    let name = match authority.rsplit_once('@') {
        Some((name, _)) => name,
        None => uri.host().unwrap_or_default().trim_start_matches('[').trim_end_matches(']'),
    };
    ServerName::try_from(name.to_string())
}

impl Upstream {
    /// Client trusting the webpki roots.
    pub fn new(timeouts: &TimeoutConfig) -> Result<Self, UpstreamError> {
        let builder =
            HttpsConnectorBuilder::new().with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?;
        Ok(Self::build(timeouts, builder))
    }

    /// Client using a caller supplied TLS configuration.
    pub fn with_tls_config(timeouts: &TimeoutConfig, config: ClientConfig) -> Self {
        Self::build(timeouts, HttpsConnectorBuilder::new().with_tls_config(config))
    }

    fn build(timeouts: &TimeoutConfig, builder: HttpsConnectorBuilder<WantsSchemes>) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
        http.set_nodelay(true);

        let connector = builder
            .https_or_http()
            .with_server_name_resolver(tls_server_name)
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(timeouts.idle_secs))
            .pool_max_idle_per_host(64)
            .build(connector);

        Self {
            client,
            request_timeout: Duration::from_secs(timeouts.request_secs),
        }
    }

    /// Send `request` to `target`. Waiting for the response head is bounded by
    /// the request timeout; the body streams through afterwards.
    pub async fn forward(&self, mut request: Request<Body>, target: UpstreamTarget<'_>) -> Result<Response, UpstreamError> {
        *request.uri_mut() = target.uri()?;
        *request.version_mut() = Version::HTTP_11;
        strip_hop_by_hop(request.headers_mut());

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout))??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Remove hop-by-hop headers, including those listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Append `client` to `X-Forwarded-For`.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: &str) {
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client}"),
        _ => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}
