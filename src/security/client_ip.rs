//! Client address extraction.

use std::net::SocketAddr;

use axum::http::HeaderMap;

use crate::routing::IpMethod;

/// Client address as configured for the application. Header methods fall
/// back to the socket peer when the header is missing or empty.
pub fn client_ip(method: IpMethod, headers: &HeaderMap, remote: SocketAddr) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default();

    let candidate = match method {
        IpMethod::RemoteAddr => "",
        IpMethod::XForwardedFor => header("x-forwarded-for").rsplit(',').next().unwrap_or_default(),
        IpMethod::XRealIp => header("x-real-ip"),
        IpMethod::RealIp => header("real-ip"),
    };
    match candidate.trim() {
        "" => remote.ip().to_string(),
        ip => ip.to_string(),
    }
}
