//! Upstream path rewriting.

use std::borrow::Cow;

use crate::routing::{Destination, RouteKind};

/// Replace the first occurrence of the request-route prefix with the
/// backend-route prefix for reverse-proxy destinations.
pub fn rewrite_path<'a>(dest: &Destination, path: &'a str) -> Cow<'a, str> {
    if dest.route_kind == RouteKind::ReverseProxy && dest.request_route != dest.backend_route {
        Cow::Owned(path.replacen(&dest.request_route, &dest.backend_route, 1))
    } else {
        Cow::Borrowed(path)
    }
}
