//! Responses the gateway generates itself.
//!
//! # Responsibilities
//! - Block page for WAF hits and unknown hosts
//! - Fixed "no route" answer
//! - Permanent and temporary redirects
//!
//! # Design Decisions
//! - Block pages name the reason and policy id only; nothing about the
//!   request or the backend is echoed back
//! - Routing misses use status 403 like blocks but a different body, so they
//!   can be told apart in logs and metrics

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};

pub const NO_ROUTE_BODY: &str = "Error: No route found, please check the configuration.";
pub const UNKNOWN_HOST: &str = "Unknown Host";

const BLOCK_PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>403 Forbidden</title>
<style>
body { font-family: Arial, Helvetica, sans-serif; text-align: center; }
.block_div { padding: 10px; width: 70%; margin: auto; }
</style>
</head>
<body>
<div class="block_div">
<h1>403 Forbidden</h1>
<hr>
"#;

const BLOCK_PAGE_TAIL: &str = "\n</div>\n</body>\n</html>\n";

pub(crate) fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn block_page(policy_id: i64, vuln_name: &str) -> Response {
    let body = format!(
        "{BLOCK_PAGE_HEAD}Reason: {}, Policy ID: {policy_id}{BLOCK_PAGE_TAIL}",
        escape_html(vuln_name)
    );
    (StatusCode::FORBIDDEN, Html(body)).into_response()
}

pub fn unknown_host() -> Response {
    block_page(0, UNKNOWN_HOST)
}

pub fn no_route() -> Response {
    (StatusCode::FORBIDDEN, NO_ROUTE_BODY).into_response()
}

pub fn not_implemented(kind: &str) -> Response {
    (StatusCode::NOT_IMPLEMENTED, format!("Error: {kind} routes are not served by this gateway.")).into_response()
}

pub fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Error: Backend unavailable.").into_response()
}

fn redirect(status: StatusCode, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (status, [(header::LOCATION, value)]).into_response(),
        Err(_) => {
            tracing::warn!(location = %location, "Redirect target is not a valid header value");
            (StatusCode::BAD_REQUEST, "Error: Invalid redirect target.").into_response()
        }
    }
}

/// 301, with the original query appended.
pub fn permanent_redirect(location: &str, query: Option<&str>) -> Response {
    match query.filter(|q| !q.is_empty()) {
        Some(query) => redirect(StatusCode::MOVED_PERMANENTLY, &format!("{location}?{query}")),
        None => redirect(StatusCode::MOVED_PERMANENTLY, location),
    }
}

/// 307.
pub fn temporary_redirect(location: &str) -> Response {
    redirect(StatusCode::TEMPORARY_REDIRECT, location)
}
