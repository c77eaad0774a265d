//! Route key derivation.
//!
//! # Responsibilities
//! - Derive the prefix route key (`/abc/`) from a request path
//! - Derive the extension route key (`.php`)
//! - Derive the wildcard domain key (`*.example.com`)
//! - Normalize the Host header
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP spec)
//! - Path keys are case-sensitive
//! - Plain byte scanning, no regex in the hot path

/// First path segment including both slashes, or `/` when the path has no
/// leading directory made of word characters (`[A-Za-z0-9_]`).
///
/// `/abc/x.php` → `/abc/`, `/x.php` → `/`, `/a-b/x` → `/`.
pub fn route_prefix(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.first() != Some(&b'/') {
        return "/";
    }

    let word_len = bytes[1..]
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();

    if word_len > 0 && bytes.get(word_len + 1) == Some(&b'/') {
        &path[..word_len + 2]
    } else {
        "/"
    }
}

/// Extension of the last path element including the dot, or `""`.
pub fn file_extension(path: &str) -> &str {
    for (i, b) in path.bytes().enumerate().rev() {
        match b {
            b'/' => return "",
            b'.' => return &path[i..],
            _ => {}
        }
    }
    ""
}

/// `www.example.com` → `*.example.com`. `None` for dotless names and names
/// with an empty first label.
pub fn wildcard_name(host: &str) -> Option<String> {
    match host.find('.') {
        Some(i) if i > 0 => Some(format!("*{}", &host[i..])),
        _ => None,
    }
}

/// Strip the port from a Host header value and lowercase it.
pub fn normalize_host(host: &str) -> String {
    let host = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.find(':') {
            Some(i) if i > 0 => &host[..i],
            _ => host,
        }
    };
    host.to_ascii_lowercase()
}
