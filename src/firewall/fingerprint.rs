//! Client fingerprints.

use sha2::{Digest, Sha256};

use crate::firewall::types::{CcPolicy, RequestView};

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Flood counter key: SHA-256 of the source IP followed by, as the policy
/// selects, the URL path, the user agent and the cookie header.
pub fn flood_fingerprint(policy: &CcPolicy, src_ip: &str, view: &RequestView<'_>) -> String {
    let mut material = String::from(src_ip);
    if policy.stat_by_url {
        material.push_str(view.path);
    }
    if policy.stat_by_user_agent {
        material.push_str(&view.user_agent());
    }
    if policy.stat_by_cookie {
        material.push_str(&view.cookie_header());
    }
    sha256_hex(&material)
}

/// Challenge key for policy hits: IP, path, user agent and cookie.
pub fn challenge_client_id(src_ip: &str, view: &RequestView<'_>) -> String {
    sha256_hex(&format!(
        "{}{}{}{}",
        src_ip,
        view.path,
        view.user_agent(),
        view.cookie_header()
    ))
}
