//! OAuth identity collaborator.
//!
//! Session handling and provider exchanges live outside the gateway. The
//! gateway only asks for the identity bound to a request.

use axum::http::HeaderMap;

/// User identity resolved from a request's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub access_token: String,
}

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// Resolver for deployments without a session subsystem: nobody is signed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIdentity;

impl IdentityResolver for NoIdentity {
    fn resolve(&self, _headers: &HeaderMap) -> Option<Identity> {
        None
    }
}
