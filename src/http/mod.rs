//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Plain / TLS listener
//!     → server.rs (router, request ids, tracing, concurrency limit)
//!     → challenge.rs ({challenge_path}/confirm, {challenge_path}/validate)
//!     → pipeline.rs (admission: domain, WAF, OAuth, routing)
//!     → upstream.rs (pooled backend client)
//!     → response.rs (block pages, redirects, no route)
//! ```

pub mod challenge;
pub mod pipeline;
pub mod response;
pub mod server;
pub mod upstream;

pub use pipeline::GatewayState;
pub use server::{gateway_router, serve_plain, serve_tls};
pub use upstream::{Upstream, UpstreamError};
