//! HTTP server setup.
//!
//! # Responsibilities
//! - Assemble the gateway router (challenge endpoints + admission fallback)
//! - Wire up middleware (request ids, tracing, concurrency limit)
//! - Serve the plaintext and TLS listeners until shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{Extension, Router};
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::error::GatewayError;
use crate::http::challenge;
use crate::http::pipeline::{self, GatewayState};
use crate::net::{tls, CertificateResolver, ListenerKind};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Router shared by both public listeners.
pub fn gateway_router(state: GatewayState, max_in_flight: usize) -> Router {
    let challenge_path = state.enforcer.challenge_path().to_string();
    Router::new()
        .route(&format!("{challenge_path}/confirm"), get(challenge::confirm))
        .route(&format!("{challenge_path}/validate"), post(challenge::validate))
        .fallback(pipeline::admit)
        .with_state(state)
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight.max(1)))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Serve plaintext HTTP on an already bound listener.
pub async fn serve_plain(
    listener: TcpListener,
    router: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), GatewayError> {
    let addr = listener.local_addr().map_err(|e| GatewayError::io("http listener address", e))?;
    tracing::info!(address = %addr, "HTTP listener started");

    let app = router
        .layer(Extension(ListenerKind::Plain))
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| GatewayError::io("serve http", e))?;

    tracing::info!(address = %addr, "HTTP listener stopped");
    Ok(())
}

/// Serve HTTPS with SNI certificate selection.
pub async fn serve_tls(
    addr: SocketAddr,
    router: Router,
    resolver: Arc<CertificateResolver>,
    handshake_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), GatewayError> {
    let config = RustlsConfig::from_config(Arc::new(tls::server_config(resolver)?));
    let acceptor = RustlsAcceptor::new(config).handshake_timeout(handshake_timeout);

    let handle = axum_server::Handle::new();
    let drain = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
    });

    tracing::info!(address = %addr, "HTTPS listener started");
    let app = router
        .layer(Extension(ListenerKind::Tls))
        .into_make_service_with_connect_info::<SocketAddr>();
    axum_server::bind(addr)
        .acceptor(acceptor)
        .handle(handle)
        .serve(app)
        .await
        .map_err(|e| GatewayError::io("serve https", e))?;

    tracing::info!(address = %addr, "HTTPS listener stopped");
    Ok(())
}
