//! WAF gateway node.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                     GATEWAY NODE                      │
//!   Client Request   │  ┌──────────┐   ┌──────────┐   ┌──────────────────┐  │
//!   ─────────────────┼─▶│ listener │──▶│ routing  │──▶│ flood + policies │  │
//!                    │  │ http/tls │   │ registry │   │    (enforcer)    │  │
//!                    │  └──────────┘   └──────────┘   └────────┬─────────┘  │
//!                    │                                         ▼            │
//!   Client Response  │  ┌──────────┐   ┌──────────┐   ┌──────────────────┐  │
//!   ◀────────────────┼──│ upstream │◀──│ selector │◀──│    OAuth gate    │  │
//!                    │  └──────────┘   └──────────┘   └──────────────────┘  │
//!                    │                                                      │
//!                    │  ┌──────────────┐  ┌────────────┐  ┌──────────────┐  │
//!                    │  │ config mgr   │  │ background │  │  lifecycle   │  │
//!                    │  │ store / sync │  │   worker   │  │   routines   │  │
//!                    │  └──────────────┘  └────────────┘  └──────────────┘  │
//!                    └──────────────────────────────────────────────────────┘
//! ```
//!
//! A primary owns the data store and serves the admin API and the
//! replication endpoint. A replica pulls its configuration from the primary
//! and forwards hit logs to it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};

use waf_gateway::admin::{setup_admin_router, AdminState};
use waf_gateway::config::{load_config, watcher::DataWatcher, GatewayConfig};
use waf_gateway::firewall::{FloodDetector, KernelBlocklist, NftCommand, PolicyEngine};
use waf_gateway::http::{gateway_router, serve_plain, serve_tls, GatewayState, Upstream};
use waf_gateway::lifecycle::{routines, wait_for_signal, Shutdown};
use waf_gateway::load_balancer::AffinitySelector;
use waf_gateway::manager::{ConfigManager, ConfigSource};
use waf_gateway::net::CertificateResolver;
use waf_gateway::observability::{init_tracing, metrics, AccessLogger};
use waf_gateway::replication::{NodeKey, ReplicationClient, RpcState, SyncLoop};
use waf_gateway::routing::RouteRegistry;
use waf_gateway::security::{
    ArithmeticChallenge, ChallengeStore, Enforcer, HitLogSink, NoIdentity, TaskDispatcher, TaskWorker,
};
use waf_gateway::store::{JsonStore, Store};
use waf_gateway::GatewayError;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "waf-gateway", version, about = "WAF gateway node")]
struct Args {
    /// Node configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, GatewayError> {
    value
        .parse()
        .map_err(|e| GatewayError::io(field, std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
}

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_tracing(&config.observability.log_level);

    let role = if config.is_primary() { "primary" } else { "replica" };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        role,
        config = %args.config.display(),
        "waf-gateway starting"
    );

    let _ = rustls::crypto::ring::default_provider().install_default();

    if config.observability.metrics_enabled {
        let addr = parse_addr("observability.metrics_address", &config.observability.metrics_address)?;
        if let Err(e) = metrics::init_metrics(addr) {
            tracing::error!(error = %e, "Failed to start metrics exporter");
        }
    }

    run(config).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run(config: GatewayConfig) -> Result<(), GatewayError> {
    let key = Arc::new(NodeKey::from_hex(&config.node_key)?);
    let shutdown = Shutdown::new();

    let routes = Arc::new(RouteRegistry::new());
    let certificates = Arc::new(CertificateResolver::new());
    let flood = Arc::new(FloodDetector::new());
    let policies = Arc::new(PolicyEngine::new(&config.waf.checkpoint_order));

    let (source, sink, store) = if config.is_primary() {
        let store: Arc<dyn Store> = Arc::new(
            JsonStore::open(&config.primary.data_path).map_err(|e| GatewayError::store("open data file", e))?,
        );
        (ConfigSource::Store(store.clone()), HitLogSink::Store(store.clone()), Some(store))
    } else {
        let client = Arc::new(
            ReplicationClient::new(
                config.replica.sync_addr.clone(),
                config.node_version.clone(),
                key.clone(),
                Duration::from_secs(config.replica.request_timeout_secs),
            )
            .map_err(|e| GatewayError::replication("build client", e))?,
        );
        (ConfigSource::Primary(client.clone()), HitLogSink::Primary(client), None)
    };

    let manager = Arc::new(ConfigManager::new(
        source,
        routes,
        certificates.clone(),
        flood.clone(),
        policies,
    ));
    if config.is_primary() {
        manager.reload_all().await?;
    } else {
        manager
            .load_initial(
                config.replica.startup_attempts,
                Duration::from_millis(config.replica.startup_backoff_ms),
            )
            .await?;
    }

    let blocklist = if config.firewall.kernel_blocklist {
        let blocklist = KernelBlocklist::new(
            Box::new(NftCommand::new(config.firewall.nft_binary.clone())),
            config.firewall.table.clone(),
        );
        if let Err(e) = blocklist.init() {
            tracing::error!(error = %e, "Kernel blocklist setup failed, will retry on first block");
        }
        Arc::new(blocklist)
    } else {
        Arc::new(KernelBlocklist::disabled())
    };

    let (dispatcher, tasks) = TaskDispatcher::channel(config.dispatch.queue_capacity);
    let worker = TaskWorker::new(sink, blocklist);
    let worker_task = tokio::spawn(worker.run(tasks, shutdown.subscribe()));

    let challenges = Arc::new(ChallengeStore::new(
        Duration::from_secs(config.waf.challenge_ttl_secs),
        Box::new(ArithmeticChallenge),
    ));
    tokio::spawn(routines::challenge_sweep(
        challenges.clone(),
        Duration::from_secs(config.waf.challenge_sweep_secs),
        shutdown.subscribe(),
    ));

    let state = GatewayState {
        manager: manager.clone(),
        enforcer: Arc::new(Enforcer::new(dispatcher, challenges, config.waf.challenge_path.clone())),
        upstream: Arc::new(Upstream::new(&config.timeouts)?),
        identity: Arc::new(NoIdentity),
        access_log: AccessLogger::new(config.observability.access_log),
        selector: AffinitySelector::new(),
        static_extensions: Arc::new(
            config
                .waf
                .static_extensions
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect::<HashSet<_>>(),
        ),
    };
    let router = gateway_router(state, config.listener.max_connections);

    let http_listener = TcpListener::bind(&config.listener.http_address)
        .await
        .map_err(|e| GatewayError::io("bind http listener", e))?;
    let mut listeners = JoinSet::new();
    listeners.spawn(serve_plain(http_listener, router.clone(), shutdown.subscribe()));

    if config.listener.https_enabled {
        let addr = parse_addr("listener.https_address", &config.listener.https_address)?;
        listeners.spawn(serve_tls(
            addr,
            router,
            certificates,
            Duration::from_secs(config.timeouts.tls_handshake_secs),
            shutdown.subscribe(),
        ));
    }

    // The watcher stops delivering events once dropped.
    let mut _watcher = None;
    match store {
        Some(store) => {
            let admin_state = AdminState {
                manager: manager.clone(),
                store: store.clone(),
                api_key: Arc::from(config.primary.admin_api_key.as_str()),
            };
            let rpc = RpcState { store: store.clone(), key };
            let admin = setup_admin_router(admin_state, rpc, &config.primary.rpc_path);
            let admin_listener = TcpListener::bind(&config.primary.admin_address)
                .await
                .map_err(|e| GatewayError::io("bind admin listener", e))?;
            tracing::info!(address = %config.primary.admin_address, "Admin API listening");
            let mut admin_shutdown = shutdown.subscribe();
            listeners.spawn(async move {
                axum::serve(admin_listener, admin.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move {
                        let _ = admin_shutdown.recv().await;
                    })
                    .await
                    .map_err(|e| GatewayError::io("serve admin", e))
            });

            tokio::spawn(routines::log_retention(
                store.clone(),
                routines::LOG_RETENTION_PERIOD,
                shutdown.subscribe(),
            ));

            if config.primary.watch_data_file {
                let (watcher, changes) = DataWatcher::new(Path::new(&config.primary.data_path));
                match watcher.run() {
                    Ok(handle) => {
                        _watcher = Some(handle);
                        tokio::spawn(routines::data_reload(manager.clone(), changes, shutdown.subscribe()));
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to watch data file"),
                }
            }
        }
        None => {
            let sync = SyncLoop::new(manager.clone(), Duration::from_secs(config.replica.initial_sync_seconds));
            tokio::spawn(sync.run(shutdown.subscribe()));
        }
    }

    tokio::select! {
        _ = wait_for_signal() => {}
        Some(result) = listeners.join_next() => {
            log_listener_exit(result);
            tracing::error!("Listener exited early");
        }
    }

    tracing::info!("Shutting down");
    shutdown.trigger();
    flood.stop_timers();

    while let Some(result) = listeners.join_next().await {
        log_listener_exit(result);
    }
    if let Err(e) = worker_task.await {
        tracing::warn!(error = %e, "Background worker panicked");
    }
    let remaining = shutdown.drain(SHUTDOWN_DEADLINE).await;
    if remaining > 0 {
        tracing::warn!(remaining, "Tasks still running at shutdown deadline");
    }
    Ok(())
}

fn log_listener_exit(result: Result<Result<(), GatewayError>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Listener stopped with error"),
        Err(e) => tracing::error!(error = %e, "Listener task panicked"),
    }
}
