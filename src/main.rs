use ephemera::{
    auth::{AuthGate, OpaqueExchange, SecretGate},
    config::AppConfig,
    ratelimit::RateGovernor,
    schedule::{join_logged, spawn_periodic},
    secret::{SecretVault, Sweeper, VaultOptions},
    storage, web,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often idle rate windows and stale login sessions are dropped
const EVICTION_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Pick up .env before anything reads the environment
    let _ = dotenvy::dotenv();

    init_tracing();
    info!("Starting Ephemera v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    config.validate()?;
    info!("Configuration loaded");

    // Storage
    let payloads = storage::build_payload_store(&config.storage).await?;
    let metadata = storage::build_metadata_store(&config.storage).await?;
    let vault = Arc::new(SecretVault::with_options(
        payloads,
        metadata,
        VaultOptions::from_config(&config.storage),
    ));

    // Authentication
    let exchange = match config.auth.server_setup.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(encoded) => OpaqueExchange::from_base64(encoded)
            .map_err(|e| anyhow::anyhow!("Failed to load OPAQUE server setup: {}", e))?,
        None => {
            warn!("No auth.server_setup configured, generating an ephemeral one");
            warn!("Secrets created before a restart will not be retrievable after it");
            OpaqueExchange::generate()
        }
    };
    let gate = Arc::new(AuthGate::new(exchange, config.auth.session_ttl()));

    let governor = Arc::new(RateGovernor::per_minute(config.rate_limits.requests_per_minute));

    // Background tasks
    let cancel = CancellationToken::new();
    let sweeper = Sweeper::new(vault.clone()).spawn(config.sweeper.interval(), cancel.clone());
    info!("Expiry sweeper running every {}s", config.sweeper.interval_secs);

    let eviction = {
        let governor = governor.clone();
        let gate = gate.clone();
        spawn_periodic("housekeeping", EVICTION_PERIOD, cancel.clone(), move || {
            let governor = governor.clone();
            let gate = gate.clone();
            async move {
                let windows = governor.evict_expired(Instant::now());
                let sessions = gate.evict_expired();
                debug!(windows, sessions, "Housekeeping pass");
            }
        })
    };

    // HTTP
    let state = web::AppState {
        vault,
        gate,
        governor,
        limits: config.limits.clone(),
        trust_forwarded_for: config.server.trust_forwarded_for,
    };
    let app = web::create_router(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped, waiting for background tasks");
    cancel.cancel();
    join_logged(vec![("expiry-sweeper", sweeper), ("housekeeping", eviction)]).await;
    info!("Shutdown complete");

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ephemera=debug,tower_http=debug".into());
    let json = std::env::var("EPHEMERA_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
