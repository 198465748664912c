//! Rotating access-code server
//!
//! Single-binary service that:
//! 1. Opens the code store and makes sure the pool document exists
//! 2. Serves each page's current access code, rotating it daily
//! 3. Verifies codes submitted by the bot front-end
//! 4. Optionally exposes an admin API on a second listener

mod admin;
mod config;
mod error;
mod metrics;
mod routes;
mod service;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use code_rotation::CodeRotator;
use code_store::{DocumentStore, JsonFileStore, MemoryStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StoreBackend};
use crate::routes::AppState;
use crate::service::{ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event};

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting code-server");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store = ?config.store.backend,
        store_path = %config.store.path.display(),
        pages = config.rotation.pages,
        cutoff_hour = config.rotation.cutoff_hour,
        wait_days = config.rotation.wait_days,
        admin = config.admin.is_some(),
        "configuration loaded"
    );

    // Transition: Initializing -> OpeningStore
    let (new_state, action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
        },
    );
    state = new_state;
    match action {
        ServiceAction::OpenStore => {}
        _ => anyhow::bail!("unexpected action after ConfigLoaded: {action:?}"),
    }
    info!("state: OpeningStore");

    let rotator = loop {
        match open_rotator(&config).await {
            Ok(rotator) => break rotator,
            Err(e @ error::Error::StoreCorrupt(_)) => {
                // A document that does not parse will not parse on retry either
                anyhow::bail!("{e}; fix or remove {}", config.store.path.display());
            }
            Err(error::Error::StoreOpen(msg)) => {
                let (new_state, action) = handle_event(state, ServiceEvent::StoreError(msg.clone()));
                state = new_state;

                match action {
                    ServiceAction::ScheduleRetry { delay } => {
                        warn!(
                            error = %msg,
                            retry_in_secs = delay.as_secs(),
                            "code store unavailable, retrying"
                        );
                        tokio::time::sleep(delay).await;

                        let (new_state, _) = handle_event(state, ServiceEvent::RetryTimer);
                        state = new_state;
                    }
                    ServiceAction::Shutdown { exit_code } => {
                        error!(error = %msg, "code store unavailable after max retries");
                        std::process::exit(exit_code);
                    }
                    _ => anyhow::bail!("code store unavailable: {msg}"),
                }
            }
        }
    };

    // Transition: OpeningStore -> Starting
    let (new_state, action) = handle_event(state, ServiceEvent::StoreOpened);
    state = new_state;
    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        _ => anyhow::bail!("unexpected action after StoreOpened: {action:?}"),
    };
    info!(store = rotator.store_id(), "state: Starting");

    let service_metrics = ServiceMetrics::new();
    let app = routes::build_router(
        AppState {
            rotator: rotator.clone(),
            metrics: service_metrics.clone(),
            prometheus: prometheus_handle,
        },
        config.server.max_connections,
    );

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    let admin_listener = match &config.admin {
        Some(admin) => Some(
            TcpListener::bind(admin.listen_addr)
                .await
                .with_context(|| format!("failed to bind admin API to {}", admin.listen_addr))?,
        ),
        None => None,
    };

    // Transition: Starting -> Running
    let (new_state, _) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %listen_addr, "state: Running, accepting requests");

    // Both servers drain when this flips to true
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = tokio::spawn(serve(listener, app, shutdown_rx.clone()));

    let admin_handle = match (admin_listener, config.admin) {
        (Some(admin_listener), Some(admin_config)) => {
            let admin_app = admin::build_admin_router(admin::AdminState::new(
                rotator.clone(),
                admin_config.token,
            ));
            info!(addr = %admin_config.listen_addr, "admin API listening");
            Some(tokio::spawn(serve(
                admin_listener,
                admin_app,
                shutdown_rx.clone(),
            )))
        }
        _ => None,
    };

    let sweep_handle = config.rotation.sweep_interval().map(|interval| {
        info!(
            interval_secs = interval.as_secs(),
            "background recycling sweep enabled"
        );
        code_rotation::spawn_sweep_task(rotator.clone(), interval)
    });

    shutdown_signal().await;

    // Transition: Running -> Draining
    let (new_state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    let deadline = match action {
        ServiceAction::Drain { deadline } => deadline,
        _ => tokio::time::Instant::now().into_std(),
    };

    if let Some(handle) = sweep_handle {
        handle.abort();
    }
    let _ = shutdown_tx.send(true);

    // Drain deadline starts at signal receipt, not server start
    let drain = async {
        let main_result = server_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
        main_result
    };
    let event = match tokio::time::timeout_at(deadline.into(), drain).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::Drained
        }
        Err(_) => {
            let remaining = service_metrics.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = service::DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };

    let (_state, action) = handle_event(state, event);
    info!(?action, "shutdown complete");
    Ok(())
}

/// Open the configured store and initialize the pool document.
async fn open_rotator(config: &Config) -> error::Result<Arc<CodeRotator>> {
    let store: Arc<dyn DocumentStore> = match config.store.backend {
        StoreBackend::JsonFile => Arc::new(JsonFileStore::open(config.store.path.clone()).await?),
        StoreBackend::Memory => {
            warn!("using in-memory code store, codes are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    let rotator = CodeRotator::new(store, config.rotation.policy());
    rotator.ensure_initialized().await?;
    Ok(Arc::new(rotator))
}

/// Run one axum server until `shutdown` flips to true.
async fn serve(
    listener: TcpListener,
    app: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
