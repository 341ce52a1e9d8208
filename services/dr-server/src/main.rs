//! dynroute authority
//!
//! Owns routing peers, routing instances and their agent bindings, answers
//! agent sync requests and pushes binding changes to agent hosts.

use std::sync::Arc;

use anyhow::Result;
use dynroute_server::{
    api, config,
    db::Database,
    networks::StaticNetworkDirectory,
    notifier::{HttpTransport, Notifier},
    scheduler::FleetScheduler,
    state::AppState,
    store::{MemoryStore, PgStore, Store},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to DR_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dynroute authority");
    info!(
        listen_addr = %config.listen_addr,
        auto_schedule = config.policy.auto_schedule,
        agent_down_time_secs = config.policy.agent_down_time.as_secs(),
        "Configuration loaded"
    );

    let store: Arc<dyn Store> = match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            Arc::new(PgStore::new(db.pool().clone()))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let networks = match &config.networks_file {
        Some(path) => {
            let directory = StaticNetworkDirectory::from_file(path)?;
            info!(path = %path.display(), networks = directory.len(), "Loaded network directory");
            directory
        }
        None => StaticNetworkDirectory::new(),
    };

    let transport = HttpTransport::new(config.agent_notify_port, config.notify_timeout)?;
    let notifier = Notifier::new(Arc::new(transport));
    let scheduler = FleetScheduler::new(store, notifier, config.policy.clone(), Arc::new(networks));

    let state = AppState::new(scheduler);
    let app = api::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Authority shutdown complete");
    Ok(())
}
