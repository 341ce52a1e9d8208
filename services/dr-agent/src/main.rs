//! dynroute Agent
//!
//! Runs on each routing host and keeps the local BGP speaker in line with
//! the peers and prefixes the authority assigns to this host.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dynroute_agent::{
    config::Config,
    driver::{best_path_channel, run_best_path_consumer, MockDriver},
    heartbeat::HeartbeatReporter,
    listener, AgentState, AuthorityClient, ReconcilerConfig, SyncReconciler,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to DR_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dynroute agent");
    info!(
        host = %config.host,
        authority_url = %config.authority_url,
        local_as = %config.local_as,
        router_id = %config.router_id,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Routing engine (mock for now)
    let (best_path_tx, best_path_rx) = best_path_channel();
    warn!("Using the in-memory routing engine; no BGP sessions are established");
    let driver = Arc::new(MockDriver::new(config.local_as, config.router_id, best_path_tx));
    let best_path_handle = tokio::spawn(run_best_path_consumer(best_path_rx, shutdown_rx.clone()));

    let authority = Arc::new(AuthorityClient::new(
        config.authority_url.clone(),
        config.host.clone(),
        config.authority_timeout,
    )?);

    let reconciler = Arc::new(SyncReconciler::new(
        authority.clone(),
        driver,
        AgentState::shared(),
        ReconcilerConfig::from(&config),
    ));

    let reconciler_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let shutdown_rx = shutdown_rx.clone();
        async move { reconciler.run(shutdown_rx).await }
    });

    let heartbeat = HeartbeatReporter::new(authority, config.state_report(), config.report_interval);
    let heartbeat_handle = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

    let (app, notifications) = listener::router(Arc::clone(&reconciler));
    let dispatcher_handle = tokio::spawn(listener::run_dispatcher(
        Arc::clone(&reconciler),
        notifications,
        shutdown_rx.clone(),
    ));

    let tcp = tokio::net::TcpListener::bind(config.notify_listen_addr).await?;
    info!(addr = %config.notify_listen_addr, "Listening for notifications");
    let mut listener_handle = tokio::spawn(listener::serve(tcp, app, shutdown_rx));

    let mut listener_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut listener_handle => {
            listener_done = true;
            match result {
                Ok(Ok(())) => info!("Notification listener exited"),
                Ok(Err(e)) => error!(error = %e, "Notification listener error"),
                Err(e) => error!(error = %e, "Notification listener panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let grace = config.shutdown_grace;
    join_with_grace("reconciler", reconciler_handle, grace).await;
    join_with_grace("heartbeat", heartbeat_handle, grace).await;
    join_with_grace("dispatcher", dispatcher_handle, grace).await;
    join_with_grace("best path consumer", best_path_handle, grace).await;
    if !listener_done {
        join_with_grace("listener", listener_handle, grace).await;
    }

    info!("Agent shutdown complete");
    Ok(())
}

/// Wait for `handle`, abandoning it after `grace`.
async fn join_with_grace<T>(name: &str, handle: JoinHandle<T>, grace: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(_)) => info!(task = name, "Task stopped"),
        Ok(Err(e)) => error!(task = name, error = %e, "Task panicked"),
        Err(_) => {
            warn!(task = name, grace_secs = grace.as_secs(), "Task did not stop in time, abandoning");
            abort.abort();
        }
    }
}
