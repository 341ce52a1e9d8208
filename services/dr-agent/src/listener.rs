//! Inbound notification endpoint.
//!
//! The authority pushes `{method, payload}` envelopes here. Requests are
//! acknowledged as soon as the envelope is queued; a single dispatcher task
//! applies them in arrival order.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use dynroute_events::AgentNotification;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::reconciler::SyncReconciler;

/// Notifications waiting for the dispatcher.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 128;

#[derive(Clone)]
struct ListenerState {
    queue: mpsc::Sender<AgentNotification>,
    reconciler: Arc<SyncReconciler>,
}

/// Build the listener router and the receiving end of its queue.
pub fn router(reconciler: Arc<SyncReconciler>) -> (Router, mpsc::Receiver<AgentNotification>) {
    router_with_queue_depth(reconciler, NOTIFICATION_QUEUE_DEPTH)
}

fn router_with_queue_depth(
    reconciler: Arc<SyncReconciler>,
    depth: usize,
) -> (Router, mpsc::Receiver<AgentNotification>) {
    let (queue, rx) = mpsc::channel(depth.max(1));
    let state = ListenerState { queue, reconciler };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/notifications", post(receive))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    (router, rx)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn receive(
    State(state): State<ListenerState>,
    Json(notification): Json<AgentNotification>,
) -> StatusCode {
    let method = notification.method();

    match state.queue.try_send(notification) {
        Ok(()) => {
            debug!(method, "Queued notification");
            StatusCode::ACCEPTED
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            // The next tick picks up whatever this notification carried.
            warn!(method, "Notification queue full, requesting full sync");
            state.reconciler.request_full_sync().await;
            StatusCode::ACCEPTED
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(method, "Notification dispatcher stopped");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Apply queued notifications one at a time until shutdown.
pub async fn run_dispatcher(
    reconciler: Arc<SyncReconciler>,
    mut rx: mpsc::Receiver<AgentNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            notification = rx.recv() => {
                let Some(notification) = notification else { break };
                debug!(method = notification.method(), "Dispatching notification");
                reconciler.handle(notification).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Notification dispatcher stopped");
}

/// Serve `app` on `listener` until shutdown is signalled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Notification listener shutting down");
        })
        .await?;
    Ok(())
}
