//! Agent-facing sync endpoints.
//!
//! Agents pull their assigned peers and advertise networks here and report
//! their state. A sync request may bind unscheduled work to the caller.

use axum::{extract::State, routing::post, Json, Router};
use dynroute_events::{
    AdvertiseNetworks, AgentStateReport, AssignedPeers, ReportStateAck, SyncRequest,
};

use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/routingpeers", post(sync_routing_peers))
        .route("/advertisenetworks", post(sync_advertise_networks))
        .route("/report-state", post(report_state))
}

fn require_host(host: &str, ctx: &RequestContext) -> Result<(), ApiError> {
    if host.trim().is_empty() {
        return Err(ctx.error(ApiError::validation(vec![FieldError::new(
            "host",
            "must not be empty",
        )])));
    }
    Ok(())
}

async fn sync_routing_peers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<SyncRequest>,
) -> Result<Json<AssignedPeers>, ApiError> {
    require_host(&req.host, &ctx)?;
    let routing_peers = state
        .scheduler()
        .sync_routing_peers(&req.host)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(AssignedPeers { routing_peers }))
}

async fn sync_advertise_networks(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<SyncRequest>,
) -> Result<Json<AdvertiseNetworks>, ApiError> {
    require_host(&req.host, &ctx)?;
    let networks = state
        .scheduler()
        .sync_advertise_networks(&req.host)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(AdvertiseNetworks { networks }))
}

async fn report_state(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(report): Json<AgentStateReport>,
) -> Result<Json<ReportStateAck>, ApiError> {
    require_host(&report.host, &ctx)?;
    let ack = state
        .scheduler()
        .report_state(&report)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ack))
}
