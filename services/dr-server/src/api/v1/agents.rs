//! Agent API endpoints.
//!
//! Agents register themselves through state reports; operators can list
//! them, toggle their admin state and manage which peers they host.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dynroute_id::{AgentId, PeerId};
use serde::{Deserialize, Serialize};

use super::routing_instances::RoutingInstanceResponse;
use super::routing_peers::RoutingPeerResponse;
use super::{parse_id, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::store::Agent;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents))
        .route("/{agent_id}", get(get_agent).put(update_agent))
        .route(
            "/{agent_id}/routingpeers",
            get(list_agent_peers).post(bind_peer),
        )
        .route("/{agent_id}/routingpeers/{peer_id}", delete(unbind_peer))
        .route("/{agent_id}/routinginstances", get(list_agent_instances))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub id: String,
    pub agent_type: String,
    pub binary: String,
    pub host: String,
    pub topic: String,
    pub admin_state_up: bool,

    /// Whether the last heartbeat is within the liveness threshold.
    pub alive: bool,

    pub configurations: serde_json::Value,
    pub heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AgentResponse {
    pub fn new(agent: &Agent, alive: bool) -> Self {
        Self {
            id: agent.id.to_string(),
            agent_type: agent.agent_type.clone(),
            binary: agent.binary.clone(),
            host: agent.host.clone(),
            topic: agent.topic.clone(),
            admin_state_up: agent.admin_state_up,
            alive,
            configurations: agent.configurations.clone(),
            heartbeat_at: agent.heartbeat_at,
            started_at: agent.started_at,
            created_at: agent.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentRequest {
    pub admin_state_up: bool,
}

#[derive(Debug, Deserialize)]
pub struct BindPeerRequest {
    pub routingpeer_id: String,
}

#[derive(Debug, Serialize)]
pub struct PeerBindingResponse {
    pub agent_id: String,
    pub routingpeer_id: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_agents(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListResponse<AgentResponse>>, ApiError> {
    let scheduler = state.scheduler();
    let agents = state.store().list_agents().await.map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        agents
            .iter()
            .map(|a| AgentResponse::new(a, scheduler.is_alive(a)))
            .collect(),
    )))
}

async fn get_agent(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentResponse>, ApiError> {
    let agent_id: AgentId = parse_id(&agent_id, "agent_id", &ctx)?;
    let agent = state
        .store()
        .get_agent(agent_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(AgentResponse::new(
        &agent,
        state.scheduler().is_alive(&agent),
    )))
}

async fn update_agent(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
    Json(req): Json<UpdateAgentRequest>,
) -> Result<Json<AgentResponse>, ApiError> {
    let agent_id: AgentId = parse_id(&agent_id, "agent_id", &ctx)?;
    let agent = state
        .store()
        .set_agent_admin_state(agent_id, req.admin_state_up)
        .await
        .map_err(|e| ctx.error(e))?;

    tracing::info!(
        agent_id = %agent_id,
        admin_state_up = req.admin_state_up,
        "Updated agent admin state"
    );
    Ok(Json(AgentResponse::new(
        &agent,
        state.scheduler().is_alive(&agent),
    )))
}

async fn list_agent_peers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
) -> Result<Json<ListResponse<RoutingPeerResponse>>, ApiError> {
    let agent_id: AgentId = parse_id(&agent_id, "agent_id", &ctx)?;
    let peers = state
        .scheduler()
        .peers_on_agent(agent_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        peers.iter().map(RoutingPeerResponse::from).collect(),
    )))
}

async fn bind_peer(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
    Json(req): Json<BindPeerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_id: AgentId = parse_id(&agent_id, "agent_id", &ctx)?;
    let peer_id: PeerId = parse_id(&req.routingpeer_id, "routingpeer_id", &ctx)?;

    state
        .scheduler()
        .bind_peer_to_agent(agent_id, peer_id)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::CREATED,
        Json(PeerBindingResponse {
            agent_id: agent_id.to_string(),
            routingpeer_id: peer_id.to_string(),
        }),
    ))
}

async fn unbind_peer(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((agent_id, peer_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let agent_id: AgentId = parse_id(&agent_id, "agent_id", &ctx)?;
    let peer_id: PeerId = parse_id(&peer_id, "peer_id", &ctx)?;

    state
        .scheduler()
        .unbind_peer_from_agent(agent_id, peer_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_agent_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
) -> Result<Json<ListResponse<RoutingInstanceResponse>>, ApiError> {
    let agent_id: AgentId = parse_id(&agent_id, "agent_id", &ctx)?;
    let instances = state
        .store()
        .instances_on_agent(agent_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        instances.iter().map(RoutingInstanceResponse::from).collect(),
    )))
}
