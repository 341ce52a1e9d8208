//! Routing peer API endpoints.
//!
//! `/v1/routingpeers` manages BGP neighbors. Deleting a peer unbinds it
//! from every agent that was hosting it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use dynroute_id::{PeerId, TenantId};
use dynroute_networking::{parse_peer_address, AsNumber};
use serde::{Deserialize, Serialize};

use super::agents::AgentResponse;
use super::{nullable, parse_id, ListResponse};
use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::store::{NewRoutingPeer, RoutingPeer, RoutingPeerUpdate};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_peers).post(create_peer))
        .route(
            "/{peer_id}",
            get(get_peer).put(update_peer).delete(delete_peer),
        )
        .route("/{peer_id}/agents", get(list_peer_agents))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRoutingPeerRequest {
    pub tenant_id: String,

    /// IPv4 or IPv6 literal. Must be unique across all peers.
    pub peer_address: String,

    pub remote_as: i64,

    #[serde(default)]
    pub secret: Option<String>,

    /// Engine-specific settings, passed through to the agent untouched.
    #[serde(default)]
    pub extra_config: Option<serde_json::Value>,
}

impl CreateRoutingPeerRequest {
    fn validate(self) -> Result<NewRoutingPeer, Vec<FieldError>> {
        let mut errors = Vec::new();

        let tenant_id = self
            .tenant_id
            .parse::<TenantId>()
            .map_err(|e| errors.push(FieldError::new("tenant_id", e.to_string())))
            .ok();
        let peer_address = parse_peer_address(&self.peer_address)
            .map_err(|e| errors.push(FieldError::new("peer_address", e.to_string())))
            .ok();
        let remote_as = AsNumber::from_i64(self.remote_as)
            .map_err(|e| errors.push(FieldError::new("remote_as", e.to_string())))
            .ok();
        let extra_config = match self.extra_config {
            None => serde_json::json!({}),
            Some(value) if value.is_object() => value,
            Some(_) => {
                errors.push(FieldError::new("extra_config", "must be a JSON object"));
                serde_json::Value::Null
            }
        };

        match (tenant_id, peer_address, remote_as) {
            (Some(tenant_id), Some(peer_address), Some(remote_as)) if errors.is_empty() => {
                Ok(NewRoutingPeer {
                    tenant_id,
                    peer_address,
                    remote_as,
                    secret: self.secret.filter(|s| !s.is_empty()),
                    extra_config,
                })
            }
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoutingPeerRequest {
    /// Rejected when present; the address is the session key.
    #[serde(default)]
    pub peer_address: Option<String>,

    #[serde(default)]
    pub remote_as: Option<i64>,

    /// `null` or `""` removes the secret.
    #[serde(default, deserialize_with = "nullable")]
    pub secret: Option<Option<String>>,

    #[serde(default)]
    pub extra_config: Option<serde_json::Value>,
}

impl UpdateRoutingPeerRequest {
    fn validate(self) -> Result<RoutingPeerUpdate, Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.peer_address.is_some() {
            errors.push(FieldError::new("peer_address", "cannot be changed"));
        }

        let remote_as = match self.remote_as.map(AsNumber::from_i64).transpose() {
            Ok(remote_as) => remote_as,
            Err(e) => {
                errors.push(FieldError::new("remote_as", e.to_string()));
                None
            }
        };

        if matches!(&self.extra_config, Some(value) if !value.is_object()) {
            errors.push(FieldError::new("extra_config", "must be a JSON object"));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(RoutingPeerUpdate {
            remote_as,
            secret: self
                .secret
                .map(|secret| secret.filter(|s| !s.is_empty())),
            extra_config: self.extra_config,
        })
    }
}

/// A routing peer. The secret is never echoed back.
#[derive(Debug, Serialize)]
pub struct RoutingPeerResponse {
    pub id: String,
    pub tenant_id: String,
    pub peer_address: String,
    pub remote_as: u32,
    pub has_secret: bool,
    pub extra_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&RoutingPeer> for RoutingPeerResponse {
    fn from(peer: &RoutingPeer) -> Self {
        Self {
            id: peer.id.to_string(),
            tenant_id: peer.tenant_id.to_string(),
            peer_address: peer.peer_address.to_string(),
            remote_as: peer.remote_as.value(),
            has_secret: peer.secret.is_some(),
            extra_config: peer.extra_config.clone(),
            created_at: peer.created_at,
            updated_at: peer.updated_at,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_peer(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateRoutingPeerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new = req
        .validate()
        .map_err(|details| ctx.error(ApiError::validation(details)))?;

    let peer = state
        .scheduler()
        .create_peer(new)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((StatusCode::CREATED, Json(RoutingPeerResponse::from(&peer))))
}

async fn list_peers(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListResponse<RoutingPeerResponse>>, ApiError> {
    let peers = state.store().list_peers().await.map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        peers.iter().map(RoutingPeerResponse::from).collect(),
    )))
}

async fn get_peer(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(peer_id): Path<String>,
) -> Result<Json<RoutingPeerResponse>, ApiError> {
    let peer_id: PeerId = parse_id(&peer_id, "peer_id", &ctx)?;
    let peer = state
        .store()
        .get_peer(peer_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(RoutingPeerResponse::from(&peer)))
}

async fn update_peer(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(peer_id): Path<String>,
    Json(req): Json<UpdateRoutingPeerRequest>,
) -> Result<Json<RoutingPeerResponse>, ApiError> {
    let peer_id: PeerId = parse_id(&peer_id, "peer_id", &ctx)?;
    let update = req
        .validate()
        .map_err(|details| ctx.error(ApiError::validation(details)))?;

    let peer = state
        .scheduler()
        .update_peer(peer_id, update)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(RoutingPeerResponse::from(&peer)))
}

async fn delete_peer(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(peer_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let peer_id: PeerId = parse_id(&peer_id, "peer_id", &ctx)?;
    state
        .scheduler()
        .delete_peer(peer_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_peer_agents(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(peer_id): Path<String>,
) -> Result<Json<ListResponse<AgentResponse>>, ApiError> {
    let peer_id: PeerId = parse_id(&peer_id, "peer_id", &ctx)?;
    let scheduler = state.scheduler();
    let agents = scheduler
        .agents_hosting_peer(peer_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        agents
            .iter()
            .map(|a| AgentResponse::new(a, scheduler.is_alive(a)))
            .collect(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request(peer_address: &str, remote_as: i64) -> CreateRoutingPeerRequest {
        CreateRoutingPeerRequest {
            tenant_id: TenantId::new().to_string(),
            peer_address: peer_address.to_string(),
            remote_as,
            secret: None,
            extra_config: None,
        }
    }

    #[test]
    fn test_create_validation_collects_every_field() {
        let mut req = create_request("not-an-ip", 0);
        req.tenant_id = "bogus".to_string();

        let errors = req.validate().unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["tenant_id", "peer_address", "remote_as"]);
    }

    #[test]
    fn test_create_validation_accepts_ipv6() {
        let new = create_request("2001:db8::1", 4_200_000_000).validate().unwrap();
        assert_eq!(new.peer_address.to_string(), "2001:db8::1");
        assert_eq!(new.remote_as.value(), 4_200_000_000);
        assert!(new.extra_config.is_object());
    }

    #[test]
    fn test_update_rejects_address_change() {
        let req = UpdateRoutingPeerRequest {
            peer_address: Some("192.0.2.9".to_string()),
            remote_as: None,
            secret: None,
            extra_config: None,
        };
        let errors = req.validate().unwrap_err();
        assert_eq!(errors[0].field, "peer_address");
    }

    #[test]
    fn test_update_secret_is_tri_state() {
        let parse = |body: &str| {
            serde_json::from_str::<UpdateRoutingPeerRequest>(body)
                .unwrap()
                .validate()
                .unwrap()
                .secret
        };

        assert_eq!(parse("{}"), None);
        assert_eq!(parse(r#"{"secret": null}"#), Some(None));
        assert_eq!(parse(r#"{"secret": ""}"#), Some(None));
        assert_eq!(
            parse(r#"{"secret": "s3cret"}"#),
            Some(Some("s3cret".to_string()))
        );
    }
}
