//! Routing instance API endpoints.
//!
//! Instances are nested resources for their networks and hosting agents:
//! - /v1/routinginstances/{instance_id}/networks
//! - /v1/routinginstances/{instance_id}/agents

use std::net::IpAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dynroute_id::{AgentId, NetworkId, RoutingInstanceId, TenantId};
use dynroute_networking::{parse_peer_address, Cidr};
use serde::{Deserialize, Serialize};

use super::agents::AgentResponse;
use super::{nullable, parse_id, ListResponse};
use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::store::{NewRoutingInstance, RoutingInstance, RoutingInstanceUpdate};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_instances).post(create_instance))
        .route(
            "/{instance_id}",
            get(get_instance).put(update_instance).delete(delete_instance),
        )
        .route(
            "/{instance_id}/networks",
            get(list_networks).post(add_network),
        )
        .route(
            "/{instance_id}/networks/{network_id}",
            delete(remove_network),
        )
        .route(
            "/{instance_id}/agents",
            get(list_instance_agents).post(bind_agent),
        )
        .route("/{instance_id}/agents/{agent_id}", delete(unbind_agent))
}

// =============================================================================
// Request/Response Types
// =============================================================================

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateRoutingInstanceRequest {
    pub tenant_id: String,

    #[serde(default)]
    pub nexthop: Option<String>,

    #[serde(default = "default_true")]
    pub advertise: bool,

    #[serde(default)]
    pub discover: bool,

    /// Extra CIDRs advertised on top of the networks' subnets.
    #[serde(default)]
    pub advertise_routes: Vec<String>,
}

fn parse_nexthop(raw: Option<&str>, errors: &mut Vec<FieldError>) -> Option<IpAddr> {
    raw.and_then(|raw| match parse_peer_address(raw) {
        Ok(addr) => Some(addr),
        Err(e) => {
            errors.push(FieldError::new("nexthop", e.to_string()));
            None
        }
    })
}

fn parse_routes(raw: &[String], errors: &mut Vec<FieldError>) -> Vec<Cidr> {
    raw.iter()
        .enumerate()
        .filter_map(|(i, route)| match Cidr::from_cidr(route) {
            Ok(cidr) => Some(cidr),
            Err(e) => {
                errors.push(FieldError::new(
                    format!("advertise_routes[{i}]"),
                    e.to_string(),
                ));
                None
            }
        })
        .collect()
}

impl CreateRoutingInstanceRequest {
    fn validate(self) -> Result<NewRoutingInstance, Vec<FieldError>> {
        let mut errors = Vec::new();

        let tenant_id = match self.tenant_id.parse::<TenantId>() {
            Ok(id) => Some(id),
            Err(e) => {
                errors.push(FieldError::new("tenant_id", e.to_string()));
                None
            }
        };
        let nexthop = parse_nexthop(self.nexthop.as_deref(), &mut errors);
        let advertise_routes = parse_routes(&self.advertise_routes, &mut errors);

        match tenant_id {
            Some(tenant_id) if errors.is_empty() => Ok(NewRoutingInstance {
                tenant_id,
                nexthop,
                advertise: self.advertise,
                discover: self.discover,
                advertise_routes,
            }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoutingInstanceRequest {
    /// `null` removes the nexthop.
    #[serde(default, deserialize_with = "nullable")]
    pub nexthop: Option<Option<String>>,

    #[serde(default)]
    pub advertise: Option<bool>,

    #[serde(default)]
    pub discover: Option<bool>,

    /// Replaces the stored routes when present.
    #[serde(default)]
    pub advertise_routes: Option<Vec<String>>,
}

impl UpdateRoutingInstanceRequest {
    fn validate(self) -> Result<RoutingInstanceUpdate, Vec<FieldError>> {
        let mut errors = Vec::new();

        let nexthop = self
            .nexthop
            .map(|raw| parse_nexthop(raw.as_deref(), &mut errors));
        let advertise_routes = self
            .advertise_routes
            .as_deref()
            .map(|routes| parse_routes(routes, &mut errors));

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(RoutingInstanceUpdate {
            nexthop,
            advertise: self.advertise,
            discover: self.discover,
            advertise_routes,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RoutingInstanceResponse {
    pub id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nexthop: Option<String>,
    pub advertise: bool,
    pub discover: bool,
    pub advertise_routes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&RoutingInstance> for RoutingInstanceResponse {
    fn from(instance: &RoutingInstance) -> Self {
        Self {
            id: instance.id.to_string(),
            tenant_id: instance.tenant_id.to_string(),
            nexthop: instance.nexthop.map(|n| n.to_string()),
            advertise: instance.advertise,
            discover: instance.discover,
            advertise_routes: instance
                .advertise_routes
                .iter()
                .map(|r| r.to_string())
                .collect(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddNetworkRequest {
    pub network_id: String,
}

#[derive(Debug, Serialize)]
pub struct NetworkAssociationResponse {
    pub routinginstance_id: String,
    pub network_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BindAgentRequest {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct AgentBindingResponse {
    pub routinginstance_id: String,
    pub agent_id: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateRoutingInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new = req
        .validate()
        .map_err(|details| ctx.error(ApiError::validation(details)))?;

    let instance = state
        .scheduler()
        .create_instance(new)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::CREATED,
        Json(RoutingInstanceResponse::from(&instance)),
    ))
}

async fn list_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListResponse<RoutingInstanceResponse>>, ApiError> {
    let instances = state
        .store()
        .list_instances()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        instances.iter().map(RoutingInstanceResponse::from).collect(),
    )))
}

async fn get_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
) -> Result<Json<RoutingInstanceResponse>, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let instance = state
        .store()
        .get_instance(instance_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(RoutingInstanceResponse::from(&instance)))
}

async fn update_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
    Json(req): Json<UpdateRoutingInstanceRequest>,
) -> Result<Json<RoutingInstanceResponse>, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let update = req
        .validate()
        .map_err(|details| ctx.error(ApiError::validation(details)))?;

    let instance = state
        .scheduler()
        .update_instance(instance_id, update)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(RoutingInstanceResponse::from(&instance)))
}

async fn delete_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    state
        .scheduler()
        .delete_instance(instance_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_networks(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
) -> Result<Json<ListResponse<NetworkAssociationResponse>>, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let networks = state
        .scheduler()
        .list_networks(instance_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        networks
            .into_iter()
            .map(|network_id| NetworkAssociationResponse {
                routinginstance_id: instance_id.to_string(),
                network_id: network_id.to_string(),
            })
            .collect(),
    )))
}

async fn add_network(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
    Json(req): Json<AddNetworkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let network_id: NetworkId = parse_id(&req.network_id, "network_id", &ctx)?;

    state
        .scheduler()
        .add_network(instance_id, network_id)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::CREATED,
        Json(NetworkAssociationResponse {
            routinginstance_id: instance_id.to_string(),
            network_id: network_id.to_string(),
        }),
    ))
}

async fn remove_network(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((instance_id, network_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let network_id: NetworkId = parse_id(&network_id, "network_id", &ctx)?;

    state
        .scheduler()
        .remove_network(instance_id, network_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_instance_agents(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
) -> Result<Json<ListResponse<AgentResponse>>, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let scheduler = state.scheduler();
    let agents = scheduler
        .agents_on_instance(instance_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse::new(
        agents
            .iter()
            .map(|a| AgentResponse::new(a, scheduler.is_alive(a)))
            .collect(),
    )))
}

async fn bind_agent(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
    Json(req): Json<BindAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let agent_id: AgentId = parse_id(&req.agent_id, "agent_id", &ctx)?;

    state
        .scheduler()
        .bind_agent_to_instance(instance_id, agent_id)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::CREATED,
        Json(AgentBindingResponse {
            routinginstance_id: instance_id.to_string(),
            agent_id: agent_id.to_string(),
        }),
    ))
}

async fn unbind_agent(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((instance_id, agent_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let instance_id: RoutingInstanceId = parse_id(&instance_id, "instance_id", &ctx)?;
    let agent_id: AgentId = parse_id(&agent_id, "agent_id", &ctx)?;

    state
        .scheduler()
        .unbind_agent_from_instance(instance_id, agent_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_errors_carry_index() {
        let req = CreateRoutingInstanceRequest {
            tenant_id: TenantId::new().to_string(),
            nexthop: Some("192.0.2.1".to_string()),
            advertise: true,
            discover: false,
            advertise_routes: vec!["10.0.0.0/24".to_string(), "10.0.0.1/24".to_string()],
        };

        let errors = req.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "advertise_routes[1]");
    }

    #[test]
    fn test_update_without_routes_keeps_them() {
        let req = UpdateRoutingInstanceRequest {
            nexthop: None,
            advertise: Some(false),
            discover: None,
            advertise_routes: None,
        };
        let update = req.validate().unwrap();
        assert!(update.advertise_routes.is_none());
        assert_eq!(update.advertise, Some(false));
    }

    #[test]
    fn test_update_with_empty_routes_clears_them() {
        let req = UpdateRoutingInstanceRequest {
            nexthop: None,
            advertise: None,
            discover: None,
            advertise_routes: Some(Vec::new()),
        };
        assert_eq!(req.validate().unwrap().advertise_routes, Some(Vec::new()));
    }

    #[test]
    fn test_update_nexthop_null_clears_it() {
        let parse = |body: &str| {
            serde_json::from_str::<UpdateRoutingInstanceRequest>(body)
                .unwrap()
                .validate()
                .unwrap()
                .nexthop
        };

        assert_eq!(parse("{}"), None);
        assert_eq!(parse(r#"{"nexthop": null}"#), Some(None));
        assert_eq!(
            parse(r#"{"nexthop": "192.0.2.1"}"#),
            Some(Some("192.0.2.1".parse().unwrap()))
        );
    }
}
