//! API v1 routes.

mod agent_sync;
mod agents;
mod routing_instances;
mod routing_peers;

use std::str::FromStr;

use axum::Router;
use dynroute_id::IdError;
use serde::{Deserialize, Deserializer, Serialize};

use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/routingpeers", routing_peers::routes())
        .nest("/routinginstances", routing_instances::routes())
        .nest("/agents", agents::routes())
        // Called by agents, not operators
        .nest("/agent-sync", agent_sync::routes())
}

/// Response for list endpoints.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

impl<T> ListResponse<T> {
    fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

/// Tells an explicit `null` (`Some(None)`) apart from an absent field
/// (`None`, via `#[serde(default)]`).
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Parse a typed id from a path segment or body field.
fn parse_id<T>(raw: &str, field: &str, ctx: &RequestContext) -> Result<T, ApiError>
where
    T: FromStr<Err = IdError>,
{
    raw.parse().map_err(|e: IdError| {
        ApiError::bad_request("invalid_id", format!("invalid {field}: {e}"))
            .with_details(vec![FieldError::new(field, e.to_string())])
            .with_request_id(ctx.request_id.clone())
    })
}
