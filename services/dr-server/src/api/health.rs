//! Health endpoints for process supervisors and load balancers.
//!
//! `/livez` and `/healthz` never touch the store; `/readyz` does.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "dr-server";

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct Health {
    pub service: String,
    pub version: String,
    /// `ok`, or `store_unavailable` when a readiness check fails.
    pub status: String,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

impl Health {
    fn new(status: &str) -> Self {
        Self {
            service: SERVICE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: status.to_string(),
            checked_at: Utc::now(),
            store_error: None,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

async fn healthz() -> Json<Health> {
    Json(Health::new("ok"))
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    match state.store().ping().await {
        Ok(()) => (StatusCode::OK, Json(Health::new("ok"))),
        Err(e) => {
            let mut health = Health::new("store_unavailable");
            health.store_error = Some(e.to_string());
            (StatusCode::SERVICE_UNAVAILABLE, Json(health))
        }
    }
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_reports_service() {
        let Json(health) = healthz().await;
        assert_eq!(health.service, "dr-server");
        assert_eq!(health.status, "ok");
        assert!(health.store_error.is_none());
    }

    #[test]
    fn test_store_error_omitted_when_healthy() {
        let json = serde_json::to_value(Health::new("ok")).unwrap();
        assert!(json.get("store_error").is_none());
        assert_eq!(json["service"], "dr-server");
    }
}
