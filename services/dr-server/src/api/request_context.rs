//! Per-request context extracted from headers.

use axum::{extract::FromRequestParts, http::request::Parts};
use dynroute_id::RequestId;
use std::convert::Infallible;

use crate::api::error::ApiError;

/// Request id taken from `x-request-id`, or freshly generated.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| RequestId::new().to_string());

        Ok(Self { request_id })
    }
}

impl RequestContext {
    /// Convert a domain error into an API error tagged with this request id.
    pub fn error(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }
}
