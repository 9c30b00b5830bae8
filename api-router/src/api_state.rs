use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common::storage::db::SurrealDbClient;
use kg_pipeline::graph_store::GraphReader;
use kg_pipeline::JobEngine;

use crate::error::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub engine: Arc<JobEngine>,
    pub graph: Arc<dyn GraphReader>,
}

/// The caller identity resolved by the fronting auth layer; this service
/// only consumes the forwarded user id header.
pub struct CallerId(pub String);

impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
            .map(|value| Self(value.to_string()))
            .ok_or_else(|| ApiError::Unauthorized("missing x-user-id header".to_string()))
    }
}
