#![allow(clippy::missing_docs_in_private_items)]

pub mod api_state;
pub mod error;
pub mod routes;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::api_state::ApiState;

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/graphs", post(routes::graphs::create_graph))
        .route("/api/v1/graphs", get(routes::graphs::list_graphs))
        .route(
            "/api/v1/graphs/progress/{task_id}",
            get(routes::graphs::graph_progress),
        )
        .route("/api/v1/graphs/query", post(routes::graphs::query_graph))
        .route(
            "/api/v1/graphs/{kg_id}/visualization",
            get(routes::graphs::visualize_graph),
        )
        .route("/api/v1/graphs/{kg_id}", delete(routes::graphs::delete_graph))
        .with_state(state)
}
