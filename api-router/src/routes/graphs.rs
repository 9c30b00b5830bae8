use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use common::storage::types::build_request::GraphBuildRequest;
use common::storage::types::kg_task::KgTask;
use common::storage::types::knowledge_graph::KnowledgeGraph;
use kg_pipeline::graph_store::{GraphQuery, QueryEdge, QueryNode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::api_state::{ApiState, CallerId};
use crate::error::ApiError;

pub async fn create_graph(
    State(state): State<ApiState>,
    CallerId(user_id): CallerId,
    Json(request): Json<GraphBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.file_ids.is_empty() {
        return Err(ApiError::ValidationError(
            "select at least one file to build a knowledge graph".to_string(),
        ));
    }

    info!(%user_id, files = request.file_ids.len(), "graph build requested");
    let task_id = state.engine.submit(&user_id, request).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "task_id": task_id,
            "message": "knowledge graph build submitted"
        })),
    ))
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub task_id: String,
    pub progress: u8,
    pub status: String,
    pub stage: String,
    pub message: String,
    pub kg_id: Option<String>,
}

pub async fn graph_progress(
    State(state): State<ApiState>,
    CallerId(user_id): CallerId,
    Path(task_id): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let task = KgTask::fetch_owned(&task_id, &user_id, &state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("task not found".to_string()))?;

    let mut response = ProgressResponse {
        task_id: task.id,
        progress: task.progress,
        status: task.status.as_str().to_string(),
        stage: task.stage,
        message: task.message,
        kg_id: task.kg_id,
    };

    // a running job's freshest state lives in the progress map
    if !task.status.is_terminal() {
        if let Some(live) = state.engine.progress_snapshot(&response.task_id) {
            response.progress = live.progress;
            response.status = live.status.as_str().to_string();
            response.stage = live.stage;
            response.message = live.message;
            if live.kg_id.is_some() {
                response.kg_id = live.kg_id;
            }
        }
    }

    Ok(Json(response))
}

fn default_top_k() -> usize {
    100
}

fn default_include() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct GraphQueryRequest {
    pub kg_id: String,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_include")]
    pub include_entities: bool,
    #[serde(default = "default_include")]
    pub include_relations: bool,
}

#[derive(Debug, Serialize)]
pub struct GraphQueryResponse {
    pub entities: Vec<QueryNode>,
    pub relations: Vec<QueryEdge>,
    pub execution_time: f64,
    pub total: usize,
}

pub async fn query_graph(
    State(state): State<ApiState>,
    CallerId(user_id): CallerId,
    Json(request): Json<GraphQueryRequest>,
) -> Result<Json<GraphQueryResponse>, ApiError> {
    ensure_ownership(&state, &request.kg_id, &user_id).await?;

    let graph_query = match (&request.entity, &request.relation) {
        (Some(entity), _) if !entity.trim().is_empty() => GraphQuery::Entity(entity.clone()),
        (_, Some(relation)) if !relation.trim().is_empty() => {
            GraphQuery::Relation(relation.clone())
        }
        _ => GraphQuery::All {
            limit: request.top_k,
        },
    };

    let started = Instant::now();
    let result = state
        .graph
        .query(&user_id, &request.kg_id, &graph_query)
        .await?;
    let execution_time = started.elapsed().as_secs_f64();

    let entities = if request.include_entities {
        result.nodes
    } else {
        Vec::new()
    };
    let relations = if request.include_relations {
        result.edges
    } else {
        Vec::new()
    };

    let total = entities.len() + relations.len();
    Ok(Json(GraphQueryResponse {
        entities,
        relations,
        execution_time,
        total,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VisualizationParams {
    #[serde(default = "default_top_k")]
    pub limit: usize,
}

pub async fn visualize_graph(
    State(state): State<ApiState>,
    CallerId(user_id): CallerId,
    Path(kg_id): Path<String>,
    Query(params): Query<VisualizationParams>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_ownership(&state, &kg_id, &user_id).await?;

    let data = state.graph.visualize(&kg_id, params.limit).await?;
    Ok(Json(data))
}

pub async fn delete_graph(
    State(state): State<ApiState>,
    CallerId(user_id): CallerId,
    Path(kg_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let graph = KnowledgeGraph::fetch_owned(&kg_id, &user_id, &state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("knowledge graph not found".to_string()))?;

    state
        .graph
        .delete_graph(&user_id, &kg_id, graph.created_at)
        .await?;
    state
        .db
        .delete_item::<KnowledgeGraph>(&kg_id)
        .await
        .map_err(common::error::AppError::from)?;

    info!(%user_id, %kg_id, "knowledge graph deleted");
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_page_size")]
    pub limit: usize,
}

fn default_page_size() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct GraphSummary {
    pub kg_id: String,
    pub name: String,
    pub status: String,
    pub entity_count: u64,
    pub relation_count: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn list_graphs(
    State(state): State<ApiState>,
    CallerId(user_id): CallerId,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let graphs =
        KnowledgeGraph::list_for_user(&user_id, params.skip, params.limit, &state.db).await?;
    let total = KnowledgeGraph::count_for_user(&user_id, &state.db).await?;

    let summaries: Vec<GraphSummary> = graphs
        .into_iter()
        .map(|graph| GraphSummary {
            kg_id: graph.id,
            name: graph.name,
            status: format!("{:?}", graph.status).to_lowercase(),
            entity_count: graph.entity_count,
            relation_count: graph.relation_count,
            created_at: graph.created_at,
        })
        .collect();

    Ok(Json(json!({ "graphs": summaries, "total": total })))
}

async fn ensure_ownership(
    state: &ApiState,
    kg_id: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    let owned = KnowledgeGraph::verify_ownership(kg_id, user_id, &state.db).await?;
    if owned {
        Ok(())
    } else {
        Err(ApiError::NotFound("knowledge graph not found".to_string()))
    }
}
