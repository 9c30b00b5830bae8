use std::path::Path;
use std::sync::Arc;

use api_router::api_state::ApiState;
use common::graph::GraphClient;
use common::storage::db::SurrealDbClient;
use common::utils::config::get_config;
use kg_pipeline::graph_store::{GraphReader, GraphStore};
use kg_pipeline::JobEngine;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    tokio::fs::create_dir_all(Path::new(&config.upload_dir)).await?;
    tokio::fs::create_dir_all(Path::new(&config.temp_dir)).await?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let graph_client =
        GraphClient::connect(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
            .await?;
    let graph_store = Arc::new(GraphStore::new(graph_client));

    let engine = Arc::new(JobEngine::start(
        Arc::clone(&db),
        Arc::clone(&graph_store) as _,
        config.clone(),
    ));

    let state = ApiState {
        db,
        engine: Arc::clone(&engine),
        graph: Arc::clone(&graph_store) as Arc<dyn GraphReader>,
    };
    let app = api_router::api_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!(port = config.http_port, "knowledge graph service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown().await;
    info!("shutdown complete");

    Ok(())
}
