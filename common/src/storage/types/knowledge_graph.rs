use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    Processing,
    Completed,
    Failed,
}

stored_object!(KnowledgeGraph, "knowledge_graph", {
    user_id: String,
    name: String,
    description: String,
    status: GraphStatus,
    entity_count: u64,
    relation_count: u64,
    file_ids: Vec<String>,
    progress: u8,
    build_message: String
});

impl KnowledgeGraph {
    /// Creates the graph header as the pipeline enters persistence. Counts
    /// are final at this point; status flips to completed with the task.
    pub fn new(
        user_id: String,
        name: Option<String>,
        file_ids: Vec<String>,
        entity_count: u64,
        relation_count: u64,
    ) -> Self {
        let now = Utc::now();
        let name = name.unwrap_or_else(|| format!("知识图谱_{}", now.format("%Y%m%d%H%M")));
        let description = if file_ids.is_empty() {
            "no source files".to_string()
        } else {
            let shown: Vec<&str> = file_ids.iter().take(3).map(String::as_str).collect();
            format!("built from files {}...", shown.join(","))
        };

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            name,
            description,
            status: GraphStatus::Processing,
            entity_count,
            relation_count,
            file_ids,
            progress: 80,
            build_message: "persisting entities and relations".to_string(),
        }
    }

    pub async fn create_and_store(self, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.store_item(self.clone()).await?;
        Ok(self)
    }

    pub async fn mark_completed(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        Self::record_build_state(id, GraphStatus::Completed, 100, "build completed", db).await
    }

    pub async fn record_build_state(
        id: &str,
        status: GraphStatus,
        progress: u8,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _graph: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace("/progress", progress))
            .patch(PatchOp::replace("/build_message", message.to_string()))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    /// True when the graph exists and belongs to the user. Read paths must
    /// check this before touching the graph store.
    pub async fn verify_ownership(
        kg_id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<bool, AppError> {
        let graph: Option<Self> = db.get_item(kg_id).await?;

        Ok(graph.is_some_and(|g| g.user_id == user_id))
    }

    pub async fn fetch_owned(
        kg_id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let graph: Option<Self> = db.get_item(kg_id).await?;

        Ok(graph.filter(|g| g.user_id == user_id))
    }

    pub async fn count_for_user(user_id: &str, db: &SurrealDbClient) -> Result<usize, AppError> {
        #[derive(serde::Deserialize)]
        struct Row {
            count: usize,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM type::table($table)
                 WHERE user_id = $user_id GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        Ok(rows.first().map_or(0, |r| r.count))
    }

    /// Paged catalog of a user's graphs, newest first.
    pub async fn list_for_user(
        user_id: &str,
        skip: usize,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let graphs: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE user_id = $user_id
                 ORDER BY created_at DESC
                 LIMIT $limit START $skip",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .bind(("limit", limit))
            .bind(("skip", skip))
            .await?
            .take(0)?;

        Ok(graphs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    fn sample_graph(user_id: &str) -> KnowledgeGraph {
        KnowledgeGraph::new(
            user_id.to_string(),
            Some("graph".to_string()),
            vec!["f1".to_string()],
            4,
            2,
        )
    }

    #[tokio::test]
    async fn test_new_graph_defaults() {
        let graph = KnowledgeGraph::new("user1".to_string(), None, vec![], 0, 0);

        assert_eq!(graph.status, GraphStatus::Processing);
        assert!(graph.name.starts_with("知识图谱_"));
        assert_eq!(graph.description, "no source files");
    }

    #[tokio::test]
    async fn test_mark_completed() {
        let db = setup_db().await;
        let graph = sample_graph("user1").create_and_store(&db).await.expect("store graph");

        KnowledgeGraph::mark_completed(&graph.id, &db)
            .await
            .expect("mark completed");

        let stored: KnowledgeGraph = db
            .get_item(&graph.id)
            .await
            .expect("fetch graph")
            .expect("graph exists");
        assert_eq!(stored.status, GraphStatus::Completed);
        assert_eq!(stored.progress, 100);
    }

    #[tokio::test]
    async fn test_ownership_check() {
        let db = setup_db().await;
        let graph = sample_graph("owner").create_and_store(&db).await.expect("store graph");

        assert!(KnowledgeGraph::verify_ownership(&graph.id, "owner", &db)
            .await
            .expect("verify"));
        assert!(!KnowledgeGraph::verify_ownership(&graph.id, "intruder", &db)
            .await
            .expect("verify"));
        assert!(!KnowledgeGraph::verify_ownership("missing", "owner", &db)
            .await
            .expect("verify"));
    }

    #[tokio::test]
    async fn test_list_for_user_is_scoped() {
        let db = setup_db().await;
        sample_graph("a").create_and_store(&db).await.expect("store");
        sample_graph("a").create_and_store(&db).await.expect("store");
        sample_graph("b").create_and_store(&db).await.expect("store");

        let graphs = KnowledgeGraph::list_for_user("a", 0, 10, &db)
            .await
            .expect("list graphs");
        assert_eq!(graphs.len(), 2);
        assert!(graphs.iter().all(|g| g.user_id == "a"));

        assert_eq!(
            KnowledgeGraph::count_for_user("a", &db).await.expect("count"),
            2
        );
        assert_eq!(
            KnowledgeGraph::count_for_user("nobody", &db)
                .await
                .expect("count"),
            0
        );
    }
}
