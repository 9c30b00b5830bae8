use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::build_request::GraphBuildRequest;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    KgCreate,
}

stored_object!(KgTask, "kg_task", {
    user_id: String,
    kind: TaskKind,
    status: TaskStatus,
    progress: u8,
    stage: String,
    message: String,
    file_ids: Vec<String>,
    algorithms: GraphBuildRequest,
    kg_id: Option<String>
});

impl KgTask {
    pub fn new(user_id: String, request: GraphBuildRequest) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            kind: TaskKind::KgCreate,
            status: TaskStatus::Pending,
            progress: 0,
            stage: "init".to_string(),
            message: "task submitted, waiting for a worker".to_string(),
            file_ids: request.file_ids.clone(),
            algorithms: request,
            kg_id: None,
        }
    }

    /// Creates the task row before the job is queued so a client polling
    /// immediately after submit always finds a durable record.
    pub async fn create_and_store(
        user_id: String,
        request: GraphBuildRequest,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let task = Self::new(user_id, request);
        db.store_item(task.clone()).await?;

        Ok(task)
    }

    /// Mirror a progress report into the durable row.
    pub async fn record_progress(
        id: &str,
        progress: u8,
        status: TaskStatus,
        message: &str,
        stage: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _task: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/progress", progress))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace("/message", message.to_string()))
            .patch(PatchOp::replace("/stage", stage.to_string()))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    pub async fn record_kg_id(id: &str, kg_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _task: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/kg_id", Some(kg_id.to_string())))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    /// Fetch a task only when it belongs to the given user.
    pub async fn fetch_owned(
        id: &str,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let task: Option<Self> = db.get_item(id).await?;

        Ok(task.filter(|t| t.user_id == user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::build_request::GraphBuildRequest;

    fn build_request(file_ids: &[&str]) -> GraphBuildRequest {
        GraphBuildRequest {
            file_ids: file_ids.iter().map(ToString::to_string).collect(),
            kg_name: None,
            algorithms: Default::default(),
            model_api_key: None,
            enable_completion: false,
            enable_visualization: false,
        }
    }

    async fn setup_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn test_new_task_starts_pending() {
        let task = KgTask::new("user123".to_string(), build_request(&["f1", "f2"]));

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.file_ids, vec!["f1", "f2"]);
        assert!(task.kg_id.is_none());
        assert!(!task.id.is_empty());
    }

    #[tokio::test]
    async fn test_record_progress_updates_row() {
        let db = setup_db().await;
        let task = KgTask::create_and_store("user123".to_string(), build_request(&["f1"]), &db)
            .await
            .expect("create task");

        KgTask::record_progress(
            &task.id,
            40,
            TaskStatus::Processing,
            "entity extraction finished",
            "extract_entities",
            &db,
        )
        .await
        .expect("record progress");

        let stored: KgTask = db
            .get_item(&task.id)
            .await
            .expect("fetch task")
            .expect("task exists");
        assert_eq!(stored.progress, 40);
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.stage, "extract_entities");
    }

    #[tokio::test]
    async fn test_record_kg_id() {
        let db = setup_db().await;
        let task = KgTask::create_and_store("user123".to_string(), build_request(&["f1"]), &db)
            .await
            .expect("create task");

        KgTask::record_kg_id(&task.id, "kg-42", &db)
            .await
            .expect("record kg id");

        let stored: KgTask = db
            .get_item(&task.id)
            .await
            .expect("fetch task")
            .expect("task exists");
        assert_eq!(stored.kg_id.as_deref(), Some("kg-42"));
    }

    #[tokio::test]
    async fn test_fetch_owned_hides_other_users_tasks() {
        let db = setup_db().await;
        let task = KgTask::create_and_store("owner".to_string(), build_request(&["f1"]), &db)
            .await
            .expect("create task");

        let found = KgTask::fetch_owned(&task.id, "owner", &db)
            .await
            .expect("fetch owned");
        assert!(found.is_some());

        let hidden = KgTask::fetch_owned(&task.id, "intruder", &db)
            .await
            .expect("fetch owned");
        assert!(hidden.is_none());
    }
}
