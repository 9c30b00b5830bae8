use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::storage::types::kg_task::TaskStatus;
use serde::Serialize;

/// Live view of one task, shared between the worker writing it and the
/// poll endpoint reading it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskProgress {
    pub progress: u8,
    pub status: TaskStatus,
    pub stage: String,
    pub message: String,
    pub kg_id: Option<String>,
}

impl TaskProgress {
    fn pending() -> Self {
        Self {
            progress: 0,
            status: TaskStatus::Pending,
            stage: "init".to_string(),
            message: "task submitted, waiting for a worker".to_string(),
            kg_id: None,
        }
    }
}

/// Process-wide progress map. The mutex guards plain map access only; no
/// await happens while it is held.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<Mutex<HashMap<String, TaskProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, task_id: &str) {
        let mut map = self.lock();
        map.insert(task_id.to_string(), TaskProgress::pending());
    }

    /// Applies an update and returns the effective entry. Progress is
    /// monotonic non-decreasing, and terminal states are sticky.
    pub fn record(
        &self,
        task_id: &str,
        progress: u8,
        status: TaskStatus,
        message: &str,
        stage: &str,
    ) -> TaskProgress {
        let mut map = self.lock();
        let entry = map
            .entry(task_id.to_string())
            .or_insert_with(TaskProgress::pending);

        if !entry.status.is_terminal() {
            entry.progress = entry.progress.max(progress.min(100));
            entry.status = status;
            entry.message = message.to_string();
            entry.stage = stage.to_string();
        }

        entry.clone()
    }

    pub fn set_kg_id(&self, task_id: &str, kg_id: &str) {
        let mut map = self.lock();
        if let Some(entry) = map.get_mut(task_id) {
            entry.kg_id = Some(kg_id.to_string());
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskProgress> {
        self.lock().get(task_id).cloned()
    }

    /// Terminal entries are dropped once the durable row holds the final
    /// state; polls fall through to the task row afterwards.
    pub fn remove(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskProgress>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
