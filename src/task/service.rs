//! `TaskService` — CRUD/listing facade over [`TaskStore`] plus a
//! fire-and-forget background-task runner (SPEC_FULL.md §B.2, grounded on
//! `original_source/services/sniper/task_service.py`).
//!
//! The source keeps a plain `dict[str, asyncio.Task]` so `cancel_task` can
//! abort the coroutine driving an orchestrator, not just flip the stored
//! status; this is the same idea with a `JoinHandle` registry.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Task, TaskFilter, TaskStore, TaskStoreError};

pub struct TaskLogsPage {
    pub logs: Vec<Value>,
    pub has_more: bool,
}

/// Orchestrator-facing handle to a task store plus the registry of
/// in-flight background tasks it spawned.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    running: DashMap<Uuid, JoinHandle<()>>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            running: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn create_task(
        &self,
        source: &str,
        source_id: &str,
        task_type: &str,
    ) -> Result<Task, TaskStoreError> {
        self.store.create(source, source_id, task_type).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, TaskStoreError> {
        self.store.get(task_id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        self.store.list(filter).await
    }

    pub async fn get_task_logs(&self, task_id: Uuid, offset: usize) -> Result<TaskLogsPage, TaskStoreError> {
        let Some(task) = self.store.get(task_id).await? else {
            return Ok(TaskLogsPage {
                logs: Vec::new(),
                has_more: false,
            });
        };
        let total = task.logs.len();
        let tail: Vec<Value> = task
            .logs
            .into_iter()
            .skip(offset)
            .map(|l| serde_json::to_value(l).unwrap_or(Value::Null))
            .collect();
        let has_more = total > offset + tail.len();
        Ok(TaskLogsPage { logs: tail, has_more })
    }

    /// Cancels the background Tokio task driving `task_id` (if this
    /// instance spawned one) and persists the task as `cancelled`.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, TaskStoreError> {
        let Some(mut task) = self.store.get(task_id).await? else {
            return Ok(false);
        };
        if let Some((_, handle)) = self.running.remove(&task_id) {
            handle.abort();
        }
        if !task.status.is_terminal() {
            task.cancel();
            self.store.save(&task).await?;
        }
        Ok(true)
    }

    /// Spawns `fut` as the orchestrator driving `task`, tracking its
    /// `JoinHandle` so `cancel_task` can abort it. If `fut` returns an
    /// `Err` and the task is still non-terminal, it is marked `failed`.
    pub fn spawn<F>(self: &Arc<Self>, task_id: Uuid, fut: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::error!(task_id = %task_id, error = %err, "background task failed");
                if let Ok(Some(mut task)) = service.store.get(task_id).await {
                    if !task.status.is_terminal() {
                        task.fail(err.to_string(), None);
                        let _ = service.store.save(&task).await;
                    }
                }
            }
            service.running.remove(&task_id);
        });
        self.running.insert(task_id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::InMemoryTaskStore;

    #[tokio::test]
    async fn cancel_task_marks_cancelled_and_aborts_handle() {
        let service = Arc::new(TaskService::new(Arc::new(InMemoryTaskStore::new())));
        let task = service.create_task("system", "u1", "trend_analysis").await.unwrap();
        service.spawn(task.id, async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        });

        assert!(service.cancel_task(task.id).await.unwrap());
        let loaded = service.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "cancelled");
    }

    #[tokio::test]
    async fn background_failure_marks_task_failed() {
        let service = Arc::new(TaskService::new(Arc::new(InMemoryTaskStore::new())));
        let task = service.create_task("system", "u1", "trend_analysis").await.unwrap();
        {
            let mut t = task.clone();
            t.start();
            service.store().save(&t).await.unwrap();
        }
        service.spawn(task.id, async { Err(anyhow::anyhow!("boom")) });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let loaded = service.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "failed");
        assert_eq!(loaded.error.as_deref(), Some("boom"));
    }
}
