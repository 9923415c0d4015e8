//! Durable task persistence (spec §4.B, §6 "Persisted task layout").
//!
//! The original system persists `Task` in a relational table via Tortoise
//! ORM (`original_source/models/task.py`); this crate uses an embedded
//! SQLite database (`rusqlite`, bundled) so the service stays
//! self-contained without an external Postgres dependency, while keeping
//! the same column shape and the indexes spec §6 names:
//! `(source_id, status)`, `(task_type, status)`, `(created_at)`.
//!
//! Log writes within one task must be serialized (spec §4.B); each
//! `save()` call takes an exclusive connection lock and writes the whole
//! row, which trivially satisfies that requirement at the cost of not
//! supporting cross-task write parallelism on the same connection — an
//! acceptable tradeoff given spec §4.B's own "write volume is low" note
//! (spec §9, "Task as persistent actor").

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

use super::{StepLog, Task, TaskStatus};

#[derive(Error, Debug)]
pub enum TaskStoreError {
    #[error("task store error: {0}")]
    Storage(String),
    #[error("task not found: {0}")]
    NotFound(Uuid),
}

impl From<rusqlite::Error> for TaskStoreError {
    fn from(err: rusqlite::Error) -> Self {
        TaskStoreError::Storage(err.to_string())
    }
}

#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub source_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: usize,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, source: &str, source_id: &str, task_type: &str) -> Result<Task, TaskStoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Task>, TaskStoreError>;
    async fn save(&self, task: &Task) -> Result<(), TaskStoreError>;
    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError>;
    async fn list_running(&self) -> Result<Vec<Task>, TaskStoreError>;
}

/// SQLite-backed [`TaskStore`].
pub struct SqliteTaskStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn open(path: &str) -> Result<Self, TaskStoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, TaskStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), TaskStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                source_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL,
                result TEXT,
                error TEXT,
                logs TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                timeout_config INTEGER NOT NULL DEFAULT 600
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_source_status ON tasks (source_id, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_type_status ON tasks (task_type, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks (created_at);
            "#,
        )?;
        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let id: String = row.get("id")?;
        let status: String = row.get("status")?;
        let result: Option<String> = row.get("result")?;
        let logs: String = row.get("logs")?;
        let created_at: String = row.get("created_at")?;
        let started_at: Option<String> = row.get("started_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;

        Ok(Task {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            source: row.get("source")?,
            source_id: row.get("source_id")?,
            task_type: row.get("task_type")?,
            status: status.parse().unwrap_or(TaskStatus::Failed),
            progress: row.get("progress")?,
            result: result.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get("error")?,
            logs: serde_json::from_str::<Vec<StepLog>>(&logs).unwrap_or_default(),
            created_at: parse_rfc3339(&created_at),
            started_at: started_at.as_deref().map(parse_rfc3339),
            completed_at: completed_at.as_deref().map(parse_rfc3339),
            timeout_config: row.get("timeout_config")?,
        })
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, source: &str, source_id: &str, task_type: &str) -> Result<Task, TaskStoreError> {
        let task = Task::new(source, source_id, task_type);
        self.save(&task).await?;
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, TaskStoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("task store mutex poisoned");
            conn.query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_task,
            )
            .optional()
            .map_err(TaskStoreError::from)
        })
        .await
        .map_err(|e| TaskStoreError::Storage(e.to_string()))?
    }

    async fn save(&self, task: &Task) -> Result<(), TaskStoreError> {
        let conn = self.conn.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("task store mutex poisoned");
            conn.execute(
                r#"
                INSERT INTO tasks (id, source, source_id, task_type, status, progress, result, error, logs, created_at, started_at, completed_at, timeout_config)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    progress = excluded.progress,
                    result = excluded.result,
                    error = excluded.error,
                    logs = excluded.logs,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    timeout_config = excluded.timeout_config
                "#,
                params![
                    task.id.to_string(),
                    task.source,
                    task.source_id,
                    task.task_type,
                    task.status.as_str(),
                    task.progress,
                    task.result.as_ref().map(|v| v.to_string()),
                    task.error,
                    serde_json::to_string(&task.logs).unwrap_or_default(),
                    task.created_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                    task.timeout_config,
                ],
            )?;
            Ok::<(), TaskStoreError>(())
        })
        .await
        .map_err(|e| TaskStoreError::Storage(e.to_string()))?
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("task store mutex poisoned");
            let mut sql = "SELECT * FROM tasks WHERE 1=1".to_string();
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(source_id) = &filter.source_id {
                sql.push_str(" AND source_id = ?");
                binds.push(Box::new(source_id.clone()));
            }
            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                binds.push(Box::new(status.as_str().to_string()));
            }
            if let Some(task_type) = &filter.task_type {
                sql.push_str(" AND task_type = ?");
                binds.push(Box::new(task_type.clone()));
            }
            sql.push_str(" ORDER BY created_at DESC");
            let limit = if filter.limit == 0 { 20 } else { filter.limit };
            sql.push_str(" LIMIT ?");
            binds.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params.as_slice(), Self::row_to_task)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok::<Vec<Task>, TaskStoreError>(out)
        })
        .await
        .map_err(|e| TaskStoreError::Storage(e.to_string()))?
    }

    async fn list_running(&self) -> Result<Vec<Task>, TaskStoreError> {
        self.list(TaskFilter {
            status: Some(TaskStatus::Running),
            limit: usize::MAX.min(10_000),
            ..Default::default()
        })
        .await
    }
}

/// In-memory [`TaskStore`] for unit tests.
#[derive(Default, Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<StdMutex<std::collections::HashMap<Uuid, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, source: &str, source_id: &str, task_type: &str) -> Result<Task, TaskStoreError> {
        let task = Task::new(source, source_id, task_type);
        self.tasks.lock().unwrap().insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn save(&self, task: &Task) -> Result<(), TaskStoreError> {
        self.tasks.lock().unwrap().insert(task.id, task.clone());
        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.tasks.lock().unwrap();
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| filter.source_id.as_deref().is_none_or(|s| s == t.source_id))
            .filter(|t| filter.status.is_none_or(|s| s == t.status))
            .filter(|t| filter.task_type.as_deref().is_none_or(|s| s == t.task_type))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = if filter.limit == 0 { 20 } else { filter.limit };
        out.truncate(limit);
        Ok(out)
    }

    async fn list_running(&self) -> Result<Vec<Task>, TaskStoreError> {
        self.list(TaskFilter {
            status: Some(TaskStatus::Running),
            limit: 10_000,
            ..Default::default()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_store_round_trips_a_task() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = store.create("system", "u1", "trend_analysis").await.unwrap();
        task.start();
        task.log_step(0, "init", Default::default(), Default::default(), "completed");
        store.save(&task).await.unwrap();

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.logs.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut a = store.create("system", "u1", "login").await.unwrap();
        a.start();
        a.complete(serde_json::json!({}));
        store.save(&a).await.unwrap();
        let b = store.create("system", "u1", "login").await.unwrap();

        let running = store
            .list(TaskFilter {
                status: Some(TaskStatus::Pending),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);
    }
}
