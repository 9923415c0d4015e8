//! Task state machine & step log (spec §3, §4.B).
//!
//! Grounded on `original_source/models/task.py` (`Task`, `TaskStatus`,
//! `to_agent_readable`, `get_result_text`, `get_logs_summary`): the Rust
//! [`Task`] type below is a field-for-field, method-for-method port, with
//! the mutation methods (`start`/`complete`/...) made pure (they return
//! `Self` mutated in place and the caller persists via [`store::TaskStore`])
//! rather than each doing its own I/O, since Rust has no implicit
//! save-on-mutate ORM the way the source's Tortoise models do.

pub mod service;
pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use service::TaskService;
pub use store::{InMemoryTaskStore, SqliteTaskStore, TaskStore, TaskStoreError};

/// Task status (spec §3, §4.3). Transitions are enforced by the
/// constructors below, not by the enum itself — see the DAG in spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    WaitingLogin,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::WaitingLogin => "waiting_login",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "waiting_login" => Ok(TaskStatus::WaitingLogin),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One entry in a task's append-only step log (spec §3 StepLog).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    pub step: i32,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub input: HashMap<String, Value>,
    #[serde(default)]
    pub output: HashMap<String, Value>,
    pub status: String,
}

/// Durable task entity (spec §3 Task).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub source: String,
    pub source_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub progress: i32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<StepLog>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Deadline in seconds from `started_at`, past which the sweeper
    /// (spec §4.G) fails the task (`now - started_at > task.timeout_config`).
    /// Defaults to the process-wide setting; orchestrators may override it
    /// per task type before the first `start()`.
    pub timeout_config: i64,
}

impl Task {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            source_id: source_id.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            logs: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_config: crate::config::Settings::global().task_timeout.as_secs() as i64,
        }
    }

    /// `pending -> running`.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// `running -> waiting_login`. `info` is folded into `result` under a
    /// `login_required` marker per spec §4.B.
    pub fn waiting_login(&mut self, info: Value) {
        self.status = TaskStatus::WaitingLogin;
        let mut merged = match info {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("info".to_string(), other);
                map
            }
        };
        merged.insert("login_required".to_string(), Value::Bool(true));
        self.result = Some(Value::Object(merged));
    }

    /// `-> completed`, `progress = 100`.
    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// `-> failed`. `progress`, if given, overrides the current value
    /// (spec §4.B `fail(task, error, progress?)`); otherwise progress is
    /// preserved as-is.
    pub fn fail(&mut self, error: impl Into<String>, progress: Option<i32>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        if let Some(p) = progress {
            self.progress = p;
        }
        self.completed_at = Some(Utc::now());
    }

    /// `-> cancelled`.
    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Append a step log entry, or update the most recent entry carrying
    /// the same `step` number in place (spec §3 "storage may coalesce
    /// updates to the same step number").
    pub fn log_step(
        &mut self,
        step: i32,
        name: impl Into<String>,
        input: HashMap<String, Value>,
        output: HashMap<String, Value>,
        status: impl Into<String>,
    ) {
        let name = name.into();
        let status = status.into();
        if let Some(existing) = self
            .logs
            .iter_mut()
            .rev()
            .find(|l| l.step == step && l.name == name)
        {
            existing.timestamp = Utc::now();
            existing.input = input;
            existing.output = output;
            existing.status = status;
        } else {
            self.logs.push(StepLog {
                step,
                name,
                timestamp: Utc::now(),
                input,
                output,
                status,
            });
        }
    }

    /// Plain-text view over `result` (`original_source` `get_result_text`).
    pub fn result_text(&self) -> String {
        match &self.result {
            None => "no result yet".to_string(),
            Some(Value::Object(map)) => {
                if let Some(Value::String(s)) = map.get("analysis") {
                    s.clone()
                } else if let Some(Value::String(s)) = map.get("report") {
                    s.clone()
                } else {
                    map.iter()
                        .map(|(k, v)| format!("{k}: {v}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Some(other) => other.to_string(),
        }
    }

    /// Plain-text log digest (`original_source` `get_logs_summary`).
    pub fn logs_summary(&self) -> String {
        if self.logs.is_empty() {
            return "no steps recorded yet".to_string();
        }
        let mut lines = vec![format!("{} step(s) recorded:", self.logs.len())];
        for log in &self.logs {
            lines.push(format!(
                "  step {}: {} ({})",
                log.step, log.name, log.status
            ));
        }
        lines.join("\n")
    }

    fn next_step_hint(&self) -> String {
        match self.status {
            TaskStatus::Pending => "task awaits a worker pickup".to_string(),
            TaskStatus::Running => {
                let done = self.logs.iter().filter(|l| l.status == "completed").count();
                format!(
                    "task is running, {done} step(s) completed, progress {}%",
                    self.progress
                )
            }
            TaskStatus::WaitingLogin => {
                "task awaits login, complete platform login to continue".to_string()
            }
            TaskStatus::Completed => "task completed, result is available".to_string(),
            TaskStatus::Failed => format!(
                "task failed: {}, inspect the logs for detail",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            TaskStatus::Cancelled => "task was cancelled".to_string(),
        }
    }

    fn summary(&self) -> String {
        let mut parts = vec![
            format!("task type: {}", self.task_type),
            format!("status: {}", self.status.as_str()),
            format!("progress: {}%", self.progress),
        ];
        if let Some(err) = &self.error {
            parts.push(format!("error: {err}"));
        }
        if !self.logs.is_empty() {
            let mut log_summary = format!("{} step(s) executed:", self.logs.len());
            for log in &self.logs {
                log_summary.push_str(&format!("\n  - step {}: {} ({})", log.step, log.name, log.status));
            }
            parts.push(log_summary);
        }
        if let Some(result) = &self.result {
            let text = result.to_string();
            let head: String = text.chars().take(100).collect();
            parts.push(format!("result: {head}"));
        }
        parts.join("\n")
    }

    /// AI-readable rendering of the task (spec §4.B `to_agent_readable`).
    pub fn to_agent_readable(&self) -> Value {
        serde_json::json!({
            "task_id": self.id.to_string(),
            "task_type": self.task_type,
            "status": self.status.as_str(),
            "progress": self.progress,
            "summary": self.summary(),
            "logs": self.logs,
            "result": self.result,
            "error": self.error,
            "created_at": self.created_at.to_rfc3339(),
            "started_at": self.started_at.map(|t| t.to_rfc3339()),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "next_step_hint": self.next_step_hint(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic_while_non_terminal() {
        let mut t = Task::new("system", "u1", "trend_analysis");
        t.start();
        t.progress = 10;
        t.progress = 50;
        assert!(t.progress >= 10);
        assert!(!t.status.is_terminal());
    }

    #[test]
    fn terminal_states_set_completed_at() {
        let mut t = Task::new("system", "u1", "trend_analysis");
        t.start();
        t.complete(serde_json::json!({"report": "ok"}));
        assert!(t.status.is_terminal());
        assert!(t.completed_at.is_some());
        assert_eq!(t.progress, 100);
    }

    #[test]
    fn waiting_login_marks_result() {
        let mut t = Task::new("system", "u1", "trend_analysis");
        t.start();
        t.waiting_login(serde_json::json!({"resource_url": "https://example/qr"}));
        assert_eq!(t.status, TaskStatus::WaitingLogin);
        let result = t.result.unwrap();
        assert_eq!(result["login_required"], Value::Bool(true));
        assert_eq!(result["resource_url"], "https://example/qr");
    }

    #[test]
    fn log_step_coalesces_same_step_and_name() {
        let mut t = Task::new("system", "u1", "creator_monitor");
        t.log_step(1, "harvest", HashMap::new(), HashMap::new(), "running");
        t.log_step(1, "harvest", HashMap::new(), HashMap::new(), "completed");
        assert_eq!(t.logs.len(), 1);
        assert_eq!(t.logs[0].status, "completed");
    }

    #[test]
    fn next_step_hint_reflects_status() {
        let mut t = Task::new("system", "u1", "login");
        t.start();
        t.waiting_login(serde_json::json!({}));
        assert!(t.next_step_hint().contains("awaits login"));
    }
}
