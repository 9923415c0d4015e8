//! Task timeout sweeper (spec §4.G): a periodic job that fails any
//! `Running`/`WaitingLogin` task that has overrun its own
//! `timeout_config`, so a crashed or wedged orchestrator doesn't leave a
//! task stuck forever.
//!
//! Grounded on `original_source/services/sniper/task_timeout_checker.py`:
//! the 60s poll period and the `task_timeout_checker:lock` election lock
//! (so that running multiple instances of this service doesn't double-fail
//! the same task) are ported directly from there, reusing
//! [`crate::store::LockStore`] rather than the source's own ad hoc Redis
//! client.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::store::LockStore;
use crate::task::{Task, TaskStore};

const SWEEP_PERIOD: Duration = Duration::from_secs(60);
const ELECTION_LOCK_KEY: &str = "task_timeout_checker";
const ELECTION_LOCK_TTL: Duration = Duration::from_secs(70);

/// Periodic background sweeper (spec §4.G, testable property 10:
/// "idempotent under concurrent sweeper instances").
pub struct TaskSweeper {
    lock_store: Arc<dyn LockStore>,
    task_store: Arc<dyn TaskStore>,
    owner_token: String,
}

impl TaskSweeper {
    pub fn new(lock_store: Arc<dyn LockStore>, task_store: Arc<dyn TaskStore>) -> Self {
        Self {
            lock_store,
            task_store,
            owner_token: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Runs the sweep loop until cancelled. Intended to be driven by a
    /// dedicated `tokio::spawn`'d task for the lifetime of the process.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(SWEEP_PERIOD);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One pass: tries to win the cluster-wide election lock, and if
    /// successful, fails every running task past its deadline. Safe to
    /// call concurrently from multiple processes — only the lock winner
    /// does any work, and timed-out tasks are a terminal, idempotent
    /// write (spec §4.G step 3: "failing an already-failed task is a
    /// no-op").
    pub async fn sweep_once(&self) -> usize {
        if !self
            .lock_store
            .acquire_lock(ELECTION_LOCK_KEY, &self.owner_token, ELECTION_LOCK_TTL)
            .await
        {
            return 0;
        }

        let swept = self.sweep_running_tasks().await;

        if let Err(err) = self
            .lock_store
            .release_lock(ELECTION_LOCK_KEY, &self.owner_token)
            .await
        {
            tracing::warn!(error = %err, "failed to release timeout checker election lock");
        }

        swept
    }

    async fn sweep_running_tasks(&self) -> usize {
        let running = match self.task_store.list_running().await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(error = %err, "failed to list running tasks for timeout sweep");
                return 0;
            }
        };

        let now = Utc::now();
        let mut swept = 0;
        for mut task in running {
            if !is_overdue(&task, now) {
                continue;
            }
            task.fail("task timed out".to_string(), None);
            if let Err(err) = self.task_store.save(&task).await {
                tracing::error!(task_id = %task.id, error = %err, "failed to persist timed-out task");
                continue;
            }
            tracing::info!(task_id = %task.id, "swept timed-out task");
            swept += 1;
        }
        swept
    }
}

fn is_overdue(task: &Task, now: chrono::DateTime<Utc>) -> bool {
    if task.status.is_terminal() {
        return false;
    }
    let deadline = task.started_at.unwrap_or(task.created_at)
        + chrono::Duration::seconds(task.timeout_config as i64);
    now > deadline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeLockStore;
    use crate::task::InMemoryTaskStore;

    #[tokio::test]
    async fn sweep_fails_tasks_past_their_deadline() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let mut task = task_store.create("system", "u1", "trend_analysis").await.unwrap();
        task.start();
        task.timeout_config = 0;
        task.started_at = Some(Utc::now() - chrono::Duration::seconds(5));
        task_store.save(&task).await.unwrap();

        let sweeper = TaskSweeper::new(Arc::new(FakeLockStore::new()), task_store.clone());
        let swept = sweeper.sweep_once().await;
        assert_eq!(swept, 1);

        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "failed");
    }

    #[tokio::test]
    async fn a_second_sweeper_instance_yields_to_the_election_lock_holder() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let lock_store = Arc::new(FakeLockStore::new());

        let held = lock_store
            .acquire_lock(ELECTION_LOCK_KEY, "some-other-instance", ELECTION_LOCK_TTL)
            .await;
        assert!(held);

        let sweeper = TaskSweeper::new(lock_store, task_store);
        assert_eq!(sweeper.sweep_once().await, 0);
    }

    #[tokio::test]
    async fn fresh_tasks_within_their_timeout_are_left_alone() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let mut task = task_store.create("system", "u1", "trend_analysis").await.unwrap();
        task.start();
        task_store.save(&task).await.unwrap();

        let sweeper = TaskSweeper::new(Arc::new(FakeLockStore::new()), task_store.clone());
        assert_eq!(sweeper.sweep_once().await, 0);
        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "running");
    }
}
