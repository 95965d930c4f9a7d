//! Fire-and-forget background tasks with a pollable result slot.
//!
//! A task is all-or-nothing: `pending` until its executor settles, then
//! exactly one of `completed` / `failed`. Records expire `retention` after
//! enqueue whether or not anyone polled them; an expired id is
//! indistinguishable from an unknown one.
//!
//! The queue does not bound concurrency. Callers that need a cap apply it
//! before enqueueing.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opsflow_core::TaskId;

/// Task queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueueConfig {
    /// How long a record is kept after enqueue.
    pub retention: Duration,
    /// How often the sweeper purges expired records.
    pub sweep_interval: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl TaskQueueConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// Snapshot of a task record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// Counts of live (unexpired) tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskStats {
    pub fn total(&self) -> usize {
        self.pending + self.completed + self.failed
    }
}

#[derive(Debug)]
struct TaskRecord {
    task: Task,
    deadline: Instant,
}

impl TaskRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug)]
struct TaskQueueInner {
    config: TaskQueueConfig,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

/// In-process task queue. Cloning shares the same store.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(TaskQueueConfig::default())
    }
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        Self {
            inner: Arc::new(TaskQueueInner {
                config,
                tasks: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.inner.config
    }

    /// Record a pending task and run `fut` on the current tokio runtime.
    ///
    /// Returns without waiting for the work. The `Ok` value is stored as
    /// JSON, the `Err` value as its display string. A panic in `fut` settles
    /// the task as failed.
    pub fn enqueue<F, T, E>(&self, fut: F) -> TaskId
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let id = TaskId::new();
        let now = Utc::now();
        let retention = self.inner.config.retention;
        let record = TaskRecord {
            task: Task {
                id,
                status: TaskStatus::Pending,
                result: None,
                error: None,
                started_at: now,
                finished_at: None,
                expires_at: now + chrono::Duration::from_std(retention).unwrap_or_default(),
            },
            deadline: Instant::now() + retention,
        };
        self.inner.tasks.write().unwrap().insert(id, record);
        debug!(task_id = %id, "task enqueued");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(fut).await {
                Ok(Ok(value)) => serde_json::to_value(value)
                    .map_err(|e| format!("failed to serialize task result: {e}")),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join) if join.is_panic() => Err("task panicked".to_string()),
                Err(_) => Err("task aborted".to_string()),
            };
            inner.settle(id, outcome);
        });

        id
    }

    /// Current snapshot, or `None` if the id is unknown or expired.
    pub fn get(&self, id: TaskId) -> Option<Task> {
        let now = Instant::now();
        {
            let tasks = self.inner.tasks.read().unwrap();
            match tasks.get(&id) {
                None => return None,
                Some(r) if !r.is_expired(now) => return Some(r.task.clone()),
                Some(_) => {}
            }
        }

        let mut tasks = self.inner.tasks.write().unwrap();
        if tasks.get(&id).is_some_and(|r| r.is_expired(now)) {
            tasks.remove(&id);
            debug!(task_id = %id, "task evicted");
        }
        None
    }

    /// Evict expired records; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tasks = self.inner.tasks.write().unwrap();
        let before = tasks.len();
        tasks.retain(|_, r| !r.is_expired(now));
        before - tasks.len()
    }

    pub fn stats(&self) -> TaskStats {
        let now = Instant::now();
        let tasks = self.inner.tasks.read().unwrap();
        let mut stats = TaskStats::default();
        for record in tasks.values().filter(|r| !r.is_expired(now)) {
            match record.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Purge expired records every `sweep_interval` until `token` is cancelled.
    pub fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("task sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = queue.purge_expired();
                        if purged > 0 {
                            info!(purged, "expired tasks purged");
                        }
                    }
                }
            }
        })
    }
}

impl TaskQueueInner {
    fn settle(&self, id: TaskId, outcome: Result<JsonValue, String>) {
        let mut tasks = self.tasks.write().unwrap();
        let Some(record) = tasks.get_mut(&id) else {
            debug!(task_id = %id, "task settled after eviction");
            return;
        };
        if record.task.status.is_terminal() {
            warn!(task_id = %id, "task settled twice");
            return;
        }

        record.task.finished_at = Some(Utc::now());
        match outcome {
            Ok(value) => {
                record.task.status = TaskStatus::Completed;
                record.task.result = Some(value);
                debug!(task_id = %id, "task completed");
            }
            Err(error) => {
                warn!(task_id = %id, error = %error, "task failed");
                record.task.status = TaskStatus::Failed;
                record.task.error = Some(error);
            }
        }
    }
}
