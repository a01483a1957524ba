//! Stage tasks and the brokers that carry them.
//!
//! A run is a sequence of stage tasks. Each task is a self-contained,
//! serializable work item placed on a named queue; any worker listening on
//! that queue may execute it and report a [`TaskOutcome`].

use std::collections::{HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use crate::error::LayoutError;
use crate::layering::{EncodedLayout, LayerReport, SortReport};
use crate::types::{BlockPlacement, LayoutOptions, NodeFilter, RunId};

/// Named work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Ordering and layering.
    GraphProcessing,
    /// Level grouping and position encoding.
    Optimization,
    /// Writing placements back.
    Persistence,
}

impl QueueName {
    /// Every queue, in priority order.
    pub const ALL: [QueueName; 3] = [Self::GraphProcessing, Self::Optimization, Self::Persistence];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphProcessing => "graph_processing",
            Self::Optimization => "optimization",
            Self::Persistence => "persistence",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.as_str() == s)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageTask {
    /// Topological sort of the run's node set.
    ComputeOrder {
        /// Run id.
        run_id: RunId,
        /// Node selection.
        filter: NodeFilter,
    },
    /// Longest-path layering.
    AssignLayers {
        /// Run id.
        run_id: RunId,
        /// Nodes in the run.
        total: usize,
        /// Layer cap.
        max_layers: Option<u32>,
    },
    /// Grouping and coordinates.
    GroupLevels {
        /// Run id.
        run_id: RunId,
        /// Nodes in the run.
        total: usize,
        /// Layout options.
        options: LayoutOptions,
        /// Edges in the run.
        total_links: usize,
        /// Nodes force-ordered by the sorter.
        forced_count: usize,
    },
    /// Write one chunk of placements.
    PersistChunk {
        /// Run id.
        run_id: RunId,
        /// Placements to write.
        placements: Vec<BlockPlacement>,
    },
}

impl StageTask {
    /// Queue this task belongs on.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::ComputeOrder { .. } | Self::AssignLayers { .. } => QueueName::GraphProcessing,
            Self::GroupLevels { .. } => QueueName::Optimization,
            Self::PersistChunk { .. } => QueueName::Persistence,
        }
    }

    /// Run this task belongs to.
    pub fn run_id(&self) -> RunId {
        match self {
            Self::ComputeOrder { run_id, .. }
            | Self::AssignLayers { run_id, .. }
            | Self::GroupLevels { run_id, .. }
            | Self::PersistChunk { run_id, .. } => *run_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ComputeOrder { .. } => "compute_order",
            Self::AssignLayers { .. } => "assign_layers",
            Self::GroupLevels { .. } => "group_levels",
            Self::PersistChunk { .. } => "persist_chunk",
        }
    }
}

/// A task as it travels through a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Unique per submission.
    pub task_id: Uuid,
    /// Submission attempt, starting at 1.
    pub attempt: u32,
    /// Work item.
    pub task: StageTask,
}

impl TaskEnvelope {
    /// Wrap a task for its first attempt.
    pub fn new(task: StageTask) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            attempt: 1,
            task,
        }
    }

    /// Fresh envelope for the next attempt of the same task.
    pub fn retry(&self) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            attempt: self.attempt + 1,
            task: self.task.clone(),
        }
    }

    /// Queue of the wrapped task.
    pub fn queue(&self) -> QueueName {
        self.task.queue()
    }
}

/// Result payload of a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum StageOutput {
    /// From `ComputeOrder`.
    Ordered(SortReport),
    /// From `AssignLayers`.
    Layered(LayerReport),
    /// From `GroupLevels`.
    Grouped(EncodedLayout),
    /// From `PersistChunk`.
    Persisted {
        /// Placements written.
        count: usize,
    },
}

/// Reported result of one task.
pub type TaskOutcome = Result<StageOutput, LayoutError>;

/// Transport for stage tasks.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Enqueue a task.
    async fn submit(&self, envelope: TaskEnvelope) -> Result<(), LayoutError>;

    /// Take the next task from any of `queues`, earlier queues first.
    /// Returns `None` when nothing is available right now.
    async fn fetch(&self, queues: &[QueueName]) -> Result<Option<TaskEnvelope>, LayoutError>;

    /// Report a task's outcome.
    async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<(), LayoutError>;

    /// Wait for a submitted task's outcome.
    async fn await_outcome(&self, task_id: Uuid) -> Result<TaskOutcome, LayoutError>;
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueName, VecDeque<TaskEnvelope>>,
    waiters: HashMap<Uuid, oneshot::Sender<TaskOutcome>>,
    receivers: HashMap<Uuid, oneshot::Receiver<TaskOutcome>>,
}

/// Broker living inside one process.
///
/// Used by `standalone` and `single` modes and by tests. `fetch` waits until
/// a task is available instead of returning `None`.
#[derive(Default)]
pub struct InProcessBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl InProcessBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks waiting on a queue.
    pub fn queued(&self, queue: QueueName) -> usize {
        self.state.lock().queues.get(&queue).map_or(0, VecDeque::len)
    }

    fn pop(&self, queues: &[QueueName]) -> Option<TaskEnvelope> {
        let mut state = self.state.lock();
        queues
            .iter()
            .find_map(|q| state.queues.get_mut(q).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl TaskBroker for InProcessBroker {
    async fn submit(&self, envelope: TaskEnvelope) -> Result<(), LayoutError> {
        {
            let mut state = self.state.lock();
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(envelope.task_id, tx);
            state.receivers.insert(envelope.task_id, rx);
            state
                .queues
                .entry(envelope.queue())
                .or_default()
                .push_back(envelope);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fetch(&self, queues: &[QueueName]) -> Result<Option<TaskEnvelope>, LayoutError> {
        loop {
            let notified = self.notify.notified();
            if let Some(envelope) = self.pop(queues) {
                return Ok(Some(envelope));
            }
            notified.await;
        }
    }

    async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<(), LayoutError> {
        let waiter = self.state.lock().waiters.remove(&task_id);
        match waiter {
            // Receiver may be gone if the run timed out
            Some(tx) => {
                let _ = tx.send(outcome);
                Ok(())
            }
            None => Err(LayoutError::Broker(format!("unknown task {task_id}"))),
        }
    }

    async fn await_outcome(&self, task_id: Uuid) -> Result<TaskOutcome, LayoutError> {
        let rx = self
            .state
            .lock()
            .receivers
            .remove(&task_id)
            .ok_or_else(|| LayoutError::Broker(format!("unknown task {task_id}")))?;
        rx.await
            .map_err(|_| LayoutError::Broker(format!("task {task_id} dropped without outcome")))
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresTaskBroker;

#[cfg(feature = "postgres")]
mod postgres {
    //! Task table shared by every worker process.
    //!
    //! Workers claim rows with `FOR UPDATE SKIP LOCKED`, so concurrent
    //! fetches never hand out the same task twice.

    use std::time::Duration;

    use async_trait::async_trait;
    use sqlx::postgres::PgPool;
    use sqlx::Row;
    use uuid::Uuid;

    use super::{QueueName, TaskBroker, TaskEnvelope, TaskOutcome};
    use crate::error::LayoutError;

    fn broker_err(e: impl std::fmt::Display) -> LayoutError {
        LayoutError::Broker(e.to_string())
    }

    /// Broker backed by the `km_layout_tasks` table.
    pub struct PostgresTaskBroker {
        pool: PgPool,
        poll_interval: Duration,
    }

    impl PostgresTaskBroker {
        /// Create a broker over an existing pool.
        pub fn new(pool: PgPool) -> Self {
            Self {
                pool,
                poll_interval: Duration::from_millis(250),
            }
        }

        /// Set how often `await_outcome` polls.
        pub fn with_poll_interval(mut self, interval: Duration) -> Self {
            self.poll_interval = interval;
            self
        }

        /// Create the task table if missing.
        pub async fn migrate(&self) -> Result<(), LayoutError> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS km_layout_tasks (
                    task_id UUID PRIMARY KEY,
                    queue TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    outcome JSONB,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(broker_err)?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS km_layout_tasks_queued \
                 ON km_layout_tasks (queue, created_at) WHERE status = 'queued'",
            )
            .execute(&self.pool)
            .await
            .map_err(broker_err)?;
            Ok(())
        }
    }

    #[async_trait]
    impl TaskBroker for PostgresTaskBroker {
        async fn submit(&self, envelope: TaskEnvelope) -> Result<(), LayoutError> {
            let payload = serde_json::to_value(&envelope).map_err(broker_err)?;
            sqlx::query("INSERT INTO km_layout_tasks (task_id, queue, payload) VALUES ($1, $2, $3)")
                .bind(envelope.task_id)
                .bind(envelope.queue().as_str())
                .bind(payload)
                .execute(&self.pool)
                .await
                .map_err(broker_err)?;
            Ok(())
        }

        async fn fetch(&self, queues: &[QueueName]) -> Result<Option<TaskEnvelope>, LayoutError> {
            let names: Vec<String> = queues.iter().map(|q| q.as_str().to_string()).collect();
            let row = sqlx::query(
                r#"
                UPDATE km_layout_tasks SET status = 'running', updated_at = now()
                WHERE task_id = (
                    SELECT task_id FROM km_layout_tasks
                    WHERE status = 'queued' AND queue = ANY($1)
                    ORDER BY created_at, task_id
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING payload
                "#,
            )
            .bind(names)
            .fetch_optional(&self.pool)
            .await
            .map_err(broker_err)?;

            match row {
                Some(row) => {
                    let payload: serde_json::Value = row.get("payload");
                    Ok(Some(serde_json::from_value(payload).map_err(broker_err)?))
                }
                None => Ok(None),
            }
        }

        async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<(), LayoutError> {
            let outcome = serde_json::to_value(&outcome).map_err(broker_err)?;
            let result = sqlx::query(
                "UPDATE km_layout_tasks SET status = 'done', outcome = $2, updated_at = now() \
                 WHERE task_id = $1",
            )
            .bind(task_id)
            .bind(outcome)
            .execute(&self.pool)
            .await
            .map_err(broker_err)?;
            if result.rows_affected() == 0 {
                return Err(LayoutError::Broker(format!("unknown task {task_id}")));
            }
            Ok(())
        }

        async fn await_outcome(&self, task_id: Uuid) -> Result<TaskOutcome, LayoutError> {
            loop {
                let row = sqlx::query(
                    "SELECT status, outcome FROM km_layout_tasks WHERE task_id = $1",
                )
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(broker_err)?
                .ok_or_else(|| LayoutError::Broker(format!("unknown task {task_id}")))?;

                let status: String = row.get("status");
                if status == "done" {
                    let outcome: Option<serde_json::Value> = row.get("outcome");
                    let outcome = outcome
                        .ok_or_else(|| LayoutError::Broker(format!("task {task_id} has no outcome")))?;
                    sqlx::query("DELETE FROM km_layout_tasks WHERE task_id = $1")
                        .bind(task_id)
                        .execute(&self.pool)
                        .await
                        .map_err(broker_err)?;
                    return serde_json::from_value(outcome).map_err(broker_err);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
