//! Stage execution and the worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::WorkerConfig;
use crate::coordinator::queue::{QueueName, StageOutput, StageTask, TaskBroker, TaskOutcome};
use crate::layering::{
    LayerAssigner, LayoutStage, LevelGrouper, PositionEncoder, ProgressRegistry, RunFacts,
    TopologicalSorter,
};
use crate::memory::MemoryBudget;
use crate::retry::RetryPolicy;
use crate::store::LayoutStore;

/// How long an idle worker sleeps when its broker has nothing queued.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Runs stage tasks against a store.
pub struct StageExecutor<S: LayoutStore> {
    store: Arc<S>,
    config: WorkerConfig,
    retry: RetryPolicy,
    budget: Arc<MemoryBudget>,
    progress: Arc<ProgressRegistry>,
}

impl<S: LayoutStore> StageExecutor<S> {
    /// Create an executor.
    pub fn new(store: Arc<S>, config: WorkerConfig, progress: Arc<ProgressRegistry>) -> Self {
        let budget = Arc::new(MemoryBudget::new(config.memory_limit_bytes));
        Self {
            store,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            budget,
            progress,
        }
    }

    /// The store this executor writes to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute one task. Every stage re-initializes its own scratch state, so
    /// a task may be executed again after a failure.
    pub async fn execute(&self, task: StageTask) -> TaskOutcome {
        let stage_name = task.name();
        let run_id = task.run_id();
        let started = Instant::now();
        let reporter = self.progress.reporter(&run_id);
        let store = self.store.as_ref();
        let batch_size = self.config.batch_size;

        let outcome = match task {
            StageTask::ComputeOrder { run_id, filter } => {
                let mut sorter = TopologicalSorter::new(store, batch_size)
                    .with_retry(self.retry.clone())
                    .with_budget(&self.budget);
                if let Some(r) = reporter.as_deref() {
                    sorter = sorter.with_progress(r);
                }
                sorter
                    .compute_order(&run_id, &filter)
                    .await
                    .map(StageOutput::Ordered)
            }
            StageTask::AssignLayers {
                run_id,
                total,
                max_layers,
            } => {
                let mut assigner = LayerAssigner::new(store, batch_size)
                    .with_max_layers(max_layers)
                    .with_retry(self.retry.clone())
                    .with_budget(&self.budget);
                if let Some(r) = reporter.as_deref() {
                    assigner = assigner.with_progress(r);
                }
                assigner
                    .assign_layers(&run_id, total)
                    .await
                    .map(StageOutput::Layered)
            }
            StageTask::GroupLevels {
                run_id,
                total,
                options,
                total_links,
                forced_count,
            } => {
                let mut grouper = LevelGrouper::new(store, batch_size).with_retry(self.retry.clone());
                if let Some(r) = reporter.as_deref() {
                    grouper = grouper.with_progress(r);
                }
                grouper.group(&run_id, &options, total).await.map(|grouping| {
                    let facts = RunFacts {
                        total_links,
                        forced_count,
                    };
                    StageOutput::Grouped(PositionEncoder::new(&options).encode(&grouping, facts))
                })
            }
            StageTask::PersistChunk { placements, .. } => {
                if let Some(r) = reporter.as_deref() {
                    if r.snapshot().stage != LayoutStage::Persisting {
                        r.stage(LayoutStage::Persisting, 0);
                    }
                }
                self.retry
                    .run("persist_placements", || store.persist_placements(&placements))
                    .await
                    .map(|()| StageOutput::Persisted {
                        count: placements.len(),
                    })
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => info!(
                target: "layout::metrics",
                metric_type = "stage",
                run_id = %run_id,
                stage = stage_name,
                duration_ms,
                success = true,
                "stage completed"
            ),
            Err(e) => warn!(
                target: "layout::metrics",
                metric_type = "stage",
                run_id = %run_id,
                stage = stage_name,
                duration_ms,
                success = false,
                error_code = e.code(),
                error = %e,
                "stage failed"
            ),
        }
        outcome
    }
}

/// A fixed set of workers pulling stage tasks from a broker.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `workers` workers on the current runtime.
    pub fn spawn<S, B>(
        executor: Arc<StageExecutor<S>>,
        broker: Arc<B>,
        queues: Vec<QueueName>,
        workers: usize,
    ) -> Self
    where
        S: LayoutStore + 'static,
        B: TaskBroker + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let executor = Arc::clone(&executor);
                let broker = Arc::clone(&broker);
                let queues = queues.clone();
                let shutdown_rx = shutdown_rx.clone();
                let span = tracing::info_span!("layout_worker", worker_id);
                tokio::spawn(
                    worker_loop(executor, broker, queues, shutdown_rx).instrument(span),
                )
            })
            .collect();

        info!(
            workers = workers.max(1),
            queues = ?queues.iter().map(QueueName::as_str).collect::<Vec<_>>(),
            "Worker pool started"
        );
        Self { handles, shutdown }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop every worker after its current task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker exited abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop<S, B>(
    executor: Arc<StageExecutor<S>>,
    broker: Arc<B>,
    queues: Vec<QueueName>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: LayoutStore + 'static,
    B: TaskBroker + 'static,
{
    loop {
        if *shutdown.borrow() {
            break;
        }
        let fetched = tokio::select! {
            fetched = broker.fetch(&queues) => fetched,
            _ = shutdown.changed() => break,
        };

        match fetched {
            Ok(Some(envelope)) => {
                debug!(
                    task_id = %envelope.task_id,
                    stage = envelope.task.name(),
                    attempt = envelope.attempt,
                    "Executing task"
                );
                let outcome = executor.execute(envelope.task).await;
                if let Err(e) = broker.complete(envelope.task_id, outcome).await {
                    warn!(task_id = %envelope.task_id, error = %e, "Failed to report outcome");
                }
            }
            Ok(None) => idle(&mut shutdown).await,
            Err(e) => {
                warn!(error = %e, "Task fetch failed");
                idle(&mut shutdown).await;
            }
        }
    }
    debug!("Worker stopped");
}

async fn idle(shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(IDLE_POLL) => {}
        _ = shutdown.changed() => {}
    }
}
