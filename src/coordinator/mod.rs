//! Run orchestration.
//!
//! [`DistributedLayoutCoordinator::calculate_layout`] drives one run through
//! its stages:
//!
//! | Stage | Queue |
//! |-------|-------|
//! | `ComputeOrder` | `graph_processing` |
//! | `AssignLayers` | `graph_processing` |
//! | `GroupLevels` | `optimization` |
//! | `PersistChunk` (one per chunk, in parallel) | `persistence` |
//!
//! Stages are sequential within a run; each is submitted to a [`TaskBroker`]
//! and executed by whichever worker picks it up. A stage that fails with a
//! retryable error is resubmitted, up to `max_retries` times. The whole run
//! is bounded by `conversion_timeout`.

pub mod queue;
pub mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};

use crate::canonical::layout_hash;
use crate::config::WorkerConfig;
use crate::error::LayoutError;
use crate::layering::{
    EncodedLayout, LayerReport, LayoutStage, ProgressRegistry, ProgressReporter, SortReport,
};
use crate::store::LayoutStore;
use crate::types::{LayoutOptions, LayoutResult, LayoutStatistics, NodeFilter, RunId};

pub use queue::{
    InProcessBroker, QueueName, StageOutput, StageTask, TaskBroker, TaskEnvelope, TaskOutcome,
};
#[cfg(feature = "postgres")]
pub use queue::PostgresTaskBroker;
pub use worker::{StageExecutor, WorkerPool};

/// Finished runs whose progress stays queryable.
const RETAINED_RUNS: usize = 256;

/// A run that did not produce a layout.
#[derive(Debug, Clone, thiserror::Error)]
#[error("layout run {run_id} failed: {error}")]
pub struct LayoutFailure {
    /// Run id.
    pub run_id: RunId,
    /// Cause.
    pub error: LayoutError,
    /// Timing measured before the failure.
    pub statistics: LayoutStatistics,
}

fn unexpected_output(stage: &str) -> LayoutError {
    LayoutError::Internal(format!("{stage} returned an unexpected output"))
}

/// Orchestrates layout runs over a task broker.
pub struct DistributedLayoutCoordinator<S, B = InProcessBroker>
where
    S: LayoutStore + 'static,
    B: TaskBroker + 'static,
{
    store: Arc<S>,
    broker: Arc<B>,
    config: WorkerConfig,
    progress: Arc<ProgressRegistry>,
    pool: Option<WorkerPool>,
}

impl<S: LayoutStore + 'static> DistributedLayoutCoordinator<S, InProcessBroker> {
    /// Coordinator with an embedded broker and `max_workers` local workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn in_process(store: Arc<S>, config: WorkerConfig) -> Self {
        Self::in_process_with_progress(store, config, Arc::new(ProgressRegistry::new()))
    }

    /// Like [`Self::in_process`], reporting into a registry shared with
    /// other coordinators.
    pub fn in_process_with_progress(
        store: Arc<S>,
        config: WorkerConfig,
        progress: Arc<ProgressRegistry>,
    ) -> Self {
        let broker = Arc::new(InProcessBroker::new());
        let executor = Arc::new(StageExecutor::new(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&progress),
        ));
        let pool = WorkerPool::spawn(
            executor,
            Arc::clone(&broker),
            QueueName::ALL.to_vec(),
            config.max_workers,
        );
        Self {
            store,
            broker,
            config,
            progress,
            pool: Some(pool),
        }
    }
}

impl<S, B> DistributedLayoutCoordinator<S, B>
where
    S: LayoutStore + 'static,
    B: TaskBroker + 'static,
{
    /// Coordinator that submits to an external broker. Workers run elsewhere.
    pub fn with_broker(store: Arc<S>, broker: Arc<B>, config: WorkerConfig) -> Self {
        Self {
            store,
            broker,
            config,
            progress: Arc::new(ProgressRegistry::new()),
            pool: None,
        }
    }

    /// Progress of this coordinator's runs.
    pub fn progress(&self) -> Arc<ProgressRegistry> {
        Arc::clone(&self.progress)
    }

    /// The store runs are computed against.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Compute and persist a layout with the configured timeout.
    pub async fn calculate_layout(
        &self,
        filter: &NodeFilter,
        options: &LayoutOptions,
    ) -> Result<LayoutResult, LayoutFailure> {
        self.calculate_layout_with_timeout(filter, options, self.config.conversion_timeout)
            .await
    }

    /// Compute and persist a layout within `limit`.
    ///
    /// Scratch state is discarded whether the run succeeds, fails or times
    /// out. Derived fields already committed by a failed run stay as they
    /// are until the next successful run overwrites them.
    pub async fn calculate_layout_with_timeout(
        &self,
        filter: &NodeFilter,
        options: &LayoutOptions,
        limit: Duration,
    ) -> Result<LayoutResult, LayoutFailure> {
        let run_id = RunId::new();
        let started = Instant::now();
        self.progress.prune_finished(RETAINED_RUNS);
        let reporter = self.progress.register(run_id, self.config.progress_interval);
        let span = info_span!("layout_run", run_id = %run_id);

        let outcome = tokio::time::timeout(
            limit,
            self.run_stages(run_id, filter, options, &reporter)
                .instrument(span),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LayoutError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
                limit_ms: limit.as_millis() as u64,
            })
        });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut result) => {
                result.statistics.processing_time_ms = elapsed_ms;
                reporter.complete(result.statistics.total_blocks);
                self.discard_run(&run_id).await;
                info!(
                    target: "layout::metrics",
                    metric_type = "run",
                    run_id = %run_id,
                    success = true,
                    blocks = result.statistics.total_blocks,
                    links = result.statistics.total_links,
                    levels = result.statistics.total_levels,
                    is_acyclic = result.statistics.is_acyclic,
                    duration_ms = elapsed_ms,
                    "layout run completed"
                );
                Ok(result)
            }
            Err(error) => {
                reporter.fail(error.to_string());
                self.discard_run(&run_id).await;
                warn!(
                    target: "layout::metrics",
                    metric_type = "run",
                    run_id = %run_id,
                    success = false,
                    error_code = error.code(),
                    error = %error,
                    duration_ms = elapsed_ms,
                    "layout run failed"
                );
                Err(LayoutFailure {
                    run_id,
                    error,
                    statistics: LayoutStatistics {
                        processing_time_ms: elapsed_ms,
                        ..LayoutStatistics::default()
                    },
                })
            }
        }
    }

    async fn run_stages(
        &self,
        run_id: RunId,
        filter: &NodeFilter,
        options: &LayoutOptions,
        reporter: &ProgressReporter,
    ) -> Result<LayoutResult, LayoutError> {
        let options = options.clone().normalized()?;

        let StageOutput::Ordered(sort) = self
            .dispatch(StageTask::ComputeOrder {
                run_id,
                filter: filter.clone(),
            })
            .await?
        else {
            return Err(unexpected_output("compute_order"));
        };
        let SortReport {
            node_count,
            link_count,
            forced_count,
            ..
        } = sort;

        let StageOutput::Layered(LayerReport { max_layer, .. }) = self
            .dispatch(StageTask::AssignLayers {
                run_id,
                total: node_count,
                max_layers: options.max_layers,
            })
            .await?
        else {
            return Err(unexpected_output("assign_layers"));
        };

        let StageOutput::Grouped(encoded) = self
            .dispatch(StageTask::GroupLevels {
                run_id,
                total: node_count,
                options: options.clone(),
                total_links: link_count,
                forced_count,
            })
            .await?
        else {
            return Err(unexpected_output("group_levels"));
        };
        let EncodedLayout {
            blocks,
            levels,
            sublevels,
            statistics,
        } = encoded;

        if statistics.total_blocks != node_count {
            return Err(LayoutError::Internal(format!(
                "grouped {} blocks for {} ordered nodes",
                statistics.total_blocks, node_count
            )));
        }
        if statistics.max_layer > max_layer {
            return Err(LayoutError::Internal(format!(
                "grouping reports layer {} above assigned maximum {}",
                statistics.max_layer, max_layer
            )));
        }

        reporter.stage(LayoutStage::Persisting, blocks.len());
        // Submit every chunk up front so idle workers persist them concurrently
        let mut pending = Vec::new();
        for chunk in blocks.chunks(self.config.persist_chunk_size.max(1)) {
            let envelope = TaskEnvelope::new(StageTask::PersistChunk {
                run_id,
                placements: chunk.to_vec(),
            });
            self.broker.submit(envelope.clone()).await?;
            pending.push(envelope);
        }
        let mut persisted = 0;
        for envelope in pending {
            match self.wait_for(envelope).await? {
                StageOutput::Persisted { count } => persisted += count,
                _ => return Err(unexpected_output("persist_chunk")),
            }
        }

        info!(run_id = %run_id, persisted, "Placements persisted");

        Ok(LayoutResult {
            run_id,
            layout_hash: layout_hash(&blocks)?,
            blocks,
            levels,
            sublevels,
            statistics,
            computed_at: Utc::now(),
        })
    }

    async fn discard_run(&self, run_id: &RunId) {
        if let Err(e) = self.store.end_run(run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to discard run scratch state");
        }
    }

    /// Submit a task and wait for it.
    async fn dispatch(&self, task: StageTask) -> Result<StageOutput, LayoutError> {
        let envelope = TaskEnvelope::new(task);
        self.broker.submit(envelope.clone()).await?;
        self.wait_for(envelope).await
    }

    /// Wait for a submitted task, resubmitting retryable failures.
    async fn wait_for(&self, mut envelope: TaskEnvelope) -> Result<StageOutput, LayoutError> {
        loop {
            match self.broker.await_outcome(envelope.task_id).await? {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && envelope.attempt <= self.config.retry.max_retries => {
                    warn!(
                        stage = envelope.task.name(),
                        attempt = envelope.attempt,
                        error = %e,
                        "Stage failed, resubmitting"
                    );
                    envelope = envelope.retry();
                    self.broker.submit(envelope.clone()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop the embedded worker pool, if any.
    pub async fn shutdown(self) {
        if let Some(pool) = self.pool {
            pool.shutdown().await;
        }
    }
}
