//! Rate-limited progress notifications.
//!
//! Each run publishes its latest [`LayoutProgress`] on a `watch` channel.
//! Observers only ever see the most recent record, so a slow consumer cannot
//! back up the run. Within a stage, updates are throttled to one per
//! interval; stage transitions are always published.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::RunId;

/// Pipeline stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutStage {
    /// Registered, no stage started yet.
    Queued,
    /// Topological sort.
    Ordering,
    /// Layer assignment.
    Layering,
    /// Level grouping and position encoding.
    Grouping,
    /// Writing placements back to the store.
    Persisting,
    /// Finished successfully.
    Completed,
    /// Aborted.
    Failed,
}

impl LayoutStage {
    /// Whether the run has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Latest known state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutProgress {
    /// Run id.
    pub run_id: RunId,
    /// Current stage.
    pub stage: LayoutStage,
    /// Items processed in the current stage.
    pub processed: usize,
    /// Items expected in the current stage.
    pub total: usize,
    /// Failure detail, when `stage` is `Failed`.
    pub message: Option<String>,
    /// Time of this update.
    pub updated_at: DateTime<Utc>,
}

/// Publisher side of a run's progress channel.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<LayoutProgress>,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    /// Create a reporter for a run.
    pub fn new(run_id: RunId, interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(LayoutProgress {
            run_id,
            stage: LayoutStage::Queued,
            processed: 0,
            total: 0,
            message: None,
            updated_at: Utc::now(),
        });
        Self {
            tx,
            interval,
            last_emit: Mutex::new(None),
        }
    }

    /// Subscribe to updates.
    pub fn subscribe(&self) -> watch::Receiver<LayoutProgress> {
        self.tx.subscribe()
    }

    /// Latest published record.
    pub fn snapshot(&self) -> LayoutProgress {
        self.tx.borrow().clone()
    }

    /// Enter a stage. Always published.
    pub fn stage(&self, stage: LayoutStage, total: usize) {
        self.publish(stage, 0, total, None);
    }

    /// Report progress inside the current stage. Dropped if the previous
    /// update was less than one interval ago.
    pub fn advance(&self, processed: usize) {
        {
            let mut last = self.last_emit.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        self.tx.send_modify(|p| {
            p.processed = processed;
            p.updated_at = Utc::now();
        });
    }

    /// Mark the run completed.
    pub fn complete(&self, total: usize) {
        self.publish(LayoutStage::Completed, total, total, None);
    }

    /// Mark the run failed.
    pub fn fail(&self, message: impl Into<String>) {
        let current = self.snapshot();
        self.publish(
            LayoutStage::Failed,
            current.processed,
            current.total,
            Some(message.into()),
        );
    }

    fn publish(&self, stage: LayoutStage, processed: usize, total: usize, message: Option<String>) {
        *self.last_emit.lock() = Some(Instant::now());
        self.tx.send_modify(|p| {
            p.stage = stage;
            p.processed = processed;
            p.total = total;
            p.message = message;
            p.updated_at = Utc::now();
        });
    }
}

/// Progress channels of the runs known to this process.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    runs: RwLock<HashMap<RunId, Arc<ProgressReporter>>>,
}

impl ProgressRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return its reporter.
    pub fn register(&self, run_id: RunId, interval: Duration) -> Arc<ProgressReporter> {
        let reporter = Arc::new(ProgressReporter::new(run_id, interval));
        self.runs.write().insert(run_id, Arc::clone(&reporter));
        reporter
    }

    /// Reporter of a run, if it was registered here.
    pub fn reporter(&self, run_id: &RunId) -> Option<Arc<ProgressReporter>> {
        self.runs.read().get(run_id).cloned()
    }

    /// Latest progress of a run.
    pub fn snapshot(&self, run_id: &RunId) -> Option<LayoutProgress> {
        self.reporter(run_id).map(|r| r.snapshot())
    }

    /// Forget finished runs, keeping at most `keep` of them.
    pub fn prune_finished(&self, keep: usize) {
        let mut runs = self.runs.write();
        let mut finished: Vec<(DateTime<Utc>, RunId)> = runs
            .iter()
            .map(|(id, r)| (r.snapshot(), *id))
            .filter(|(p, _)| p.stage.is_terminal())
            .map(|(p, id)| (p.updated_at, id))
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, id) in finished.into_iter().take(excess) {
            runs.remove(&id);
        }
    }

    /// Number of tracked runs.
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Whether no runs are tracked.
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_throttled() {
        let reporter = ProgressReporter::new(RunId::new(), Duration::from_secs(3600));
        reporter.stage(LayoutStage::Ordering, 100);

        reporter.advance(10);
        reporter.advance(20);
        // Stage transition counts as the last emission
        assert_eq!(reporter.snapshot().processed, 0);
    }

    #[test]
    fn test_advance_passes_with_zero_interval() {
        let reporter = ProgressReporter::new(RunId::new(), Duration::ZERO);
        reporter.stage(LayoutStage::Layering, 10);
        reporter.advance(4);
        reporter.advance(7);
        let p = reporter.snapshot();
        assert_eq!((p.stage, p.processed, p.total), (LayoutStage::Layering, 7, 10));
    }

    #[test]
    fn test_stage_transitions_always_publish() {
        let reporter = ProgressReporter::new(RunId::new(), Duration::from_secs(3600));
        let rx = reporter.subscribe();
        reporter.stage(LayoutStage::Ordering, 5);
        reporter.stage(LayoutStage::Layering, 5);
        assert_eq!(rx.borrow().stage, LayoutStage::Layering);

        reporter.fail("boom");
        let p = reporter.snapshot();
        assert_eq!(p.stage, LayoutStage::Failed);
        assert_eq!(p.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_registry_prunes_oldest_finished() {
        let registry = ProgressRegistry::new();
        let running = RunId::new();
        registry.register(running, Duration::ZERO);
        for _ in 0..3 {
            let id = RunId::new();
            registry.register(id, Duration::ZERO).complete(1);
        }
        registry.prune_finished(1);
        assert_eq!(registry.len(), 2);
        assert!(registry.snapshot(&running).is_some());
    }
}
