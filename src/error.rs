//! Error taxonomy for layout runs.
//!
//! | Variant | Retried | Surfaced as |
//! |---------|---------|-------------|
//! | `Validation` | never | `success=false` immediately |
//! | `CycleRejected` | never | edge write rejected |
//! | `TransientStore` | already, by the caller's retry policy | `success=false` |
//! | `Store` | never | `success=false` |
//! | `Timeout` | never | `success=false`, partial scratch left intact |
//! | `Broker` / `Internal` | never | `success=false` with detail |
//!
//! Residual cycles are not errors: they are reported through
//! `LayoutStatistics::is_acyclic`.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Classifies store errors for the retry policy.
pub trait Retryable {
    /// True for connection drops, pool timeouts and similar conditions that
    /// may succeed on a later attempt.
    fn is_transient(&self) -> bool;
}

/// Error type for layout operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LayoutError {
    /// Malformed input graph or options.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Candidate edge would close a cycle.
    #[error("Edge {source_id} -> {target_id} would create a cycle")]
    CycleRejected {
        /// Source of the rejected edge.
        source_id: NodeId,
        /// Target of the rejected edge.
        target_id: NodeId,
    },

    /// Store kept failing transiently until the retry budget ran out.
    #[error("Transient store error after {attempts} attempts: {message}")]
    TransientStore {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last error message.
        message: String,
    },

    /// Non-transient store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Run exceeded its wall-clock budget.
    #[error("Layout run timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        /// Elapsed time when the run was aborted.
        elapsed_ms: u64,
        /// Configured limit.
        limit_ms: u64,
    },

    /// Task queue failure.
    #[error("Task broker error: {0}")]
    Broker(String),

    /// Unexpected internal condition.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LayoutError {
    /// Convert a store error, preserving its transient classification.
    pub fn from_store<E: std::error::Error + Retryable>(e: E) -> Self {
        if e.is_transient() {
            Self::TransientStore {
                attempts: 1,
                message: e.to_string(),
            }
        } else {
            Self::Store(e.to_string())
        }
    }

    /// Whether a stage failing with this error may be resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    /// Short machine-readable code for service responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::CycleRejected { .. } => "CYCLE_REJECTED",
            Self::TransientStore { .. } => "TRANSIENT_STORE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Broker(_) => "BROKER_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("flaky")]
    struct Flaky(bool);

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_from_store_keeps_classification() {
        assert!(LayoutError::from_store(Flaky(true)).is_retryable());
        assert!(!LayoutError::from_store(Flaky(false)).is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(LayoutError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(
            LayoutError::Timeout { elapsed_ms: 5, limit_ms: 1 }.code(),
            "TIMEOUT"
        );
    }
}
