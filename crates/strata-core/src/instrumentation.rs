//! Instrumentation for plan construction and execution
//!
//! Two levels of metrics:
//! 1. **Plan-level**: negotiation + compilation of one direction's plan
//! 2. **Execution-level**: one forward or backward submission
//!
//! Both log through `tracing` and forward to the aggregated performance
//! events in `strata_tracing::performance`.
//!
//! ## Example
//!
//! ```text
//! use strata_core::instrumentation::ExecutionMetrics;
//!
//! let start = std::time::Instant::now();
//! // ... run forward ...
//! ExecutionMetrics::new("softmax_forward", steps, numel, start).log();
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::plan::ExecutionPlan;

// ============================================================================
// Plan-Level Metrics
// ============================================================================

/// Metrics for building one execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetrics {
    /// "softmax_forward" or "softmax_backward"
    pub operation: String,
    /// Logical shape, e.g. "[2, 8, 3, 3]@axis1"
    pub shape: String,
    /// Steps in the finalized sequence
    pub steps: usize,
    /// Of which layout conversions
    pub reorders: usize,
    pub scratch_bytes: usize,
    /// Bytes of persistent memory the plan requires
    pub persistent_bytes: usize,
    pub duration_us: u64,
}

impl PlanMetrics {
    pub fn from_plan(plan: &ExecutionPlan, duration: Duration) -> Self {
        Self {
            operation: plan.direction().operation().to_string(),
            shape: plan.shape().to_string(),
            steps: plan.steps().len(),
            reorders: plan.reorder_count(),
            scratch_bytes: plan.scratch_bytes(),
            persistent_bytes: plan.persistent_requirements().iter().map(|(_, bytes)| bytes).sum(),
            duration_us: duration.as_micros() as u64,
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        self.reorders == 0
    }

    /// Log metrics via tracing
    pub fn log(&self) {
        tracing::debug!(
            operation = %self.operation,
            shape = %self.shape,
            steps = self.steps,
            reorders = self.reorders,
            scratch_bytes = self.scratch_bytes,
            persistent_bytes = self.persistent_bytes,
            duration_us = self.duration_us,
            "plan_built"
        );
        strata_tracing::performance::record_plan_build(
            &self.operation,
            self.steps,
            self.reorders,
            self.scratch_bytes,
            self.duration_us,
        );
    }
}

// ============================================================================
// Execution-Level Metrics
// ============================================================================

/// Metrics for one plan submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub operation: String,
    /// Steps submitted to the stream
    pub steps: usize,
    /// Logical elements normalized
    pub elements: usize,
    pub duration_us: u64,
}

impl ExecutionMetrics {
    /// Create execution metrics from start time
    pub fn new(operation: impl Into<String>, steps: usize, elements: usize, start: Instant) -> Self {
        Self {
            operation: operation.into(),
            steps,
            elements,
            duration_us: start.elapsed().as_micros() as u64,
        }
    }

    /// Logical elements per second
    pub fn elements_per_second(&self) -> f64 {
        if self.duration_us == 0 {
            return 0.0;
        }
        (self.elements as f64 / self.duration_us as f64) * 1_000_000.0
    }

    /// Log metrics via tracing
    pub fn log(&self) {
        tracing::debug!(
            operation = %self.operation,
            steps = self.steps,
            elements = self.elements,
            duration_us = self.duration_us,
            elements_per_second = self.elements_per_second(),
            "{}_executed",
            self.operation
        );
        strata_tracing::performance::record_execution(&self.operation, self.steps, self.elements, self.duration_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_metrics() {
        let metrics = ExecutionMetrics {
            operation: "softmax_forward".into(),
            steps: 3,
            elements: 2_000,
            duration_us: 1_000,
        };
        assert_eq!(metrics.elements_per_second(), 2_000_000.0);

        let instant = ExecutionMetrics { duration_us: 0, ..metrics };
        assert_eq!(instant.elements_per_second(), 0.0);
    }

    #[test]
    fn test_plan_metrics_serialize() {
        let metrics = PlanMetrics {
            operation: "softmax_forward".into(),
            shape: "[4, 10]@axis1".into(),
            steps: 1,
            reorders: 0,
            scratch_bytes: 0,
            persistent_bytes: 0,
            duration_us: 12,
        };
        assert!(metrics.is_zero_copy());
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("\"operation\":\"softmax_forward\""));
    }
}
