//! Performance-focused tracing utilities
//!
//! Timing guards and standard events for plan construction, primitive
//! execution and host/backend transfers.
//!
//! ```rust
//! use strata_tracing::performance::{record_plan_build, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("softmax_setup_forward", Some(100));
//! // ... build the plan ...
//! drop(span); // logged only if it took at least 100μs
//!
//! record_plan_build("softmax_forward", 3, 2, 0, 42);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);

// u64::MAX encodes "no threshold".
static DEFAULT_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Set the process-wide performance tracing switches.
///
/// Called by [`crate::init_global_tracing`]; spans created while disabled
/// never emit their completion event.
pub fn configure(enabled: bool, default_threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    DEFAULT_THRESHOLD_US.store(default_threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently emit events.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn default_threshold() -> Option<u64> {
    match DEFAULT_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        threshold => Some(threshold),
    }
}

/// RAII guard that measures its own lifetime and logs it on drop.
///
/// ```rust
/// use strata_tracing::performance::PerformanceSpan;
///
/// {
///     let _span = PerformanceSpan::new("softmax_forward", None);
///     // ... execute ...
/// } // duration logged here
/// ```
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a debug-level span. `threshold_us` falls back to the configured
    /// default when `None`.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a span at the given level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us: threshold_us.or_else(default_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since creation.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record the construction of an execution plan.
///
/// * `operation` - plan name (`softmax_forward`, `softmax_backward`)
/// * `steps` - primitives in the finalized sequence
/// * `reorders` - layout-conversion steps among them
/// * `scratch_bytes` - backend scratchpad requirement
/// * `duration_us` - build time
pub fn record_plan_build(operation: &str, steps: usize, reorders: usize, scratch_bytes: usize, duration_us: u64) {
    tracing::debug!(
        event = "plan_build",
        operation = operation,
        steps = steps,
        reorders = reorders,
        zero_copy = reorders == 0,
        scratch_bytes = scratch_bytes,
        duration_us = duration_us,
        "execution_plan_built"
    );
}

/// Record a synchronous stream submission.
pub fn record_execution(operation: &str, steps: usize, elements: usize, duration_us: u64) {
    let elements_per_sec = if duration_us > 0 {
        (elements as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };

    tracing::debug!(
        event = "execution",
        operation = operation,
        steps = steps,
        elements = elements,
        duration_us = duration_us,
        duration_ms = duration_us as f64 / 1000.0,
        melems_per_sec = elements_per_sec / 1_000_000.0,
        "stream_execution"
    );
}

/// Record a host/backend transfer.
///
/// `direction` is `"H2D"` (host to backend) or `"D2H"`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}
