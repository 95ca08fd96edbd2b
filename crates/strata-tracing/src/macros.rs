//! Convenience macros for performance tracing

#[doc(hidden)]
pub use tracing as __tracing;

/// Create a [`crate::performance::PerformanceSpan`] with optional fields.
///
/// ```rust
/// use strata_tracing::perf_span;
///
/// {
///     let _span = perf_span!("softmax_forward", elements = 1024, steps = 3);
///     // ... operation code ...
/// } // logs duration with fields
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = $crate::macros::__tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a debug-level performance event.
///
/// ```rust
/// use strata_tracing::perf_event;
///
/// perf_event!("persistent_buffer_allocated", bytes = 4096, kind = "src");
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::macros::__tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}
