//! Rank-specialized softmax operator
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──setup_forward──► PlanBuilt ──bind src+dst──► Bound
//!                                                                │ forward
//!                                                                ▼
//!                          GradientReady ◄──backward── Executed
//! ```
//!
//! Rebinding `src` or `dst` returns an instance to `Bound` (or `PlanBuilt`
//! while a role is still unbound) without discarding the compiled plans:
//! plans depend on the shape, never on the buffers. Rebinding a gradient
//! role keeps the forward output valid.
//!
//! # Example
//!
//! ```rust
//! use strata_core::{Engine, Softmax};
//!
//! let engine = Engine::new()?;
//! let mut src = engine.allocate::<f32>(6)?;
//! let dst = engine.allocate::<f32>(6)?;
//! src.copy_from_slice(&engine, &[1.0, 2.0, 3.0, 1.0, 1.0, 1.0])?;
//!
//! let mut softmax = Softmax::<f32>::rank2(&engine, [2, 3], 1)?;
//! softmax.setup_forward()?;
//! softmax.update_user_mem(&src, &dst);
//! softmax.forward()?;
//!
//! let out = dst.to_vec(&engine)?;
//! assert!((out[3..].iter().sum::<f32>() - 1.0).abs() < 1e-6);
//! # engine.free(src)?;
//! # engine.free(dst)?;
//! # Ok::<(), strata_core::Error>(())
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use strata_backends::{MemoryFormat, StreamHandle};
use strata_tracing::perf_span;

use crate::buffer::Buffer;
use crate::element::Element;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::instrumentation::{ExecutionMetrics, PlanMetrics};
use crate::memory::{Authority, MemoryBinding, MemoryKind, UserMemory};
use crate::plan::ExecutionPlan;
use crate::shape::ShapeDescriptor;

/// Closed set of rank specializations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoftmaxVariant {
    /// Batch × classes, caller layout `nc`
    Rank2,
    /// Batch × channel × height × width, caller layout `nchw`
    Rank4,
}

impl SoftmaxVariant {
    pub fn for_rank(rank: usize) -> Result<Self> {
        match rank {
            2 => Ok(SoftmaxVariant::Rank2),
            4 => Ok(SoftmaxVariant::Rank4),
            other => Err(Error::UnsupportedRank(other)),
        }
    }

    pub const fn rank(self) -> usize {
        match self {
            SoftmaxVariant::Rank2 => 2,
            SoftmaxVariant::Rank4 => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SoftmaxVariant::Rank2 => "softmax_rank2",
            SoftmaxVariant::Rank4 => "softmax_rank4",
        }
    }

    /// Layout the caller's buffers are in
    pub const fn user_format(self) -> MemoryFormat {
        match self {
            SoftmaxVariant::Rank2 => MemoryFormat::Nc,
            SoftmaxVariant::Rank4 => MemoryFormat::Nchw,
        }
    }
}

impl fmt::Display for SoftmaxVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorState {
    /// No forward plan yet
    Uninitialized,
    /// Forward plan built, forward I/O not fully bound
    PlanBuilt,
    /// Plan built and `src`/`dst` bound
    Bound,
    /// Forward output valid for the current bindings
    Executed,
    /// Gradient computed from the current forward output
    GradientReady,
}

/// Lifecycle every softmax specialization exposes to the owning framework
///
/// Object safe, so a framework can hold `Box<dyn Layer>` across element types.
pub trait Layer: Send {
    /// Scratch bytes the compiled plans need; 0 is a valid answer
    fn get_res_size(&self) -> Result<usize>;

    /// Build the forward plan; a no-op when already built
    fn setup_forward(&mut self) -> Result<()>;

    /// Build the backward plan; a no-op when already built
    fn setup_backward(&mut self) -> Result<()>;

    fn forward(&mut self) -> Result<()>;

    fn backward(&mut self) -> Result<()>;

    fn shape(&self) -> &ShapeDescriptor;

    fn state(&self) -> OperatorState;
}

/// Softmax operator instance for element type `T`
#[derive(Debug)]
pub struct Softmax<T: Element> {
    engine: Engine,
    shape: ShapeDescriptor,
    variant: SoftmaxVariant,
    binding: MemoryBinding,
    forward_plan: Option<Arc<ExecutionPlan>>,
    backward_plan: Option<Arc<ExecutionPlan>>,
    stream: StreamHandle,
    state: OperatorState,
    _element: PhantomData<T>,
}

impl<T: Element> Softmax<T> {
    /// Create an instance for `dims`, normalizing along `axis`
    ///
    /// Only ranks 2 and 4 are supported. The axis is checked by
    /// [`setup_forward`](Softmax::setup_forward).
    pub fn new(engine: &Engine, dims: impl Into<Vec<usize>>, axis: usize) -> Result<Self> {
        Self::from_shape(engine, ShapeDescriptor::new(dims, axis)?)
    }

    pub fn rank2(engine: &Engine, dims: [usize; 2], axis: usize) -> Result<Self> {
        Self::new(engine, dims, axis)
    }

    pub fn rank4(engine: &Engine, dims: [usize; 4], axis: usize) -> Result<Self> {
        Self::new(engine, dims, axis)
    }

    #[tracing::instrument(skip(engine), fields(shape = %shape))]
    pub fn from_shape(engine: &Engine, shape: ShapeDescriptor) -> Result<Self> {
        let variant = SoftmaxVariant::for_rank(shape.rank())?;
        let stream = engine.create_stream()?;

        tracing::debug!(variant = variant.name(), stream = %stream, "softmax_instance_created");
        Ok(Self {
            engine: engine.clone(),
            shape,
            variant,
            binding: MemoryBinding::new(),
            forward_plan: None,
            backward_plan: None,
            stream,
            state: OperatorState::Uninitialized,
            _element: PhantomData,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn shape(&self) -> &ShapeDescriptor {
        &self.shape
    }

    pub fn variant(&self) -> SoftmaxVariant {
        self.variant
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn binding(&self) -> &MemoryBinding {
        &self.binding
    }

    pub fn forward_plan(&self) -> Option<&Arc<ExecutionPlan>> {
        self.forward_plan.as_ref()
    }

    pub fn backward_plan(&self) -> Option<&Arc<ExecutionPlan>> {
        self.backward_plan.as_ref()
    }

    /// Rebind the caller's source and destination buffers
    ///
    /// Sizes are not checked here; the caller guarantees both hold at least
    /// `shape().numel()` elements. Undersized buffers fail at execution.
    pub fn update_user_mem(&mut self, src: &Buffer<T>, dst: &Buffer<T>) {
        self.bind(MemoryKind::Src, src);
        self.bind(MemoryKind::Dst, dst);
    }

    /// Rebind one role by its integer kind, checking `size` against the shape
    ///
    /// `size` is in elements and must equal the shape's element count; the
    /// buffer must hold at least that many.
    pub fn update_user_data(&mut self, buffer: &Buffer<T>, memory_kind: i32, size: usize) -> Result<()> {
        let kind = MemoryKind::try_from(memory_kind)?;
        let numel = self.shape.numel();
        if size != numel {
            return Err(Error::BufferSizeMismatch {
                expected: numel,
                actual: size,
            });
        }
        if buffer.len() < size {
            return Err(Error::BufferSizeMismatch {
                expected: size,
                actual: buffer.len(),
            });
        }
        self.bind(kind, buffer);
        Ok(())
    }

    /// Bind `buffer` to one role
    pub fn bind(&mut self, kind: MemoryKind, buffer: &Buffer<T>) {
        self.bind_user(kind, UserMemory::from(buffer));
    }

    fn bind_user(&mut self, kind: MemoryKind, memory: UserMemory) {
        let previous = self.binding.bind_user(kind, memory);
        tracing::trace!(
            kind = %kind,
            handle = %memory.handle(),
            previous = ?previous.map(|m| m.handle()),
            "user_memory_bound"
        );

        if kind.is_forward_io() {
            self.refresh_state();
        } else if self.state == OperatorState::GradientReady {
            self.state = OperatorState::Executed;
        }
    }

    fn refresh_state(&mut self) {
        self.state = match (
            self.forward_plan.is_some(),
            self.binding.is_bound(MemoryKind::Src) && self.binding.is_bound(MemoryKind::Dst),
        ) {
            (false, _) => OperatorState::Uninitialized,
            (true, false) => OperatorState::PlanBuilt,
            (true, true) => OperatorState::Bound,
        };
    }

    fn allocate_for(&mut self, plan: &ExecutionPlan) -> Result<()> {
        for &(kind, bytes) in plan.persistent_requirements() {
            self.binding.ensure_persistent(&self.engine, kind, bytes)?;
        }
        // Forward and backward share one scratch buffer sized for the larger
        self.binding.ensure_scratch(&self.engine, plan.scratch_bytes())
    }

    /// Scratch bytes required by the compiled plans
    pub fn get_res_size(&self) -> Result<usize> {
        let forward = self.forward_plan.as_ref().ok_or(Error::NotSetUp {
            operation: "get_res_size",
            required: "setup_forward",
        })?;
        let backward = self.backward_plan.as_ref().map_or(0, |plan| plan.scratch_bytes());
        Ok(forward.scratch_bytes().max(backward))
    }

    /// Build the forward plan, or return the existing one unchanged
    #[tracing::instrument(skip(self), fields(shape = %self.shape, variant = self.variant.name()))]
    pub fn setup_forward(&mut self) -> Result<Arc<ExecutionPlan>> {
        if let Some(plan) = &self.forward_plan {
            return Ok(Arc::clone(plan));
        }

        let start = Instant::now();
        let plan = ExecutionPlan::forward(&self.engine, &self.shape, self.variant.user_format(), T::DATA_TYPE)?;
        self.allocate_for(&plan)?;
        PlanMetrics::from_plan(&plan, start.elapsed()).log();

        let plan = Arc::new(plan);
        self.forward_plan = Some(Arc::clone(&plan));
        if self.state == OperatorState::Uninitialized {
            self.refresh_state();
        }
        Ok(plan)
    }

    /// Build the backward plan, building the forward plan first if needed
    #[tracing::instrument(skip(self), fields(shape = %self.shape, variant = self.variant.name()))]
    pub fn setup_backward(&mut self) -> Result<Arc<ExecutionPlan>> {
        if let Some(plan) = &self.backward_plan {
            return Ok(Arc::clone(plan));
        }

        let forward = self.setup_forward()?;
        let start = Instant::now();
        let plan = ExecutionPlan::backward(
            &self.engine,
            &self.shape,
            self.variant.user_format(),
            T::DATA_TYPE,
            &forward,
        )?;
        self.allocate_for(&plan)?;
        PlanMetrics::from_plan(&plan, start.elapsed()).log();

        let plan = Arc::new(plan);
        self.backward_plan = Some(Arc::clone(&plan));
        Ok(plan)
    }

    /// Run the forward plan against the current bindings
    ///
    /// Blocks until the backend finishes. On failure the instance returns to
    /// `Bound` and the forward output is considered invalid.
    pub fn forward(&mut self) -> Result<()> {
        let plan = self.forward_plan.clone().ok_or(Error::NotSetUp {
            operation: "forward",
            required: "setup_forward",
        })?;

        let start = Instant::now();
        let result = {
            let _span = perf_span!("softmax_forward", elements = self.shape.numel(), steps = plan.steps().len());
            plan.submit(&self.engine, self.stream, &self.binding)
        };

        if let Err(err) = result {
            tracing::debug!(shape = %self.shape, error = %err, "softmax_forward_failed");
            self.refresh_state();
            return Err(err);
        }

        for kind in plan.persistent_outputs() {
            self.binding.set_authority(kind, Authority::Persistent);
        }
        self.state = OperatorState::Executed;
        ExecutionMetrics::new(plan.direction().operation(), plan.steps().len(), self.shape.numel(), start).log();
        Ok(())
    }

    /// Run the backward plan, reading the output of the last forward
    ///
    /// Fails with [`Error::ForwardRequired`] unless a forward succeeded since
    /// `src` or `dst` were last rebound.
    pub fn backward(&mut self) -> Result<()> {
        let plan = self.backward_plan.clone().ok_or(Error::NotSetUp {
            operation: "backward",
            required: "setup_backward",
        })?;
        if !matches!(self.state, OperatorState::Executed | OperatorState::GradientReady) {
            return Err(Error::ForwardRequired);
        }
        if plan.reads_stale_persistent(MemoryKind::Dst) && self.binding.authority(MemoryKind::Dst) != Authority::Persistent
        {
            return Err(Error::ForwardRequired);
        }

        let start = Instant::now();
        let result = {
            let _span = perf_span!("softmax_backward", elements = self.shape.numel(), steps = plan.steps().len());
            plan.submit(&self.engine, self.stream, &self.binding)
        };

        if let Err(err) = result {
            tracing::debug!(shape = %self.shape, error = %err, "softmax_backward_failed");
            self.state = OperatorState::Executed;
            return Err(err);
        }

        for kind in plan.persistent_outputs() {
            self.binding.set_authority(kind, Authority::Persistent);
        }
        self.state = OperatorState::GradientReady;
        ExecutionMetrics::new(plan.direction().operation(), plan.steps().len(), self.shape.numel(), start).log();
        Ok(())
    }
}

impl<T: Element> Layer for Softmax<T> {
    fn get_res_size(&self) -> Result<usize> {
        Softmax::get_res_size(self)
    }

    fn setup_forward(&mut self) -> Result<()> {
        Softmax::setup_forward(self).map(|_| ())
    }

    fn setup_backward(&mut self) -> Result<()> {
        Softmax::setup_backward(self).map(|_| ())
    }

    fn forward(&mut self) -> Result<()> {
        Softmax::forward(self)
    }

    fn backward(&mut self) -> Result<()> {
        Softmax::backward(self)
    }

    fn shape(&self) -> &ShapeDescriptor {
        &self.shape
    }

    fn state(&self) -> OperatorState {
        self.state
    }
}

impl<T: Element> Drop for Softmax<T> {
    fn drop(&mut self) {
        // Persistent buffers release themselves with the binding
        if let Err(err) = self.engine.destroy_stream(self.stream) {
            tracing::warn!(stream = %self.stream, error = %err, "failed to destroy softmax stream");
        }
    }
}
