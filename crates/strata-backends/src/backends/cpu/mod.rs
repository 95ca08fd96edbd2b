//! CPU backend implementation
//!
//! Reference implementation of the Backend trait for CPU execution.
//!
//! # Architecture
//!
//! ```text
//! CpuBackend
//! ├── MemoryManager   - Buffers + streams, each behind its own lock
//! ├── PrimitiveCache  - Compiled primitives keyed by descriptor
//! └── Kernels         - Softmax forward/backward and reorder, rayon for contiguous rows
//! ```
//!
//! # Concurrency
//!
//! Every entry point takes `&self`. An execution holds only its stream's
//! lock for its duration and each buffer's lock while that buffer is copied,
//! so submissions on different streams run in parallel and compiling or
//! allocating never waits for a running kernel.
//!
//! # Layout negotiation
//!
//! Rank-2 softmax always runs on `nc`. Rank-4 softmax prefers the
//! channel-blocked `nChw{b}c` layout when a channel block is configured and
//! divides the channel count, and falls back to `nchw` otherwise. Backward
//! reuses whatever layout the forward primitive settled on.

mod kernels;
pub(crate) mod memory;

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strata_tracing::perf_span;

use crate::backend::{Backend, BufferHandle, Step, StreamHandle};
use crate::desc::{MemoryFormat, OpDesc, PrimitiveDesc};
use crate::error::{BackendError, Result};
use crate::primitive::Primitive;
use crate::primitive_cache::{PrimitiveCache, PrimitiveKey};
use kernels::{Kernel, RunOptions};
use memory::MemoryManager;

/// Default number of logical elements above which contiguous rows run on rayon
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 15;

/// Default channel block for rank-4 layouts
pub const DEFAULT_CHANNEL_BLOCK: usize = 8;

/// Tunables of the CPU backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuBackendConfig {
    /// Channel block for rank-4 softmax; `None` keeps everything in `nchw`
    pub channel_block: Option<usize>,
    /// Fail executions that produce NaN or infinity
    pub check_numerics: bool,
    /// Minimum element count for the parallel row path
    pub parallel_threshold: usize,
}

impl Default for CpuBackendConfig {
    fn default() -> Self {
        Self {
            channel_block: Some(DEFAULT_CHANNEL_BLOCK),
            check_numerics: true,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

impl CpuBackendConfig {
    /// Defaults overridden by `STRATA_CPU_CHANNEL_BLOCK` (`0` or `none`
    /// disables blocking), `STRATA_CPU_CHECK_NUMERICS` and
    /// `STRATA_CPU_PARALLEL_THRESHOLD`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(block) = env::var("STRATA_CPU_CHANNEL_BLOCK") {
            let block = block.trim();
            if block.eq_ignore_ascii_case("none") || block == "0" {
                config.channel_block = None;
            } else if let Ok(parsed) = block.parse::<usize>() {
                config.channel_block = Some(parsed);
            }
        }

        if let Ok(check) = env::var("STRATA_CPU_CHECK_NUMERICS") {
            config.check_numerics =
                check.eq_ignore_ascii_case("true") || check == "1" || check.eq_ignore_ascii_case("yes");
        }

        if let Ok(threshold) = env::var("STRATA_CPU_PARALLEL_THRESHOLD") {
            if let Ok(parsed) = threshold.trim().parse::<usize>() {
                config.parallel_threshold = parsed;
            }
        }

        config
    }
}

/// Counters exposed by [`CpuBackend::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuBackendStats {
    /// Primitives compiled from scratch
    pub compiled: u64,
    /// Compile requests served from the primitive cache
    pub cache_hits: u64,
    /// Steps executed across all streams
    pub executed_steps: u64,
}

#[derive(Default)]
struct StatCounters {
    compiled: AtomicU64,
    cache_hits: AtomicU64,
    executed_steps: AtomicU64,
}

/// CPU backend for executing softmax primitives
pub struct CpuBackend {
    config: CpuBackendConfig,
    /// Memory manager (buffers, streams)
    memory: MemoryManager,
    primitives: PrimitiveCache,
    kernels: RwLock<HashMap<u64, Arc<Kernel>>>,
    next_primitive_id: AtomicU64,
    stats: StatCounters,
}

impl CpuBackend {
    /// Create a CPU backend with the default configuration
    ///
    /// # Example
    ///
    /// ```rust
    /// use strata_backends::CpuBackend;
    ///
    /// let backend = CpuBackend::new();
    /// ```
    pub fn new() -> Self {
        Self::with_config(CpuBackendConfig::default())
    }

    pub fn with_config(config: CpuBackendConfig) -> Self {
        Self {
            config,
            memory: MemoryManager::new(),
            primitives: PrimitiveCache::new(),
            kernels: RwLock::new(HashMap::new()),
            next_primitive_id: AtomicU64::new(1),
            stats: StatCounters::default(),
        }
    }

    pub fn config(&self) -> &CpuBackendConfig {
        &self.config
    }

    pub fn stats(&self) -> CpuBackendStats {
        CpuBackendStats {
            compiled: self.stats.compiled.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            executed_steps: self.stats.executed_steps.load(Ordering::Relaxed),
        }
    }

    /// Number of live buffers
    pub fn buffer_count(&self) -> usize {
        self.memory.buffer_count()
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.memory.stream_count()
    }

    fn kernel(&self, primitive: &Primitive) -> Result<Arc<Kernel>> {
        self.kernels.read().get(&primitive.id()).map(Arc::clone).ok_or_else(|| {
            BackendError::execution_error(format!("primitive {primitive} was not compiled by this backend"))
        })
    }

    /// Layout this backend picks for a softmax over `dims` when asked for `any`
    fn preferred_format(&self, dims: &[usize]) -> MemoryFormat {
        match (dims.len(), self.config.channel_block) {
            (4, Some(block)) if block > 1 && dims[1] % block == 0 => MemoryFormat::NChwXc(block),
            (rank, _) => MemoryFormat::plain_for_rank(rank),
        }
    }

    fn negotiate(&self, op: &OpDesc, hint: Option<&PrimitiveDesc>) -> Result<OpDesc> {
        match op {
            OpDesc::SoftmaxForward { prop_kind, data, axis } => {
                let format = match data.format() {
                    MemoryFormat::Any => self.preferred_format(data.dims()),
                    format => format,
                };
                OpDesc::softmax_forward(*prop_kind, data.with_format(format)?, *axis)
            }
            OpDesc::SoftmaxBackward { data, diff, axis } => {
                let forward_format = match hint.map(PrimitiveDesc::op) {
                    None => None,
                    Some(OpDesc::SoftmaxForward {
                        data: forward,
                        axis: forward_axis,
                        ..
                    }) if forward.is_compatible(data) && forward_axis == axis => Some(forward.format()),
                    Some(other) => {
                        return Err(BackendError::invalid_descriptor(format!(
                            "backward hint must be the matching forward softmax, got {other}"
                        )))
                    }
                };

                let data_format = match data.format() {
                    MemoryFormat::Any => forward_format.unwrap_or_else(|| self.preferred_format(data.dims())),
                    format => format,
                };
                let diff_format = match diff.format() {
                    MemoryFormat::Any => data_format,
                    format => format,
                };
                OpDesc::softmax_backward(data.with_format(data_format)?, diff.with_format(diff_format)?, *axis)
            }
            OpDesc::Reorder { src, dst } => OpDesc::reorder(src.clone(), dst.clone()),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn primitive_desc(&self, op: &OpDesc, hint: Option<&PrimitiveDesc>) -> Result<PrimitiveDesc> {
        let negotiated = self.negotiate(op, hint)?;
        let scratchpad = kernels::scratchpad_bytes(&negotiated);
        tracing::trace!(op = %negotiated, scratchpad, "cpu_primitive_desc");
        PrimitiveDesc::new(negotiated, scratchpad)
    }

    fn compile(&self, pd: &PrimitiveDesc) -> Result<Arc<Primitive>> {
        let key = PrimitiveKey::new(pd);
        let mut built = None;

        let (primitive, hit) = self.primitives.get_or_try_create(&key, || {
            let kernel = Kernel::build(pd)?;
            let id = self.next_primitive_id.fetch_add(1, Ordering::Relaxed);
            self.kernels.write().insert(id, Arc::new(kernel));
            built = Some(id);
            Ok(Primitive::new(id, pd.clone()))
        })?;

        // Another thread compiled the same descriptor first
        if let Some(id) = built.filter(|&id| id != primitive.id()) {
            self.kernels.write().remove(&id);
        }

        let counter = if hit { &self.stats.cache_hits } else { &self.stats.compiled };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(primitive = %primitive, cache_hit = hit, "cpu_compile");
        Ok(primitive)
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        Ok(self.memory.create_stream())
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.memory.destroy_stream(stream)
    }

    fn execute(&self, stream: StreamHandle, steps: &[Step]) -> Result<()> {
        let options = RunOptions {
            check_numerics: self.config.check_numerics,
            parallel_threshold: self.config.parallel_threshold,
        };
        let stream_state = self.memory.stream(stream)?;
        let mut state = stream_state.lock();

        for step in steps {
            let primitive = &step.primitive;
            let kernel = self.kernel(primitive)?;

            let _span = perf_span!("cpu_execute_step", primitive = primitive.name(), elements = kernel.elements());
            kernel.run(primitive.name(), &self.memory, &step.args, options)?;

            state.executed_steps += 1;
            self.stats.executed_steps.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    fn allocate_buffer(&self, size: usize) -> Result<BufferHandle> {
        self.memory.allocate_buffer(size)
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.memory.free_buffer(handle)
    }

    fn copy_to_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.memory.copy_to_buffer(handle, data)
    }

    fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        self.memory.copy_from_buffer(handle, data)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.buffer_size(handle)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArgRole, ExecArgs};
    use crate::desc::{DataType, MemoryDesc, PropKind};

    fn any(dims: &[usize]) -> MemoryDesc {
        MemoryDesc::new(dims.to_vec(), DataType::F32, MemoryFormat::Any).unwrap()
    }

    fn upload(backend: &CpuBackend, data: &[f32]) -> BufferHandle {
        let buf = backend.allocate_buffer(data.len() * 4).unwrap();
        backend.copy_to_buffer(buf, bytemuck::cast_slice(data)).unwrap();
        buf
    }

    fn download(backend: &CpuBackend, buf: BufferHandle, len: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; len];
        backend.copy_from_buffer(buf, bytemuck::cast_slice_mut(&mut out)).unwrap();
        out
    }

    #[test]
    fn negotiates_layout_by_rank() {
        let backend = CpuBackend::new();
        let fwd = |dims: &[usize], axis| {
            let op = OpDesc::softmax_forward(PropKind::ForwardTraining, any(dims), axis).unwrap();
            backend.primitive_desc(&op, None).unwrap()
        };

        assert_eq!(fwd(&[4, 10], 1).dst_desc().format(), MemoryFormat::Nc);
        assert_eq!(fwd(&[2, 16, 3, 3], 1).dst_desc().format(), MemoryFormat::NChwXc(8));
        assert_eq!(fwd(&[2, 3, 4, 5], 1).dst_desc().format(), MemoryFormat::Nchw);
        assert_eq!(fwd(&[6], 0).dst_desc().format(), MemoryFormat::Plain);

        let unblocked = CpuBackend::with_config(CpuBackendConfig {
            channel_block: None,
            ..CpuBackendConfig::default()
        });
        let op = OpDesc::softmax_forward(PropKind::ForwardTraining, any(&[2, 16, 3, 3]), 1).unwrap();
        assert_eq!(
            unblocked.primitive_desc(&op, None).unwrap().dst_desc().format(),
            MemoryFormat::Nchw
        );
    }

    #[test]
    fn backward_follows_forward_hint() {
        let backend = CpuBackend::new();
        let op = OpDesc::softmax_forward(PropKind::ForwardTraining, any(&[1, 8, 2, 2]), 2).unwrap();
        let fwd = backend.primitive_desc(&op, None).unwrap();

        let bwd_op = OpDesc::softmax_backward(any(&[1, 8, 2, 2]), any(&[1, 8, 2, 2]), 2).unwrap();
        let bwd = backend.primitive_desc(&bwd_op, Some(&fwd)).unwrap();
        assert_eq!(bwd.dst_desc().format(), MemoryFormat::NChwXc(8));
        assert_eq!(bwd.diff_desc().map(MemoryDesc::format), Some(MemoryFormat::NChwXc(8)));
        assert_eq!(bwd.scratchpad_bytes(), 2 * 4);

        let wrong_axis = OpDesc::softmax_backward(any(&[1, 8, 2, 2]), any(&[1, 8, 2, 2]), 1).unwrap();
        assert!(backend.primitive_desc(&wrong_axis, Some(&fwd)).is_err());
    }

    #[test]
    fn compile_reuses_primitives() {
        let backend = CpuBackend::new();
        let op = OpDesc::softmax_forward(PropKind::ForwardTraining, any(&[2, 3]), 1).unwrap();
        let pd = backend.primitive_desc(&op, None).unwrap();

        let a = backend.compile(&pd).unwrap();
        let b = backend.compile(&pd).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.stats().compiled, 1);
        assert_eq!(backend.stats().cache_hits, 1);
    }

    #[test]
    fn executes_row_softmax() {
        let backend = CpuBackend::new();
        let op = OpDesc::softmax_forward(PropKind::ForwardInference, any(&[2, 3]), 1).unwrap();
        let pd = backend.primitive_desc(&op, None).unwrap();
        let primitive = backend.compile(&pd).unwrap();

        let src = upload(&backend, &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let dst = backend.allocate_buffer(24).unwrap();
        let stream = backend.create_stream().unwrap();
        let args = ExecArgs::new().with(ArgRole::Src, src).with(ArgRole::Dst, dst);
        backend.execute(stream, &[Step::new(primitive, args)]).unwrap();

        let out = download(&backend, dst, 6);
        let row0: f32 = out[..3].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
        for v in &out[3..] {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
        assert_eq!(backend.stats().executed_steps, 1);
    }

    #[test]
    fn reorder_round_trips_through_blocked_layout() {
        let backend = CpuBackend::new();
        let dims = vec![1, 8, 1, 2];
        let plain = MemoryDesc::plain(dims.clone(), DataType::F32).unwrap();
        let blocked = plain.with_format(MemoryFormat::NChwXc(8)).unwrap();

        let to_blocked = backend
            .primitive_desc(&OpDesc::reorder(plain.clone(), blocked.clone()).unwrap(), None)
            .unwrap();
        let to_plain = backend
            .primitive_desc(&OpDesc::reorder(blocked.clone(), plain.clone()).unwrap(), None)
            .unwrap();
        let to_blocked = backend.compile(&to_blocked).unwrap();
        let to_plain = backend.compile(&to_plain).unwrap();

        let input: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let src = upload(&backend, &input);
        let mid = backend.allocate_buffer(blocked.size_bytes()).unwrap();
        let back = backend.allocate_buffer(plain.size_bytes()).unwrap();
        let stream = backend.create_stream().unwrap();

        backend
            .execute(
                stream,
                &[
                    Step::new(to_blocked, ExecArgs::new().with(ArgRole::Src, src).with(ArgRole::Dst, mid)),
                    Step::new(to_plain, ExecArgs::new().with(ArgRole::Src, mid).with(ArgRole::Dst, back)),
                ],
            )
            .unwrap();

        // w-major with channels innermost
        let blocked_data = download(&backend, mid, 16);
        assert_eq!(&blocked_data[..3], &[0.0, 2.0, 4.0]);
        assert_eq!(download(&backend, back, 16), input);
    }

    #[test]
    fn missing_argument_and_bad_stream_are_reported() {
        let backend = CpuBackend::new();
        let op = OpDesc::softmax_forward(PropKind::ForwardInference, any(&[1, 3]), 1).unwrap();
        let pd = backend.primitive_desc(&op, None).unwrap();
        let primitive = backend.compile(&pd).unwrap();
        let src = upload(&backend, &[0.0; 3]);
        let stream = backend.create_stream().unwrap();

        let step = Step::new(Arc::clone(&primitive), ExecArgs::new().with(ArgRole::Src, src));
        assert!(matches!(
            backend.execute(stream, &[step.clone()]),
            Err(BackendError::MissingArgument { role: ArgRole::Dst, .. })
        ));

        backend.destroy_stream(stream).unwrap();
        assert!(matches!(
            backend.execute(stream, &[step]),
            Err(BackendError::InvalidStreamHandle(_))
        ));
    }

    #[test]
    fn undersized_destination_is_rejected() {
        let backend = CpuBackend::new();
        let op = OpDesc::softmax_forward(PropKind::ForwardInference, any(&[2, 3]), 1).unwrap();
        let pd = backend.primitive_desc(&op, None).unwrap();
        let primitive = backend.compile(&pd).unwrap();
        let src = upload(&backend, &[0.0; 6]);
        let dst = backend.allocate_buffer(8).unwrap();
        let stream = backend.create_stream().unwrap();

        let args = ExecArgs::new().with(ArgRole::Src, src).with(ArgRole::Dst, dst);
        assert!(matches!(
            backend.execute(stream, &[Step::new(primitive, args)]),
            Err(BackendError::BufferOutOfBounds { .. })
        ));
    }

    #[test]
    fn non_finite_output_raises_numeric_exception() {
        let backend = CpuBackend::new();
        let op = OpDesc::softmax_forward(PropKind::ForwardInference, any(&[1, 3]), 1).unwrap();
        let pd = backend.primitive_desc(&op, None).unwrap();
        let primitive = backend.compile(&pd).unwrap();
        let src = upload(&backend, &[0.0, f32::NAN, 1.0]);
        let dst = backend.allocate_buffer(12).unwrap();
        let stream = backend.create_stream().unwrap();

        let args = ExecArgs::new().with(ArgRole::Src, src).with(ArgRole::Dst, dst);
        assert!(matches!(
            backend.execute(stream, &[Step::new(primitive, args)]),
            Err(BackendError::NumericException { .. })
        ));
    }

    #[test]
    fn busy_stream_does_not_block_other_streams() {
        let backend = Arc::new(CpuBackend::new());
        let op = OpDesc::softmax_forward(PropKind::ForwardInference, any(&[2, 4]), 1).unwrap();
        let pd = backend.primitive_desc(&op, None).unwrap();
        let primitive = backend.compile(&pd).unwrap();

        // An execution holds its stream's lock for its whole duration
        let busy = backend.create_stream().unwrap();
        let busy_state = backend.memory.stream(busy).unwrap();
        let in_flight = busy_state.lock();

        let (done, finished) = std::sync::mpsc::channel();
        let worker = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || {
                let other = backend.create_stream().unwrap();
                let wider = OpDesc::softmax_forward(PropKind::ForwardInference, any(&[2, 6]), 1).unwrap();
                backend.compile(&backend.primitive_desc(&wider, None).unwrap()).unwrap();

                let src = upload(&backend, &[0.0; 8]);
                let dst = backend.allocate_buffer(32).unwrap();
                let args = ExecArgs::new().with(ArgRole::Src, src).with(ArgRole::Dst, dst);
                backend.execute(other, &[Step::new(primitive, args)]).unwrap();
                done.send(download(&backend, dst, 8)).unwrap();
            })
        };

        let out = finished
            .recv_timeout(std::time::Duration::from_secs(30))
            .expect("work on another stream waited for the busy stream");
        assert!(out.iter().all(|v| (v - 0.25).abs() < 1e-6));
        drop(in_flight);
        worker.join().unwrap();
        assert_eq!(backend.stats().compiled, 2);
    }

    #[test]
    fn racing_compiles_keep_one_kernel() {
        let backend = Arc::new(CpuBackend::new());
        let op = OpDesc::softmax_forward(PropKind::ForwardTraining, any(&[4, 4, 4, 4]), 2).unwrap();
        let pd = backend.primitive_desc(&op, None).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backend = Arc::clone(&backend);
                let pd = pd.clone();
                std::thread::spawn(move || backend.compile(&pd).unwrap())
            })
            .collect();
        let primitives: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(primitives.iter().all(|p| Arc::ptr_eq(p, &primitives[0])));
        assert_eq!(backend.kernels.read().len(), 1);
    }
}
