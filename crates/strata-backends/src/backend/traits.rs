//! Backend trait for primitive execution
//!
//! This trait defines the interface that all backends must implement.
//! A backend negotiates memory layouts, compiles primitives for the
//! negotiated descriptors, owns device buffers and runs primitive sequences
//! on streams.
//!
//! Every method takes `&self`: backends synchronize internally, per stream
//! and per buffer, so callers share one backend across threads without an
//! outer lock and work on different streams proceeds in parallel.

use std::sync::Arc;

use super::types::{BufferHandle, Step, StreamHandle};
use crate::desc::{OpDesc, PrimitiveDesc};
use crate::error::Result;
use crate::primitive::Primitive;

/// Backend trait for primitive execution
///
/// # Architecture
///
/// ```text
/// ┌─────────────────────────────────────────────────────────┐
/// │                     Backend Trait                        │
/// │  - primitive_desc() / compile()                          │
/// │  - Stream management (create/destroy)                    │
/// │  - execute()                                             │
/// │  - Buffer management (allocate/free/copy)                │
/// └─────────────────────┬───────────────────────────────────┘
///                       │
///                       ▼
///                 ┌─────────┐
///                 │   CPU   │
///                 │ Backend │
///                 └─────────┘
/// ```
///
/// # Usage
///
/// ```rust
/// use strata_backends::{ArgRole, Backend, CpuBackend, DataType, ExecArgs, MemoryDesc, OpDesc, PropKind, Step};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = CpuBackend::new();
///
/// let data = MemoryDesc::plain(vec![1, 3], DataType::F32)?;
/// let op = OpDesc::softmax_forward(PropKind::ForwardInference, data, 1)?;
/// let pd = backend.primitive_desc(&op, None)?;
/// let primitive = backend.compile(&pd)?;
///
/// let src = backend.allocate_buffer(12)?;
/// let dst = backend.allocate_buffer(12)?;
/// backend.copy_to_buffer(src, bytemuck::cast_slice(&[1.0f32, 1.0, 1.0]))?;
///
/// let stream = backend.create_stream()?;
/// let args = ExecArgs::new().with(ArgRole::Src, src).with(ArgRole::Dst, dst);
/// backend.execute(stream, &[Step::new(primitive, args)])?;
///
/// let mut out = [0.0f32; 3];
/// backend.copy_from_buffer(dst, bytemuck::cast_slice_mut(&mut out))?;
/// assert!((out[0] - 1.0 / 3.0).abs() < 1e-6);
/// # Ok(())
/// # }
/// ```
pub trait Backend {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    // ============================================================================================
    // Descriptor Negotiation and Compilation
    // ============================================================================================

    /// Resolve every `Any` layout in `op` and compute the scratchpad size
    ///
    /// `hint` is a previously negotiated forward primitive; backward
    /// negotiation uses it to agree with the forward layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation is malformed or not supported.
    fn primitive_desc(&self, op: &OpDesc, hint: Option<&PrimitiveDesc>) -> Result<PrimitiveDesc>;

    /// Compile a negotiated descriptor into an executable primitive
    ///
    /// Compiling the same descriptor twice may return the same primitive.
    fn compile(&self, pd: &PrimitiveDesc) -> Result<Arc<Primitive>>;

    // ============================================================================================
    // Streams and Execution
    // ============================================================================================

    /// Create an execution stream
    fn create_stream(&self) -> Result<StreamHandle>;

    /// Destroy a stream created by [`create_stream`](Backend::create_stream)
    ///
    /// # Errors
    ///
    /// Returns an error if the stream handle is invalid.
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Run `steps` in order on `stream` and wait for completion
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The stream handle is invalid
    /// - A step is missing a required argument or references an invalid buffer
    /// - A bound buffer is smaller than the primitive's descriptor requires
    /// - A primitive produces a non-finite value (when the backend checks)
    fn execute(&self, stream: StreamHandle, steps: &[Step]) -> Result<()>;

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    /// Allocate a zero-initialized buffer of the given size in bytes
    fn allocate_buffer(&self, size: usize) -> Result<BufferHandle>;

    /// Free a previously allocated buffer
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer handle is invalid.
    fn free_buffer(&self, handle: BufferHandle) -> Result<()>;

    /// Copy data from host to buffer
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Buffer handle is invalid
    /// - Data size exceeds buffer size
    fn copy_to_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()>;

    /// Copy data from buffer to host
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Buffer handle is invalid
    /// - Data size exceeds buffer size
    fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()>;

    /// Get buffer size in bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer handle is invalid.
    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    // ============================================================================================
    // Type Introspection
    // ============================================================================================

    /// Downcast backend to &dyn Any for type-specific access
    fn as_any(&self) -> &dyn std::any::Any;
}
