//! Engine for managing backend execution
//!
//! The `Engine` wraps a `strata-backends::Backend` and provides buffer
//! allocation plus the negotiation, compilation and submission calls the
//! plan builder needs. It is a cheap, cloneable handle: every operator
//! instance and the instance cache hold a clone of the same engine.
//!
//! The engine adds no locking of its own. Backends synchronize per stream
//! and per buffer, so operators on different streams compile, allocate and
//! execute without waiting on each other.
//!
//! ## Architecture
//!
//! ```text
//! strata-core::Engine
//!   ↓ delegates to
//! strata-backends::Backend (CpuBackend, ...)
//!   ↓ executes
//! Compiled primitives on backend streams
//! ```

use std::env;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_backends::{
    Backend, BufferHandle, CpuBackend, CpuBackendConfig, OpDesc, Primitive, PrimitiveDesc, Step, StreamHandle,
};

use crate::buffer::Buffer;
use crate::element::Element;
use crate::error::{BackendPhase, Error, Result};

/// Backend type for engine initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    /// CPU backend (always available)
    Cpu,
}

impl BackendType {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub backend: BackendType,
    pub cpu: CpuBackendConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Cpu,
            cpu: CpuBackendConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read `STRATA_BACKEND` plus the CPU backend variables
    /// (see [`CpuBackendConfig::from_env`]).
    pub fn from_env() -> Self {
        let mut config = Self {
            backend: BackendType::Cpu,
            cpu: CpuBackendConfig::from_env(),
        };

        if let Ok(value) = env::var("STRATA_BACKEND") {
            match BackendType::from_env_value(&value) {
                Some(backend) => config.backend = backend,
                None => tracing::warn!(value = %value, "unknown STRATA_BACKEND, using cpu"),
            }
        }

        config
    }
}

/// Shared handle to a backend
///
/// # Example
///
/// ```rust
/// use strata_core::Engine;
///
/// let engine = Engine::new()?;
/// let mut buf = engine.allocate::<f32>(4)?;
/// buf.copy_from_slice(&engine, &[1.0, 2.0, 3.0, 4.0])?;
/// assert_eq!(buf.to_vec(&engine)?, vec![1.0, 2.0, 3.0, 4.0]);
/// engine.free(buf)?;
/// # Ok::<(), strata_core::Error>(())
/// ```
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn Backend + Send + Sync>,
    backend_name: &'static str,
}

impl Engine {
    /// Create an engine from the environment configuration
    #[tracing::instrument]
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::from_env())
    }

    #[tracing::instrument]
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let start = std::time::Instant::now();

        let backend: Box<dyn Backend + Send + Sync> = match config.backend {
            BackendType::Cpu => Box::new(CpuBackend::with_config(config.cpu)),
        };
        let engine = Self::with_backend(backend);

        tracing::debug!(
            duration_us = start.elapsed().as_micros() as u64,
            backend = engine.backend_name,
            "engine_created"
        );
        Ok(engine)
    }

    /// Wrap an already constructed backend
    pub fn with_backend(backend: Box<dyn Backend + Send + Sync>) -> Self {
        let backend_name = backend.name();
        Self {
            backend: Arc::from(backend),
            backend_name,
        }
    }

    /// Get shared access to the backend
    pub fn backend(&self) -> Arc<dyn Backend + Send + Sync> {
        Arc::clone(&self.backend)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Run `f` against the backend if it is a [`CpuBackend`]
    pub fn with_cpu_backend<R>(&self, f: impl FnOnce(&CpuBackend) -> R) -> Option<R> {
        self.backend.as_any().downcast_ref::<CpuBackend>().map(f)
    }

    /// Allocate a zeroed buffer of `len` elements
    #[tracing::instrument(skip(self), fields(
        len = len,
        elem_size = std::mem::size_of::<T>(),
        type_name = std::any::type_name::<T>()
    ))]
    pub fn allocate<T: Element>(&self, len: usize) -> Result<Buffer<T>> {
        let size_bytes = len.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            Error::InvalidShape(format!(
                "{len} elements of {} overflow the addressable size",
                std::any::type_name::<T>()
            ))
        })?;
        let handle = self.allocate_bytes(size_bytes)?;

        tracing::debug!(handle = %handle, size_bytes = size_bytes, "buffer_allocated");
        Ok(Buffer::new(handle, len))
    }

    /// Release a buffer allocated by [`allocate`](Engine::allocate)
    pub fn free<T: Element>(&self, buffer: Buffer<T>) -> Result<()> {
        self.free_handle(buffer.handle())
    }

    pub(crate) fn allocate_bytes(&self, size: usize) -> Result<BufferHandle> {
        self.backend
            .allocate_buffer(size)
            .map_err(Error::backend(BackendPhase::Memory))
    }

    pub(crate) fn free_handle(&self, handle: BufferHandle) -> Result<()> {
        self.backend
            .free_buffer(handle)
            .map_err(Error::backend(BackendPhase::Memory))
    }

    pub(crate) fn write_bytes(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.backend
            .copy_to_buffer(handle, data)
            .map_err(Error::backend(BackendPhase::Memory))
    }

    pub(crate) fn read_bytes(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        self.backend
            .copy_from_buffer(handle, data)
            .map_err(Error::backend(BackendPhase::Memory))
    }

    pub(crate) fn primitive_desc(&self, op: &OpDesc, hint: Option<&PrimitiveDesc>) -> Result<PrimitiveDesc> {
        self.backend
            .primitive_desc(op, hint)
            .map_err(Error::backend(BackendPhase::Compile))
    }

    pub(crate) fn compile(&self, pd: &PrimitiveDesc) -> Result<Arc<Primitive>> {
        self.backend
            .compile(pd)
            .map_err(Error::backend(BackendPhase::Compile))
    }

    pub(crate) fn create_stream(&self) -> Result<StreamHandle> {
        self.backend
            .create_stream()
            .map_err(Error::backend(BackendPhase::Memory))
    }

    pub(crate) fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.backend
            .destroy_stream(stream)
            .map_err(Error::backend(BackendPhase::Memory))
    }

    pub(crate) fn execute(&self, stream: StreamHandle, steps: &[Step]) -> Result<()> {
        self.backend
            .execute(stream, steps)
            .map_err(Error::backend(BackendPhase::Execute))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").field("backend", &self.backend_name).finish()
    }
}
