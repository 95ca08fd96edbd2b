//! # strata-core - Softmax Execution Layer
//!
//! Turns "softmax along axis A of a tensor with shape D" into a compiled,
//! reusable execution plan on a `strata-backends` backend, and manages the
//! buffers that feed it across repeated calls.
//!
//! ## Architecture
//!
//! ```text
//! InstanceCache ── context key ──► Softmax<T> (rank-2 | rank-4)
//!                                     ├── ShapeDescriptor (dims, axis)
//!                                     ├── MemoryBinding   (user views, persistent buffers, scratch)
//!                                     └── ExecutionPlan   (forward, backward)
//!                                            │ submit
//!                                            ▼
//!                                   Engine ──► Backend stream
//! ```
//!
//! ### Plans
//!
//! - **Built once**: `setup_forward`/`setup_backward` negotiate layouts and
//!   compile; later calls return the same plan
//! - **Zero-copy when possible**: reorder steps appear only when the backend
//!   computes in a layout other than the caller's
//! - **Buffer-independent**: rebinding user memory never rebuilds a plan
//!
//! ### Memory
//!
//! - **User memory**: caller-owned [`Buffer`]s, borrowed until the next rebind
//! - **Persistent memory**: owned by the instance, released on drop
//!
//! ## Example
//!
//! ```rust
//! use strata_core::{Engine, InstanceCache};
//!
//! let engine = Engine::new()?;
//! let cache = InstanceCache::<f32>::new(&engine);
//!
//! let mut src = engine.allocate::<f32>(2 * 8 * 2 * 2)?;
//! let dst = engine.allocate::<f32>(2 * 8 * 2 * 2)?;
//! src.copy_from_slice(&engine, &vec![0.5; 64])?;
//!
//! let op = cache.create_forward("stream-0", &src, &dst, [2, 8, 2, 2], 1)?;
//! op.lock().forward()?;
//!
//! let out = dst.to_vec(&engine)?;
//! assert!((out[0] - 0.125).abs() < 1e-6);
//! # drop(op);
//! # cache.clear();
//! # engine.free(src)?;
//! # engine.free(dst)?;
//! # Ok::<(), strata_core::Error>(())
//! ```

pub mod buffer;
pub mod cache;
pub mod element;
pub mod engine;
pub mod error;
pub mod functional;
pub mod instrumentation;
pub mod memory;
pub mod plan;
pub mod shape;
pub mod softmax;

// Re-export primary types
pub use buffer::Buffer;
pub use cache::{InstanceCache, SharedSoftmax};
pub use element::Element;
pub use engine::{BackendType, Engine, EngineConfig};
pub use error::{BackendPhase, Error, ErrorKind, Result};
pub use instrumentation::{ExecutionMetrics, PlanMetrics};
pub use memory::{Authority, MemoryBinding, MemoryKind, PersistentMemory, Slot, UserMemory};
pub use plan::{Direction, ExecutionPlan, LayoutDecision, PlanSummary, PlannedStep, StepSummary};
pub use shape::ShapeDescriptor;
pub use softmax::{Layer, OperatorState, Softmax, SoftmaxVariant};

// Backend types callers need to configure engines or inspect plans
pub use strata_backends::{CpuBackendConfig, DataType, MemoryFormat};
