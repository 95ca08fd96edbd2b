//! Math-kernel backend for the strata softmax runtime
//!
//! This crate provides:
//! - **Descriptors**: memory layouts, operation descriptors and negotiated primitive descriptors
//! - **Backend Trait**: layout negotiation, compilation, streams, execution and buffers
//! - **Primitive Cache**: compiled primitives shared by descriptor
//! - **CPU Backend**: reference implementation with blocked rank-4 layouts
//!
//! # Architecture
//!
//! ```text
//! OpDesc (layout may be `any`)
//!     │ primitive_desc()
//!     ▼
//! PrimitiveDesc (concrete layouts + scratchpad bytes)
//!     │ compile()
//!     ▼
//! Arc<Primitive> ──► Step { primitive, args } ──► execute(stream, steps)
//! ```

pub mod backend;
pub mod backends;
pub mod desc;
pub mod error;
pub mod primitive;
pub mod primitive_cache;

pub use backend::{ArgRole, Backend, BufferHandle, ExecArgs, Step, StreamHandle};
pub use backends::{CpuBackend, CpuBackendConfig, CpuBackendStats};
pub use desc::{DataType, MemoryDesc, MemoryFormat, OpDesc, PrimitiveDesc, PropKind};
pub use error::{BackendError, Result};
pub use primitive::Primitive;
pub use primitive_cache::{PrimitiveCache, PrimitiveKey};
