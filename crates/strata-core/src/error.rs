//! Error types for strata-core operations

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_backends::BackendError;

use crate::memory::MemoryKind;

/// Result type for strata-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad axis, dims, memory kind or buffer size
    Shape,
    /// Operation invoked before its prerequisite step
    State,
    /// The backend failed to compile, execute or manage memory
    Backend,
}

/// Which backend interaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendPhase {
    /// Descriptor negotiation or primitive compilation
    Compile,
    /// Stream submission
    Execute,
    /// Buffer or stream management
    Memory,
}

impl fmt::Display for BackendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendPhase::Compile => "compile",
            BackendPhase::Execute => "execute",
            BackendPhase::Memory => "memory",
        })
    }
}

/// Errors that can occur in strata-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid tensor shape
    #[error("Invalid tensor shape: {0}")]
    InvalidShape(String),

    /// Softmax axis outside `0..rank`
    #[error("Invalid axis: {axis} is out of range for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },

    /// No softmax variant exists for this rank
    #[error("Unsupported rank: softmax is specialized for rank 2 and rank 4, got rank {0}")]
    UnsupportedRank(usize),

    /// Buffer size mismatch
    #[error("Buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// Integer memory kind with no [`MemoryKind`] counterpart
    #[error("Invalid memory kind: {0}")]
    InvalidMemoryKind(i32),

    /// A cached context was requested with a different shape than it was built for
    #[error("Context '{key}' is bound to shape {cached}, requested {requested}")]
    ContextShapeMismatch {
        key: String,
        cached: String,
        requested: String,
    },

    /// An operation ran before the setup step it depends on
    #[error("{operation} requires {required} to run first")]
    NotSetUp {
        operation: &'static str,
        required: &'static str,
    },

    /// A required buffer role has no buffer bound
    #[error("No {0} buffer is bound")]
    Unbound(MemoryKind),

    /// Backward ran without a successful forward since the last forward I/O rebind
    #[error("backward requires a successful forward pass on the current bindings")]
    ForwardRequired,

    /// Backend failure, tagged with the phase it happened in
    #[error("Backend {phase} error: {source}")]
    Backend {
        phase: BackendPhase,
        #[source]
        source: BackendError,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidShape(_)
            | Error::InvalidAxis { .. }
            | Error::UnsupportedRank(_)
            | Error::BufferSizeMismatch { .. }
            | Error::InvalidMemoryKind(_)
            | Error::ContextShapeMismatch { .. } => ErrorKind::Shape,
            Error::NotSetUp { .. } | Error::Unbound(_) | Error::ForwardRequired => ErrorKind::State,
            Error::Backend { .. } => ErrorKind::Backend,
        }
    }

    /// The backend phase, for backend errors
    pub fn backend_phase(&self) -> Option<BackendPhase> {
        match self {
            Error::Backend { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Adapter for `map_err` on backend results
    pub(crate) fn backend(phase: BackendPhase) -> impl FnOnce(BackendError) -> Error {
        move |source| Error::Backend { phase, source }
    }
}
