//! Error types for backend operations

use crate::backend::ArgRole;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur during descriptor negotiation, compilation or execution
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Invalid buffer handle
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Invalid stream handle
    #[error("invalid stream handle: {0}")]
    InvalidStreamHandle(u64),

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// A descriptor the backend cannot accept
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A primitive was executed without one of its required arguments
    #[error("primitive {primitive} is missing its {role} argument")]
    MissingArgument { primitive: &'static str, role: ArgRole },

    /// A primitive produced a non-finite value
    #[error("numeric exception in {primitive}: non-finite value at element {index}")]
    NumericException { primitive: &'static str, index: usize },

    /// Execution error
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Unsupported operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl BackendError {
    /// Create an invalid descriptor error
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    /// Create an execution error
    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }
}
