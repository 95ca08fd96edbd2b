//! Handles and execution arguments shared by every backend

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::primitive::Primitive;

/// Handle to an allocated buffer
///
/// Buffers are opaque handles managed by the backend.
/// Use Backend methods to interact with buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    /// Create a new buffer handle
    pub const fn new(id: u64) -> Self {
        BufferHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Handle to an execution stream
///
/// A stream is an independent, in-order sequence of primitive executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    /// Create a new stream handle
    pub const fn new(id: u64) -> Self {
        StreamHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Role a buffer plays for a primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgRole {
    Src,
    Dst,
    DiffDst,
    DiffSrc,
    Scratchpad,
}

impl ArgRole {
    pub const fn name(self) -> &'static str {
        match self {
            ArgRole::Src => "src",
            ArgRole::Dst => "dst",
            ArgRole::DiffDst => "diff_dst",
            ArgRole::DiffSrc => "diff_src",
            ArgRole::Scratchpad => "scratchpad",
        }
    }
}

impl fmt::Display for ArgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Buffers bound to a primitive for one execution
///
/// Roles are few, so a short vector beats a map here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecArgs {
    entries: Vec<(ArgRole, BufferHandle)>,
}

impl ExecArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handle` to `role`, replacing any previous binding
    pub fn with(mut self, role: ArgRole, handle: BufferHandle) -> Self {
        self.insert(role, handle);
        self
    }

    pub fn insert(&mut self, role: ArgRole, handle: BufferHandle) {
        match self.entries.iter_mut().find(|(r, _)| *r == role) {
            Some(entry) => entry.1 = handle,
            None => self.entries.push((role, handle)),
        }
    }

    pub fn get(&self, role: ArgRole) -> Option<BufferHandle> {
        self.entries.iter().find(|(r, _)| *r == role).map(|(_, h)| *h)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArgRole, BufferHandle)> + '_ {
        self.entries.iter().copied()
    }
}

/// One entry of a primitive sequence: a compiled primitive plus its arguments
#[derive(Debug, Clone)]
pub struct Step {
    pub primitive: Arc<Primitive>,
    pub args: ExecArgs,
}

impl Step {
    pub fn new(primitive: Arc<Primitive>, args: ExecArgs) -> Self {
        Self { primitive, args }
    }
}
