//! Memory binding: user views, instance-owned persistent buffers, scratch
//!
//! Every logical role ([`MemoryKind`]) has a slot for a caller-owned
//! [`UserMemory`] view and a slot for an instance-owned [`PersistentMemory`]
//! buffer. The persistent buffer only exists when the backend computes in a
//! layout different from the caller's. Exactly one of the two is
//! authoritative per role at any time ([`Authority`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_backends::{ArgRole, BufferHandle};
use strata_tracing::perf_event;

use crate::buffer::Buffer;
use crate::element::Element;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Logical tensor role of a bound buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MemoryKind {
    /// Forward input
    Src = 0,
    /// Forward output, also read by backward
    Dst = 1,
    /// Upstream gradient
    DiffDst = 2,
    /// Gradient w.r.t. the input
    DiffSrc = 3,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [MemoryKind::Src, MemoryKind::Dst, MemoryKind::DiffDst, MemoryKind::DiffSrc];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Forward I/O roles; rebinding them invalidates the forward output
    pub const fn is_forward_io(self) -> bool {
        matches!(self, MemoryKind::Src | MemoryKind::Dst)
    }

    pub const fn arg_role(self) -> ArgRole {
        match self {
            MemoryKind::Src => ArgRole::Src,
            MemoryKind::Dst => ArgRole::Dst,
            MemoryKind::DiffDst => ArgRole::DiffDst,
            MemoryKind::DiffSrc => ArgRole::DiffSrc,
        }
    }
}

impl TryFrom<i32> for MemoryKind {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(MemoryKind::Src),
            1 => Ok(MemoryKind::Dst),
            2 => Ok(MemoryKind::DiffDst),
            3 => Ok(MemoryKind::DiffSrc),
            other => Err(Error::InvalidMemoryKind(other)),
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.arg_role().name())
    }
}

/// Which copy of a role holds the current data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authority {
    User,
    Persistent,
}

/// Non-owning view of a caller-owned buffer
///
/// Valid until the caller rebinds the role or frees the buffer; executing
/// against a freed buffer fails with a backend memory error rather than
/// touching released memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserMemory {
    handle: BufferHandle,
    len: usize,
}

impl UserMemory {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Length in elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: Element> From<&Buffer<T>> for UserMemory {
    fn from(buffer: &Buffer<T>) -> Self {
        Self {
            handle: buffer.handle(),
            len: buffer.len(),
        }
    }
}

/// Backend buffer exclusively owned by an operator instance
///
/// Released when dropped.
#[derive(Debug)]
pub struct PersistentMemory {
    engine: Engine,
    handle: BufferHandle,
    size_bytes: usize,
}

impl PersistentMemory {
    pub(crate) fn allocate(engine: &Engine, size_bytes: usize) -> Result<Self> {
        let handle = engine.allocate_bytes(size_bytes)?;
        Ok(Self {
            engine: engine.clone(),
            handle,
            size_bytes,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Drop for PersistentMemory {
    fn drop(&mut self) {
        if let Err(err) = self.engine.free_handle(self.handle) {
            tracing::warn!(handle = %self.handle, error = %err, "failed to release persistent buffer");
        }
    }
}

/// Where a plan step reads or writes a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    User(MemoryKind),
    Persistent(MemoryKind),
    Scratch,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::User(kind) => write!(f, "user:{kind}"),
            Slot::Persistent(kind) => write!(f, "persistent:{kind}"),
            Slot::Scratch => f.write_str("scratch"),
        }
    }
}

/// Buffers bound to one operator instance
#[derive(Debug)]
pub struct MemoryBinding {
    user: [Option<UserMemory>; 4],
    persistent: [Option<PersistentMemory>; 4],
    scratch: Option<PersistentMemory>,
    authority: [Authority; 4],
}

impl MemoryBinding {
    pub fn new() -> Self {
        Self {
            user: [None; 4],
            persistent: [None, None, None, None],
            scratch: None,
            authority: [Authority::User; 4],
        }
    }

    /// Bind a user view to `kind`, returning the previous view
    ///
    /// The user copy becomes authoritative; any persistent copy is stale
    /// until a plan step refreshes it.
    pub fn bind_user(&mut self, kind: MemoryKind, memory: UserMemory) -> Option<UserMemory> {
        self.authority[kind.index()] = Authority::User;
        self.user[kind.index()].replace(memory)
    }

    pub fn user(&self, kind: MemoryKind) -> Option<UserMemory> {
        self.user[kind.index()]
    }

    pub fn is_bound(&self, kind: MemoryKind) -> bool {
        self.user[kind.index()].is_some()
    }

    pub fn persistent(&self, kind: MemoryKind) -> Option<&PersistentMemory> {
        self.persistent[kind.index()].as_ref()
    }

    pub fn scratch(&self) -> Option<&PersistentMemory> {
        self.scratch.as_ref()
    }

    pub fn authority(&self, kind: MemoryKind) -> Authority {
        self.authority[kind.index()]
    }

    pub(crate) fn set_authority(&mut self, kind: MemoryKind, authority: Authority) {
        self.authority[kind.index()] = authority;
    }

    /// Bytes held in persistent and scratch buffers
    pub fn owned_bytes(&self) -> usize {
        self.persistent
            .iter()
            .chain(std::iter::once(&self.scratch))
            .flatten()
            .map(PersistentMemory::size_bytes)
            .sum()
    }

    /// Make sure the persistent buffer for `kind` holds at least `size_bytes`
    pub(crate) fn ensure_persistent(&mut self, engine: &Engine, kind: MemoryKind, size_bytes: usize) -> Result<()> {
        ensure(&mut self.persistent[kind.index()], engine, kind.arg_role().name(), size_bytes)
    }

    /// Make sure the scratch buffer holds at least `size_bytes`
    pub(crate) fn ensure_scratch(&mut self, engine: &Engine, size_bytes: usize) -> Result<()> {
        if size_bytes == 0 {
            return Ok(());
        }
        ensure(&mut self.scratch, engine, "scratch", size_bytes)
    }

    /// Backend handle for a plan slot
    pub(crate) fn resolve(&self, slot: Slot) -> Result<BufferHandle> {
        match slot {
            Slot::User(kind) => self.user(kind).map(|m| m.handle()).ok_or(Error::Unbound(kind)),
            Slot::Persistent(kind) => self.persistent(kind).map(PersistentMemory::handle).ok_or(Error::NotSetUp {
                operation: "execution",
                required: "persistent buffer allocation",
            }),
            Slot::Scratch => self.scratch().map(PersistentMemory::handle).ok_or(Error::NotSetUp {
                operation: "execution",
                required: "scratch buffer allocation",
            }),
        }
    }
}

fn ensure(slot: &mut Option<PersistentMemory>, engine: &Engine, label: &'static str, size_bytes: usize) -> Result<()> {
    if slot.as_ref().is_some_and(|m| m.size_bytes() >= size_bytes) {
        return Ok(());
    }
    // Old buffer (if any) is released on replacement
    *slot = Some(PersistentMemory::allocate(engine, size_bytes)?);
    perf_event!("persistent_buffer_allocated", bytes = size_bytes, kind = label);
    Ok(())
}

impl Default for MemoryBinding {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;

    fn engine() -> Engine {
        Engine::with_config(EngineConfig::default()).unwrap()
    }

    #[test]
    fn memory_kind_from_integer() {
        assert_eq!(MemoryKind::try_from(0).unwrap(), MemoryKind::Src);
        assert_eq!(MemoryKind::try_from(3).unwrap(), MemoryKind::DiffSrc);
        assert!(matches!(MemoryKind::try_from(4), Err(Error::InvalidMemoryKind(4))));
        assert!(matches!(MemoryKind::try_from(-1), Err(Error::InvalidMemoryKind(-1))));
        for kind in MemoryKind::ALL {
            assert_eq!(MemoryKind::try_from(kind as i32).unwrap(), kind);
        }
    }

    #[test]
    fn bind_user_replaces_view_and_resets_authority() {
        let engine = engine();
        let a: Buffer<f32> = engine.allocate(4).unwrap();
        let b: Buffer<f32> = engine.allocate(4).unwrap();

        let mut binding = MemoryBinding::new();
        assert!(binding.bind_user(MemoryKind::Dst, UserMemory::from(&a)).is_none());
        binding.set_authority(MemoryKind::Dst, Authority::Persistent);

        let previous = binding.bind_user(MemoryKind::Dst, UserMemory::from(&b)).unwrap();
        assert_eq!(previous.handle(), a.handle());
        assert_eq!(binding.user(MemoryKind::Dst).unwrap().handle(), b.handle());
        assert_eq!(binding.authority(MemoryKind::Dst), Authority::User);

        assert!(matches!(
            binding.resolve(Slot::User(MemoryKind::Src)),
            Err(Error::Unbound(MemoryKind::Src))
        ));

        engine.free(a).unwrap();
        engine.free(b).unwrap();
    }

    #[test]
    fn persistent_buffers_are_released_on_drop() {
        let engine = engine();
        let count = || engine.with_cpu_backend(|cpu| cpu.buffer_count()).unwrap();

        let mut binding = MemoryBinding::new();
        binding.ensure_persistent(&engine, MemoryKind::Src, 64).unwrap();
        binding.ensure_scratch(&engine, 0).unwrap();
        binding.ensure_scratch(&engine, 32).unwrap();
        assert_eq!(count(), 2);
        assert_eq!(binding.owned_bytes(), 96);

        // Large enough already: no reallocation
        let handle = binding.persistent(MemoryKind::Src).unwrap().handle();
        binding.ensure_persistent(&engine, MemoryKind::Src, 16).unwrap();
        assert_eq!(binding.persistent(MemoryKind::Src).unwrap().handle(), handle);

        drop(binding);
        assert_eq!(count(), 0);
    }
}
