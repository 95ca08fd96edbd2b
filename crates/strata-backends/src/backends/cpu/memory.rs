//! Memory manager for CPU backend
//!
//! Manages heap buffers and execution streams for the CPU backend. Buffers
//! are byte vectors keyed by handle id, each behind its own lock; the maps
//! themselves are only locked long enough to look a handle up, so kernels on
//! different streams touch disjoint locks. Streams give each execution
//! context its own identity and step counter, and their lock serializes
//! submissions on one stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};

use crate::backend::{BufferHandle, StreamHandle};
use crate::error::{BackendError, Result};

/// Per-stream bookkeeping
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StreamState {
    pub(crate) executed_steps: u64,
}

type SharedBytes = Arc<RwLock<Vec<u8>>>;

/// Memory manager for CPU backend
pub struct MemoryManager {
    /// Buffers storage (heap-allocated)
    buffers: RwLock<HashMap<u64, SharedBytes>>,

    streams: RwLock<HashMap<u64, Arc<Mutex<StreamState>>>>,

    /// Next buffer handle ID
    next_buffer_id: AtomicU64,

    /// Next stream handle ID
    next_stream_id: AtomicU64,
}

fn out_of_bounds(offset: usize, size: usize, buffer_size: usize) -> BackendError {
    BackendError::BufferOutOfBounds {
        offset,
        size,
        buffer_size,
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            next_buffer_id: AtomicU64::new(1),
            next_stream_id: AtomicU64::new(1),
        }
    }

    // ============================================================================================
    // Buffers
    // ============================================================================================

    pub fn allocate_buffer(&self, size: usize) -> Result<BufferHandle> {
        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        let bytes = Arc::new(RwLock::new(vec![0u8; size]));
        self.buffers.write().insert(id, bytes);
        Ok(BufferHandle::new(id))
    }

    pub fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.buffers
            .write()
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn copy_to_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.write_at(handle, 0, data)
    }

    pub fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        let buffer = buffer.read();

        if data.len() > buffer.len() {
            return Err(out_of_bounds(0, data.len(), buffer.len()));
        }

        data.copy_from_slice(&buffer[..data.len()]);
        Ok(())
    }

    pub fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.buffer(handle)?.read().len())
    }

    /// Shared reference to a buffer's storage; the map lock is released on return
    fn buffer(&self, handle: BufferHandle) -> Result<SharedBytes> {
        self.buffers
            .read()
            .get(&handle.id())
            .map(Arc::clone)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    /// Copy the first `elems` elements of a buffer out as `T`, failing if it is smaller
    pub fn read_prefix<T: Pod>(&self, handle: BufferHandle, elems: usize) -> Result<Vec<T>> {
        let size = elems
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| out_of_bounds(0, usize::MAX, 0))?;
        let buffer = self.buffer(handle)?;
        let buffer = buffer.read();
        if size > buffer.len() {
            return Err(out_of_bounds(0, size, buffer.len()));
        }
        Ok(bytemuck::pod_collect_to_vec(&buffer[..size]))
    }

    /// Overwrite `data.len()` bytes starting at `offset`
    pub fn write_at(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        let mut buffer = buffer.write();

        let end = offset.checked_add(data.len()).unwrap_or(usize::MAX);
        if end > buffer.len() {
            return Err(out_of_bounds(offset, data.len(), buffer.len()));
        }

        buffer[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.read().len()
    }

    // ============================================================================================
    // Streams
    // ============================================================================================

    pub fn create_stream(&self) -> StreamHandle {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.streams.write().insert(id, Arc::default());
        StreamHandle::new(id)
    }

    pub fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.streams
            .write()
            .remove(&stream.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidStreamHandle(stream.id()))
    }

    /// State of a live stream; lock it to submit work on the stream
    pub(crate) fn stream(&self, stream: StreamHandle) -> Result<Arc<Mutex<StreamState>>> {
        self.streams
            .read()
            .get(&stream.id())
            .map(Arc::clone)
            .ok_or(BackendError::InvalidStreamHandle(stream.id()))
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_manager_buffer_allocation() {
        let mm = MemoryManager::new();
        let a = mm.allocate_buffer(16).unwrap();
        let b = mm.allocate_buffer(8).unwrap();
        assert_ne!(a, b);
        assert_eq!(mm.buffer_size(a).unwrap(), 16);
        assert_eq!(mm.buffer_count(), 2);

        mm.free_buffer(a).unwrap();
        assert!(matches!(mm.free_buffer(a), Err(BackendError::InvalidBufferHandle(_))));
        assert_eq!(mm.buffer_count(), 1);
    }

    #[test]
    fn test_memory_manager_buffer_copy() {
        let mm = MemoryManager::new();
        let buf = mm.allocate_buffer(4).unwrap();
        mm.copy_to_buffer(buf, &[1, 2, 3]).unwrap();

        let mut out = [0u8; 4];
        mm.copy_from_buffer(buf, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 0]);

        assert!(matches!(
            mm.copy_to_buffer(buf, &[0; 5]),
            Err(BackendError::BufferOutOfBounds { buffer_size: 4, .. })
        ));
        assert!(mm.read_prefix::<u8>(buf, 5).is_err());
        assert_eq!(mm.read_prefix::<u8>(buf, 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_memory_manager_streams() {
        let mm = MemoryManager::new();
        let s = mm.create_stream();
        mm.stream(s).unwrap().lock().executed_steps += 3;
        assert_eq!(mm.stream(s).unwrap().lock().executed_steps, 3);
        mm.destroy_stream(s).unwrap();
        assert!(matches!(mm.destroy_stream(s), Err(BackendError::InvalidStreamHandle(_))));
        assert_eq!(mm.stream_count(), 0);
    }

    #[test]
    fn test_buffers_lock_independently() {
        let mm = MemoryManager::new();
        let a = mm.allocate_buffer(4).unwrap();
        let b = mm.allocate_buffer(4).unwrap();

        // Holding one buffer's lock leaves the other buffers and the map usable
        let held = mm.buffer(a).unwrap();
        let _guard = held.write();
        mm.copy_to_buffer(b, &[9, 9]).unwrap();
        assert_eq!(mm.read_prefix::<u8>(b, 2).unwrap(), vec![9, 9]);
        let c = mm.allocate_buffer(2).unwrap();
        mm.free_buffer(c).unwrap();
    }
}
