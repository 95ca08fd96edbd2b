//! Typed buffer handles over backend-managed memory
//!
//! A `Buffer<T>` is caller-owned memory: the framework allocates it through
//! an [`Engine`], binds it to operators as user memory, and releases it with
//! [`Engine::free`]. Operators only ever keep non-owning views of it.

use std::marker::PhantomData;

use strata_backends::BufferHandle;

use crate::element::Element;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Typed buffer handle
///
/// Not `Clone`: there is exactly one owner, and [`Engine::free`] consumes it.
#[derive(Debug)]
pub struct Buffer<T> {
    handle: BufferHandle,
    /// Number of T elements
    len: usize,
    _phantom: PhantomData<T>,
}

impl<T: Element> Buffer<T> {
    pub(crate) fn new(handle: BufferHandle, len: usize) -> Self {
        Self {
            handle,
            len,
            _phantom: PhantomData,
        }
    }

    /// Backend handle backing this buffer
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn size_bytes(&self) -> usize {
        self.len * self.element_size()
    }

    /// Copy data from host slice to buffer (H2D transfer)
    #[tracing::instrument(skip(self, engine, src), fields(
        handle = %self.handle,
        elements = self.len,
        type_name = std::any::type_name::<T>()
    ))]
    pub fn copy_from_slice(&mut self, engine: &Engine, src: &[T]) -> Result<()> {
        let start = std::time::Instant::now();

        if src.len() != self.len {
            return Err(Error::BufferSizeMismatch {
                expected: self.len,
                actual: src.len(),
            });
        }

        engine.write_bytes(self.handle, bytemuck::cast_slice(src))?;

        strata_tracing::performance::record_transfer(
            std::mem::size_of_val(src),
            "H2D",
            start.elapsed().as_micros() as u64,
        );
        Ok(())
    }

    /// Copy data from buffer to host slice (D2H transfer)
    pub fn copy_to_slice(&self, engine: &Engine, dst: &mut [T]) -> Result<()> {
        let start = std::time::Instant::now();

        if dst.len() != self.len {
            return Err(Error::BufferSizeMismatch {
                expected: self.len,
                actual: dst.len(),
            });
        }

        engine.read_bytes(self.handle, bytemuck::cast_slice_mut(dst))?;

        strata_tracing::performance::record_transfer(
            std::mem::size_of_val(dst),
            "D2H",
            start.elapsed().as_micros() as u64,
        );
        Ok(())
    }

    /// Read the whole buffer into a new vector
    pub fn to_vec(&self, engine: &Engine) -> Result<Vec<T>> {
        let mut out = vec![T::zero(); self.len];
        self.copy_to_slice(engine, &mut out)?;
        Ok(out)
    }
}
