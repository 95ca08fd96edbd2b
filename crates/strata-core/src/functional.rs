//! One-shot softmax on host slices
//!
//! Each call allocates temporary backend buffers, runs a fresh operator and
//! reads the results back. Use [`Softmax`] or [`InstanceCache`](crate::InstanceCache)
//! directly when the same shape runs repeatedly.

use std::ops::Deref;

use crate::buffer::Buffer;
use crate::element::Element;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::memory::MemoryKind;
use crate::shape::ShapeDescriptor;
use crate::softmax::Softmax;

/// Buffer freed when it goes out of scope
struct TempBuffer<'a, T: Element> {
    engine: &'a Engine,
    buffer: Buffer<T>,
}

impl<'a, T: Element> TempBuffer<'a, T> {
    fn zeroed(engine: &'a Engine, len: usize) -> Result<Self> {
        Ok(Self {
            engine,
            buffer: engine.allocate(len)?,
        })
    }

    fn with_data(engine: &'a Engine, data: &[T]) -> Result<Self> {
        let mut temp = Self::zeroed(engine, data.len())?;
        temp.buffer.copy_from_slice(engine, data)?;
        Ok(temp)
    }
}

impl<T: Element> Deref for TempBuffer<'_, T> {
    type Target = Buffer<T>;

    fn deref(&self) -> &Buffer<T> {
        &self.buffer
    }
}

impl<T: Element> Drop for TempBuffer<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.engine.free_handle(self.buffer.handle()) {
            tracing::warn!(handle = %self.buffer.handle(), error = %err, "failed to free temporary buffer");
        }
    }
}

fn check_len(shape: &ShapeDescriptor, actual: usize) -> Result<()> {
    if actual != shape.numel() {
        return Err(Error::BufferSizeMismatch {
            expected: shape.numel(),
            actual,
        });
    }
    Ok(())
}

/// Softmax of `input` (row-major, shape `dims`) along `axis`
///
/// # Example
///
/// ```rust
/// use strata_core::{functional, Engine};
///
/// let engine = Engine::new()?;
/// let out = functional::softmax(&engine, &[1.0f32, 1.0, 1.0], [1, 3], 1)?;
/// assert!(out.iter().all(|&p| (p - 1.0 / 3.0).abs() < 1e-6));
/// # Ok::<(), strata_core::Error>(())
/// ```
#[tracing::instrument(skip(engine, input, dims), fields(len = input.len()))]
pub fn softmax<T: Element>(engine: &Engine, input: &[T], dims: impl Into<Vec<usize>>, axis: usize) -> Result<Vec<T>> {
    let shape = ShapeDescriptor::new(dims, axis)?;
    check_len(&shape, input.len())?;

    let src = TempBuffer::with_data(engine, input)?;
    let dst = TempBuffer::<T>::zeroed(engine, input.len())?;

    let mut op = Softmax::<T>::from_shape(engine, shape)?;
    op.setup_forward()?;
    op.update_user_mem(&src, &dst);
    op.forward()?;

    dst.to_vec(engine)
}

/// Softmax of `input` and the gradient of the loss w.r.t. `input` given
/// `grad_output`, the gradient w.r.t. the softmax output
///
/// Returns `(output, grad_input)`.
#[tracing::instrument(skip(engine, input, grad_output, dims), fields(len = input.len()))]
pub fn softmax_with_grad<T: Element>(
    engine: &Engine,
    input: &[T],
    grad_output: &[T],
    dims: impl Into<Vec<usize>>,
    axis: usize,
) -> Result<(Vec<T>, Vec<T>)> {
    let shape = ShapeDescriptor::new(dims, axis)?;
    check_len(&shape, input.len())?;
    check_len(&shape, grad_output.len())?;

    let src = TempBuffer::with_data(engine, input)?;
    let dst = TempBuffer::<T>::zeroed(engine, input.len())?;
    let diff_dst = TempBuffer::with_data(engine, grad_output)?;
    let diff_src = TempBuffer::<T>::zeroed(engine, input.len())?;

    let mut op = Softmax::<T>::from_shape(engine, shape)?;
    op.setup_backward()?;
    op.update_user_mem(&src, &dst);
    op.bind(MemoryKind::DiffDst, &diff_dst);
    op.bind(MemoryKind::DiffSrc, &diff_src);
    op.forward()?;
    op.backward()?;

    Ok((dst.to_vec(engine)?, diff_src.to_vec(engine)?))
}
