//! Softmax and reorder kernels for the CPU backend
//!
//! Every kernel reads its inputs out of the backend's byte buffers into typed
//! vectors, computes, and writes the output back. Each buffer is locked only
//! while it is copied in or out, never across the computation. Blocked
//! layouts are handled through per-descriptor offset tables computed once at
//! compile time: logical index `(outer, a, inner)` of a softmax maps to
//! physical element `offsets[(outer * axis_len + a) * inner + inner_idx]`.
//! Plain layouts index directly and carry no table.

use bytemuck::Pod;
use num_traits::Float;
use rayon::prelude::*;

use super::memory::MemoryManager;
use crate::backend::{ArgRole, BufferHandle, ExecArgs};
use crate::desc::{DataType, MemoryDesc, OpDesc, PrimitiveDesc};
use crate::error::{BackendError, Result};

/// Softmax iteration space: `outer × axis_len × inner`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub(crate) outer: usize,
    pub(crate) axis_len: usize,
    pub(crate) inner: usize,
}

impl Geometry {
    pub(crate) fn new(dims: &[usize], axis: usize) -> Self {
        Self {
            outer: dims[..axis].iter().product(),
            axis_len: dims[axis],
            inner: dims[axis + 1..].iter().product(),
        }
    }

    pub(crate) fn numel(&self) -> usize {
        self.outer * self.axis_len * self.inner
    }

    #[inline]
    fn index(&self, outer: usize, a: usize, inner: usize) -> usize {
        (outer * self.axis_len + a) * self.inner + inner
    }

    /// Running max and sum per inner position
    fn forward_scratch_elems(&self) -> usize {
        if self.inner > 1 {
            2 * self.inner
        } else {
            0
        }
    }

    /// Dot product accumulator per inner position
    fn backward_scratch_elems(&self) -> usize {
        if self.inner > 1 {
            self.inner
        } else {
            0
        }
    }
}

/// Scratchpad bytes the CPU kernels need for `op`
pub(crate) fn scratchpad_bytes(op: &OpDesc) -> usize {
    match op {
        OpDesc::SoftmaxForward { data, axis, .. } => {
            Geometry::new(data.dims(), *axis).forward_scratch_elems() * data.data_type().size()
        }
        OpDesc::SoftmaxBackward { data, axis, .. } => {
            Geometry::new(data.dims(), *axis).backward_scratch_elems() * data.data_type().size()
        }
        OpDesc::Reorder { .. } => 0,
    }
}

/// Physical view of one descriptor
#[derive(Debug)]
pub(crate) struct Layout {
    /// Physical offset per logical element; empty for plain layouts
    offsets: Vec<usize>,
    /// Physical order equals logical order
    contiguous: bool,
    /// Logical element count
    numel: usize,
    /// Element count including padding
    physical_len: usize,
}

impl Layout {
    fn new(desc: &MemoryDesc) -> Result<Self> {
        let contiguous = desc.format().is_plain();
        Ok(Self {
            offsets: if contiguous { Vec::new() } else { desc.offsets()? },
            contiguous,
            numel: desc.numel(),
            physical_len: desc.padded_numel(),
        })
    }

    /// Physical position of logical element `logical`
    #[inline]
    fn at(&self, logical: usize) -> usize {
        if self.contiguous {
            logical
        } else {
            self.offsets[logical]
        }
    }
}

/// Execution knobs taken from the backend configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunOptions {
    pub(crate) check_numerics: bool,
    pub(crate) parallel_threshold: usize,
}

/// A compiled CPU kernel
#[derive(Debug)]
pub(crate) enum Kernel {
    SoftmaxForward {
        geometry: Geometry,
        data_type: DataType,
        data: Layout,
        scratch_elems: usize,
    },
    SoftmaxBackward {
        geometry: Geometry,
        data_type: DataType,
        data: Layout,
        diff: Layout,
        scratch_elems: usize,
    },
    Reorder {
        data_type: DataType,
        src: Layout,
        dst: Layout,
    },
}

fn check_scratchpad(pd: &PrimitiveDesc, required_elems: usize, data_type: DataType) -> Result<()> {
    let required = required_elems * data_type.size();
    if pd.scratchpad_bytes() < required {
        return Err(BackendError::invalid_descriptor(format!(
            "{} needs {required} scratchpad bytes, descriptor provides {}",
            pd.name(),
            pd.scratchpad_bytes()
        )));
    }
    Ok(())
}

impl Kernel {
    pub(crate) fn build(pd: &PrimitiveDesc) -> Result<Self> {
        match pd.op() {
            OpDesc::SoftmaxForward { data, axis, .. } => {
                let geometry = Geometry::new(data.dims(), *axis);
                let scratch_elems = geometry.forward_scratch_elems();
                check_scratchpad(pd, scratch_elems, data.data_type())?;
                Ok(Kernel::SoftmaxForward {
                    geometry,
                    data_type: data.data_type(),
                    data: Layout::new(data)?,
                    scratch_elems,
                })
            }
            OpDesc::SoftmaxBackward { data, diff, axis } => {
                let geometry = Geometry::new(data.dims(), *axis);
                let scratch_elems = geometry.backward_scratch_elems();
                check_scratchpad(pd, scratch_elems, data.data_type())?;
                Ok(Kernel::SoftmaxBackward {
                    geometry,
                    data_type: data.data_type(),
                    data: Layout::new(data)?,
                    diff: Layout::new(diff)?,
                    scratch_elems,
                })
            }
            OpDesc::Reorder { src, dst } => Ok(Kernel::Reorder {
                data_type: src.data_type(),
                src: Layout::new(src)?,
                dst: Layout::new(dst)?,
            }),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            Kernel::SoftmaxForward { data_type, .. }
            | Kernel::SoftmaxBackward { data_type, .. }
            | Kernel::Reorder { data_type, .. } => *data_type,
        }
    }

    /// Logical elements produced per run
    pub(crate) fn elements(&self) -> usize {
        match self {
            Kernel::SoftmaxForward { geometry, .. } | Kernel::SoftmaxBackward { geometry, .. } => geometry.numel(),
            Kernel::Reorder { src, .. } => src.numel,
        }
    }

    pub(crate) fn run(
        &self,
        primitive: &'static str,
        memory: &MemoryManager,
        args: &ExecArgs,
        options: RunOptions,
    ) -> Result<()> {
        match self.data_type() {
            DataType::F32 => self.run_typed::<f32>(primitive, memory, args, options),
            DataType::F64 => self.run_typed::<f64>(primitive, memory, args, options),
        }
    }

    fn run_typed<T>(
        &self,
        primitive: &'static str,
        memory: &MemoryManager,
        args: &ExecArgs,
        options: RunOptions,
    ) -> Result<()>
    where
        T: Float + Pod + Send + Sync,
    {
        let arg = |role: ArgRole| args.get(role).ok_or(BackendError::MissingArgument { primitive, role });

        match self {
            Kernel::SoftmaxForward {
                geometry,
                data,
                scratch_elems,
                ..
            } => {
                let src: Vec<T> = read(memory, arg(ArgRole::Src)?, data.physical_len)?;
                let dst_handle = arg(ArgRole::Dst)?;
                let mut dst: Vec<T> = read(memory, dst_handle, data.physical_len)?;
                let mut scratch = read_scratch::<T>(memory, args, primitive, *scratch_elems)?;

                if data.contiguous && geometry.inner == 1 {
                    let parallel = geometry.numel() >= options.parallel_threshold;
                    forward_rows(&src, &mut dst, geometry.axis_len, parallel);
                } else {
                    let mut local = [T::zero(); 2];
                    let work = match scratch.as_mut() {
                        Some((_, buf)) => buf.as_mut_slice(),
                        None => &mut local[..],
                    };
                    forward_strided(&src, &mut dst, geometry, data, work);
                }

                if options.check_numerics {
                    check_finite(primitive, &dst, data)?;
                }
                memory.write_at(dst_handle, 0, bytemuck::cast_slice(&dst))?;
                write_scratch(memory, scratch)
            }
            Kernel::SoftmaxBackward {
                geometry,
                data,
                diff,
                scratch_elems,
                ..
            } => {
                let y: Vec<T> = read(memory, arg(ArgRole::Dst)?, data.physical_len)?;
                let dy: Vec<T> = read(memory, arg(ArgRole::DiffDst)?, diff.physical_len)?;
                let dx_handle = arg(ArgRole::DiffSrc)?;
                let mut dx: Vec<T> = read(memory, dx_handle, diff.physical_len)?;
                let mut scratch = read_scratch::<T>(memory, args, primitive, *scratch_elems)?;

                if data.contiguous && diff.contiguous && geometry.inner == 1 {
                    let parallel = geometry.numel() >= options.parallel_threshold;
                    backward_rows(&y, &dy, &mut dx, geometry.axis_len, parallel);
                } else {
                    let mut local = [T::zero(); 1];
                    let work = match scratch.as_mut() {
                        Some((_, buf)) => buf.as_mut_slice(),
                        None => &mut local[..],
                    };
                    backward_strided(&y, &dy, &mut dx, geometry, (data, diff), work);
                }

                if options.check_numerics {
                    check_finite(primitive, &dx, diff)?;
                }
                memory.write_at(dx_handle, 0, bytemuck::cast_slice(&dx))?;
                write_scratch(memory, scratch)
            }
            Kernel::Reorder { src, dst, .. } => {
                let input: Vec<T> = read(memory, arg(ArgRole::Src)?, src.physical_len)?;
                let dst_handle = arg(ArgRole::Dst)?;
                // Padding in the destination layout is zeroed
                let mut output = vec![T::zero(); dst.physical_len];
                for i in 0..src.numel {
                    output[dst.at(i)] = input[src.at(i)];
                }
                memory.write_at(dst_handle, 0, bytemuck::cast_slice(&output))
            }
        }
    }
}

fn read<T: Pod>(memory: &MemoryManager, handle: BufferHandle, elems: usize) -> Result<Vec<T>> {
    memory.read_prefix(handle, elems)
}

fn read_scratch<T: Pod>(
    memory: &MemoryManager,
    args: &ExecArgs,
    primitive: &'static str,
    elems: usize,
) -> Result<Option<(BufferHandle, Vec<T>)>> {
    if elems == 0 {
        return Ok(None);
    }
    let handle = args.get(ArgRole::Scratchpad).ok_or(BackendError::MissingArgument {
        primitive,
        role: ArgRole::Scratchpad,
    })?;
    Ok(Some((handle, read(memory, handle, elems)?)))
}

fn write_scratch<T: Pod>(memory: &MemoryManager, scratch: Option<(BufferHandle, Vec<T>)>) -> Result<()> {
    match scratch {
        Some((handle, buf)) => memory.write_at(handle, 0, bytemuck::cast_slice(&buf)),
        None => Ok(()),
    }
}

fn check_finite<T: Float>(primitive: &'static str, output: &[T], layout: &Layout) -> Result<()> {
    let bad = if layout.contiguous {
        output.iter().position(|v| !v.is_finite())
    } else {
        (0..layout.numel).position(|i| !output[layout.at(i)].is_finite())
    };
    match bad {
        Some(index) => Err(BackendError::NumericException { primitive, index }),
        None => Ok(()),
    }
}

// ================================================================================================
// Forward
// ================================================================================================

fn softmax_row<T: Float>(src: &[T], dst: &mut [T]) {
    let max = src.iter().fold(T::neg_infinity(), |m, &x| m.max(x));
    let mut sum = T::zero();
    for (d, &x) in dst.iter_mut().zip(src) {
        *d = (x - max).exp();
        sum = sum + *d;
    }
    for d in dst.iter_mut() {
        *d = *d / sum;
    }
}

fn forward_rows<T: Float + Send + Sync>(src: &[T], dst: &mut [T], row: usize, parallel: bool) {
    if parallel {
        dst.par_chunks_mut(row)
            .zip(src.par_chunks(row))
            .for_each(|(d, s)| softmax_row(s, d));
    } else {
        dst.chunks_mut(row).zip(src.chunks(row)).for_each(|(d, s)| softmax_row(s, d));
    }
}

/// `work` holds at least `2 * inner` elements (max, then sum)
fn forward_strided<T: Float>(src: &[T], dst: &mut [T], g: &Geometry, layout: &Layout, work: &mut [T]) {
    let (max, rest) = work.split_at_mut(g.inner);
    let sum = &mut rest[..g.inner];

    for o in 0..g.outer {
        max.fill(T::neg_infinity());
        sum.fill(T::zero());

        for a in 0..g.axis_len {
            for i in 0..g.inner {
                let x = src[layout.at(g.index(o, a, i))];
                max[i] = max[i].max(x);
            }
        }
        for a in 0..g.axis_len {
            for i in 0..g.inner {
                let p = layout.at(g.index(o, a, i));
                let e = (src[p] - max[i]).exp();
                dst[p] = e;
                sum[i] = sum[i] + e;
            }
        }
        for a in 0..g.axis_len {
            for i in 0..g.inner {
                let p = layout.at(g.index(o, a, i));
                dst[p] = dst[p] / sum[i];
            }
        }
    }
}

// ================================================================================================
// Backward
// ================================================================================================

fn backward_row<T: Float>(y: &[T], dy: &[T], dx: &mut [T]) {
    let dot = y.iter().zip(dy).fold(T::zero(), |acc, (&a, &b)| acc + a * b);
    for ((d, &yv), &g) in dx.iter_mut().zip(y).zip(dy) {
        *d = yv * (g - dot);
    }
}

fn backward_rows<T: Float + Send + Sync>(y: &[T], dy: &[T], dx: &mut [T], row: usize, parallel: bool) {
    if parallel {
        dx.par_chunks_mut(row)
            .zip(y.par_chunks(row))
            .zip(dy.par_chunks(row))
            .for_each(|((d, y), g)| backward_row(y, g, d));
    } else {
        dx.chunks_mut(row)
            .zip(y.chunks(row))
            .zip(dy.chunks(row))
            .for_each(|((d, y), g)| backward_row(y, g, d));
    }
}

/// `work` holds at least `inner` elements
fn backward_strided<T: Float>(
    y: &[T],
    dy: &[T],
    dx: &mut [T],
    g: &Geometry,
    (y_layout, diff_layout): (&Layout, &Layout),
    work: &mut [T],
) {
    let dot = &mut work[..g.inner];

    for o in 0..g.outer {
        dot.fill(T::zero());
        for a in 0..g.axis_len {
            for i in 0..g.inner {
                let idx = g.index(o, a, i);
                dot[i] = dot[i] + y[y_layout.at(idx)] * dy[diff_layout.at(idx)];
            }
        }
        for a in 0..g.axis_len {
            for i in 0..g.inner {
                let idx = g.index(o, a, i);
                let p = diff_layout.at(idx);
                dx[p] = y[y_layout.at(idx)] * (dy[p] - dot[i]);
            }
        }
    }
}
