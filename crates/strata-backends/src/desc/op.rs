//! Operation and primitive descriptors
//!
//! An [`OpDesc`] is the logical request ("softmax along axis 1 of this
//! tensor"); its memory descriptors may leave the layout as
//! [`MemoryFormat::Any`]. A backend answers with a [`PrimitiveDesc`] in which
//! every layout is concrete and the scratchpad requirement is known.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::memory::{MemoryDesc, MemoryFormat};
use crate::error::{BackendError, Result};

/// Propagation kind of a forward primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropKind {
    /// Forward pass whose output feeds a later backward pass
    ForwardTraining,
    /// Forward pass only
    ForwardInference,
}

/// Logical description of one backend operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpDesc {
    /// `dst = softmax(src)` along `axis`; src and dst share `data`
    SoftmaxForward {
        prop_kind: PropKind,
        data: MemoryDesc,
        axis: usize,
    },
    /// `diff_src = dst * (diff_dst - sum(diff_dst * dst))` along `axis`;
    /// `data` describes the forward output, `diff` both gradients
    SoftmaxBackward {
        data: MemoryDesc,
        diff: MemoryDesc,
        axis: usize,
    },
    /// Copy between two layouts of the same logical tensor
    Reorder { src: MemoryDesc, dst: MemoryDesc },
}

fn check_axis(data: &MemoryDesc, axis: usize) -> Result<()> {
    if axis >= data.rank() {
        return Err(BackendError::invalid_descriptor(format!(
            "softmax axis {axis} out of range for rank {}",
            data.rank()
        )));
    }
    Ok(())
}

impl OpDesc {
    pub fn softmax_forward(prop_kind: PropKind, data: MemoryDesc, axis: usize) -> Result<Self> {
        check_axis(&data, axis)?;
        Ok(OpDesc::SoftmaxForward { prop_kind, data, axis })
    }

    pub fn softmax_backward(data: MemoryDesc, diff: MemoryDesc, axis: usize) -> Result<Self> {
        check_axis(&data, axis)?;
        if !data.is_compatible(&diff) {
            return Err(BackendError::invalid_descriptor(format!(
                "softmax backward data {data} and diff {diff} differ in dims or type"
            )));
        }
        Ok(OpDesc::SoftmaxBackward { data, diff, axis })
    }

    pub fn reorder(src: MemoryDesc, dst: MemoryDesc) -> Result<Self> {
        if !src.is_compatible(&dst) {
            return Err(BackendError::invalid_descriptor(format!(
                "reorder between incompatible descriptors {src} -> {dst}"
            )));
        }
        if src.format() == MemoryFormat::Any || dst.format() == MemoryFormat::Any {
            return Err(BackendError::invalid_descriptor("reorder needs concrete layouts"));
        }
        Ok(OpDesc::Reorder { src, dst })
    }

    pub const fn name(&self) -> &'static str {
        match self {
            OpDesc::SoftmaxForward { .. } => "softmax_forward",
            OpDesc::SoftmaxBackward { .. } => "softmax_backward",
            OpDesc::Reorder { .. } => "reorder",
        }
    }

    fn descs(&self) -> [&MemoryDesc; 2] {
        match self {
            OpDesc::SoftmaxForward { data, .. } => [data, data],
            OpDesc::SoftmaxBackward { data, diff, .. } => [data, diff],
            OpDesc::Reorder { src, dst } => [src, dst],
        }
    }

    /// True when no descriptor is left as `Any`
    pub fn is_concrete(&self) -> bool {
        self.descs().iter().all(|d| d.format() != MemoryFormat::Any)
    }
}

impl fmt::Display for OpDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpDesc::SoftmaxForward { prop_kind, data, axis } => {
                write!(f, "softmax_forward({prop_kind:?}, {data}, axis={axis})")
            }
            OpDesc::SoftmaxBackward { data, diff, axis } => {
                write!(f, "softmax_backward({data}, diff={diff}, axis={axis})")
            }
            OpDesc::Reorder { src, dst } => write!(f, "reorder({src} -> {dst})"),
        }
    }
}

/// A negotiated operation: concrete layouts plus working-memory requirement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimitiveDesc {
    op: OpDesc,
    scratchpad_bytes: usize,
}

impl PrimitiveDesc {
    /// Wrap a negotiated operation. Every layout must be concrete.
    pub fn new(op: OpDesc, scratchpad_bytes: usize) -> Result<Self> {
        if !op.is_concrete() {
            return Err(BackendError::invalid_descriptor(format!(
                "primitive descriptor for {} still has an `any` layout",
                op.name()
            )));
        }
        Ok(Self { op, scratchpad_bytes })
    }

    pub fn op(&self) -> &OpDesc {
        &self.op
    }

    pub fn name(&self) -> &'static str {
        self.op.name()
    }

    /// Bytes of temporary working memory the primitive needs (0 = none)
    pub fn scratchpad_bytes(&self) -> usize {
        self.scratchpad_bytes
    }

    /// Layout the primitive reads its main input in
    pub fn src_desc(&self) -> Option<&MemoryDesc> {
        match &self.op {
            OpDesc::SoftmaxForward { data, .. } => Some(data),
            OpDesc::Reorder { src, .. } => Some(src),
            OpDesc::SoftmaxBackward { .. } => None,
        }
    }

    /// Layout of the output for forward/reorder, of the forward output for backward
    pub fn dst_desc(&self) -> &MemoryDesc {
        match &self.op {
            OpDesc::SoftmaxForward { data, .. } => data,
            OpDesc::SoftmaxBackward { data, .. } => data,
            OpDesc::Reorder { dst, .. } => dst,
        }
    }

    /// Gradient layout; backward primitives only
    pub fn diff_desc(&self) -> Option<&MemoryDesc> {
        match &self.op {
            OpDesc::SoftmaxBackward { diff, .. } => Some(diff),
            _ => None,
        }
    }

    pub fn axis(&self) -> Option<usize> {
        match &self.op {
            OpDesc::SoftmaxForward { axis, .. } | OpDesc::SoftmaxBackward { axis, .. } => Some(*axis),
            OpDesc::Reorder { .. } => None,
        }
    }
}
