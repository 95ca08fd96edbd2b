//! Logical shape of a softmax operator

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dims plus the axis softmax normalizes over
///
/// Dims are validated at construction; the axis is validated when a plan is
/// built, so an out-of-range axis surfaces from `setup_forward` as
/// [`Error::InvalidAxis`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    dims: Vec<usize>,
    axis: usize,
}

impl ShapeDescriptor {
    pub fn new(dims: impl Into<Vec<usize>>, axis: usize) -> Result<Self> {
        let dims = dims.into();
        if dims.is_empty() {
            return Err(Error::InvalidShape("softmax needs at least one dimension".into()));
        }
        if let Some(pos) = dims.iter().position(|&d| d == 0) {
            return Err(Error::InvalidShape(format!("dimension {pos} of {dims:?} is zero")));
        }
        // Byte sizes of the widest element type must stay addressable too
        let addressable = dims
            .iter()
            .try_fold(std::mem::size_of::<f64>(), |acc, &d| acc.checked_mul(d))
            .is_some();
        if !addressable {
            return Err(Error::InvalidShape(format!("element count of {dims:?} overflows")));
        }
        Ok(Self { dims, axis })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total element count
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn validate_axis(&self) -> Result<()> {
        if self.axis >= self.rank() {
            return Err(Error::InvalidAxis {
                axis: self.axis,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    /// `(outer, axis_len, inner)`: products of dims before the axis, the
    /// axis extent, and products of dims after it
    pub fn split(&self) -> Result<(usize, usize, usize)> {
        self.validate_axis()?;
        let outer = self.dims[..self.axis].iter().product();
        let inner = self.dims[self.axis + 1..].iter().product();
        Ok((outer, self.dims[self.axis], inner))
    }
}

impl fmt::Display for ShapeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@axis{}", self.dims, self.axis)
    }
}
