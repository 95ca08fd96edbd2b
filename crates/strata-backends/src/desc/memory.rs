//! Memory descriptors: element type, logical dims and physical layout

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical arrangement of a tensor's elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryFormat {
    /// Let the backend pick; only legal inside operation descriptors
    Any,
    /// Row-major rank-2 (batch × classes)
    Nc,
    /// Row-major rank-4 (batch × channel × height × width)
    Nchw,
    /// Rank-4 with channels split into blocks of the given size, the block
    /// being the innermost dimension. Channels are zero-padded to a multiple
    /// of the block.
    NChwXc(usize),
    /// Row-major for ranks without a dedicated tag
    Plain,
}

impl MemoryFormat {
    /// The row-major format for a given rank
    pub const fn plain_for_rank(rank: usize) -> Self {
        match rank {
            2 => MemoryFormat::Nc,
            4 => MemoryFormat::Nchw,
            _ => MemoryFormat::Plain,
        }
    }

    pub const fn is_plain(self) -> bool {
        matches!(self, MemoryFormat::Nc | MemoryFormat::Nchw | MemoryFormat::Plain)
    }
}

impl fmt::Display for MemoryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryFormat::Any => f.write_str("any"),
            MemoryFormat::Nc => f.write_str("nc"),
            MemoryFormat::Nchw => f.write_str("nchw"),
            MemoryFormat::NChwXc(block) => write!(f, "nChw{block}c"),
            MemoryFormat::Plain => f.write_str("plain"),
        }
    }
}

/// Logical shape, element type and layout of one tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    data_type: DataType,
    format: MemoryFormat,
}

impl MemoryDesc {
    /// Create a descriptor, checking that the format fits the rank
    pub fn new(dims: Vec<usize>, data_type: DataType, format: MemoryFormat) -> Result<Self> {
        if dims.is_empty() {
            return Err(BackendError::invalid_descriptor("memory descriptor needs at least one dimension"));
        }
        if let Some(pos) = dims.iter().position(|&d| d == 0) {
            return Err(BackendError::invalid_descriptor(format!(
                "dimension {pos} of {dims:?} is zero"
            )));
        }

        let rank = dims.len();
        let fits = match format {
            MemoryFormat::Any | MemoryFormat::Plain => true,
            MemoryFormat::Nc => rank == 2,
            MemoryFormat::Nchw => rank == 4,
            MemoryFormat::NChwXc(block) => rank == 4 && block > 0,
        };
        if !fits {
            return Err(BackendError::invalid_descriptor(format!(
                "format {format} does not apply to rank-{rank} dims {dims:?}"
            )));
        }

        let desc = Self { dims, data_type, format };
        if desc.checked_size_bytes().is_none() {
            return Err(BackendError::invalid_descriptor(format!(
                "{desc} needs more bytes than are addressable"
            )));
        }
        Ok(desc)
    }

    /// Padded byte size, `None` on overflow
    fn checked_size_bytes(&self) -> Option<usize> {
        let mut dims = self.dims.clone();
        if let MemoryFormat::NChwXc(block) = self.format {
            dims[1] = dims[1].div_ceil(block).checked_mul(block)?;
        }
        dims.iter().try_fold(self.data_type.size(), |acc, &d| acc.checked_mul(d))
    }

    /// Row-major descriptor for `dims`
    pub fn plain(dims: Vec<usize>, data_type: DataType) -> Result<Self> {
        let format = MemoryFormat::plain_for_rank(dims.len());
        Self::new(dims, data_type, format)
    }

    /// Same dims and type, different layout
    pub fn with_format(&self, format: MemoryFormat) -> Result<Self> {
        Self::new(self.dims.clone(), self.data_type, format)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> MemoryFormat {
        self.format
    }

    /// Logical element count
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Physical element count including layout padding
    pub fn padded_numel(&self) -> usize {
        match self.format {
            MemoryFormat::NChwXc(block) => {
                let channels = self.dims[1].div_ceil(block) * block;
                self.dims[0] * channels * self.dims[2] * self.dims[3]
            }
            _ => self.numel(),
        }
    }

    /// Bytes a buffer must hold for this descriptor
    pub fn size_bytes(&self) -> usize {
        self.padded_numel() * self.data_type.size()
    }

    /// Physical element offset of every logical element, in row-major logical order
    ///
    /// Fails for `Any`, which has no physical layout.
    pub fn offsets(&self) -> Result<Vec<usize>> {
        match self.format {
            MemoryFormat::Any => Err(BackendError::invalid_descriptor(
                "format `any` has no physical layout",
            )),
            MemoryFormat::Nc | MemoryFormat::Nchw | MemoryFormat::Plain => Ok((0..self.numel()).collect()),
            MemoryFormat::NChwXc(block) => {
                let (n, c, h, w) = (self.dims[0], self.dims[1], self.dims[2], self.dims[3]);
                let blocks = c.div_ceil(block);
                let mut offsets = Vec::with_capacity(self.numel());
                for ni in 0..n {
                    for ci in 0..c {
                        for hi in 0..h {
                            for wi in 0..w {
                                let outer = ((ni * blocks + ci / block) * h + hi) * w + wi;
                                offsets.push(outer * block + ci % block);
                            }
                        }
                    }
                }
                Ok(offsets)
            }
        }
    }

    /// Same dims and element type (layouts may differ)
    pub fn is_compatible(&self, other: &MemoryDesc) -> bool {
        self.dims == other.dims && self.data_type == other.data_type
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}:{}", self.data_type, self.dims, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_dims_and_rank_mismatch() {
        assert!(MemoryDesc::new(vec![2, 0], DataType::F32, MemoryFormat::Nc).is_err());
        assert!(MemoryDesc::new(vec![], DataType::F32, MemoryFormat::Plain).is_err());
        assert!(MemoryDesc::new(vec![2, 3], DataType::F32, MemoryFormat::Nchw).is_err());
        assert!(MemoryDesc::new(vec![2, 3, 4], DataType::F32, MemoryFormat::NChwXc(8)).is_err());
        assert!(MemoryDesc::new(vec![1, 2, 3, 4], DataType::F32, MemoryFormat::NChwXc(0)).is_err());
    }

    #[test]
    fn rejects_unaddressable_sizes() {
        let huge = usize::MAX / 4;
        assert!(MemoryDesc::new(vec![huge, 2], DataType::F64, MemoryFormat::Nc).is_err());
        assert!(MemoryDesc::new(vec![1, huge, 1, 1], DataType::F32, MemoryFormat::NChwXc(8)).is_err());
        assert!(MemoryDesc::new(vec![1, 1 << 20, 1, 1], DataType::F32, MemoryFormat::NChwXc(8)).is_ok());
    }

    #[test]
    fn plain_picks_format_by_rank() {
        let nc = MemoryDesc::plain(vec![2, 5], DataType::F32).unwrap();
        let nchw = MemoryDesc::plain(vec![1, 2, 3, 4], DataType::F64).unwrap();
        let other = MemoryDesc::plain(vec![7], DataType::F32).unwrap();
        assert_eq!(nc.format(), MemoryFormat::Nc);
        assert_eq!(nchw.format(), MemoryFormat::Nchw);
        assert_eq!(other.format(), MemoryFormat::Plain);
        assert_eq!(nchw.size_bytes(), 24 * 8);
    }

    #[test]
    fn blocked_layout_pads_channels() {
        let desc = MemoryDesc::new(vec![2, 3, 2, 2], DataType::F32, MemoryFormat::NChwXc(4)).unwrap();
        assert_eq!(desc.numel(), 24);
        assert_eq!(desc.padded_numel(), 2 * 4 * 2 * 2);
        assert_eq!(desc.size_bytes(), 32 * 4);
    }

    #[test]
    fn blocked_offsets_interleave_channels() {
        // N=1, C=2, H=1, W=2, block 2: physical order is (w0:c0,c1), (w1:c0,c1)
        let desc = MemoryDesc::new(vec![1, 2, 1, 2], DataType::F32, MemoryFormat::NChwXc(2)).unwrap();
        // logical order: c0w0, c0w1, c1w0, c1w1
        assert_eq!(desc.offsets().unwrap(), vec![0, 2, 1, 3]);
    }

    #[test]
    fn blocked_offsets_are_unique_and_in_range() {
        let desc = MemoryDesc::new(vec![2, 5, 3, 2], DataType::F32, MemoryFormat::NChwXc(4)).unwrap();
        let mut offsets = desc.offsets().unwrap();
        assert_eq!(offsets.len(), desc.numel());
        assert!(offsets.iter().all(|&o| o < desc.padded_numel()));
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), desc.numel());
    }

    #[test]
    fn any_has_no_offsets() {
        let desc = MemoryDesc::new(vec![2, 2], DataType::F32, MemoryFormat::Any).unwrap();
        assert!(desc.offsets().is_err());
    }
}
