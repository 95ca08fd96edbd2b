//! Element types the softmax operator is generic over

use std::fmt::Debug;

use num_traits::Float;
use strata_backends::DataType;

/// A floating-point element type with a backend representation
///
/// Implemented for `f32` and `f64`.
pub trait Element: bytemuck::Pod + Float + Debug + Send + Sync + 'static {
    /// Backend data type tag
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Element for f64 {
    const DATA_TYPE: DataType = DataType::F64;
}
