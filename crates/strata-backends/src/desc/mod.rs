//! Memory, operation and primitive descriptors

mod memory;
mod op;

pub use memory::{DataType, MemoryDesc, MemoryFormat};
pub use op::{OpDesc, PrimitiveDesc, PropKind};
