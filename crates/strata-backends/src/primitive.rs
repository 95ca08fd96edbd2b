//! Compiled primitives

use std::fmt;

use crate::desc::PrimitiveDesc;

/// An executable unit produced by [`Backend::compile`](crate::Backend::compile)
///
/// A primitive is immutable once compiled and is shared through `Arc`, so
/// one compiled softmax can serve many plans.
#[derive(Debug, PartialEq, Eq)]
pub struct Primitive {
    id: u64,
    desc: PrimitiveDesc,
}

impl Primitive {
    pub fn new(id: u64, desc: PrimitiveDesc) -> Self {
        Self { id, desc }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &PrimitiveDesc {
        &self.desc
    }

    pub fn name(&self) -> &'static str {
        self.desc.name()
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.desc.name(), self.id)
    }
}
