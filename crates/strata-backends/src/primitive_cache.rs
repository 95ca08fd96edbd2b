//! Caching of compiled primitives
//!
//! Compiling a primitive validates its descriptor and precomputes the index
//! tables the kernels walk. Plans for the same shape ask for the same
//! primitive again and again, so backends keep what they compiled here and
//! hand out `Arc` clones on every later request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::desc::PrimitiveDesc;
use crate::error::Result;
use crate::primitive::Primitive;

/// Cache key for compiled primitives
///
/// The negotiated descriptor fully determines the primitive, layouts and
/// scratchpad size included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimitiveKey {
    /// Operation name (e.g. "softmax_forward", "reorder")
    pub operation: &'static str,
    pub desc: PrimitiveDesc,
}

impl PrimitiveKey {
    pub fn new(desc: &PrimitiveDesc) -> Self {
        Self {
            operation: desc.name(),
            desc: desc.clone(),
        }
    }
}

/// Thread-safe primitive cache
///
/// Reads take a shared lock; only a miss takes the write lock. Two threads
/// racing on the same key may both compile, but only the first result is
/// kept and both callers receive it.
#[derive(Default)]
pub struct PrimitiveCache {
    entries: RwLock<HashMap<PrimitiveKey, Arc<Primitive>>>,
}

impl PrimitiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `key`, compiling with `f` on a miss
    ///
    /// Returns the primitive and whether it came from the cache. A failed
    /// compilation caches nothing.
    pub fn get_or_try_create<F>(&self, key: &PrimitiveKey, f: F) -> Result<(Arc<Primitive>, bool)>
    where
        F: FnOnce() -> Result<Primitive>,
    {
        // Fast path: read lock for cache lookup
        if let Some(primitive) = self.entries.read().get(key) {
            return Ok((Arc::clone(primitive), true));
        }

        let primitive = Arc::new(f()?);

        // Check again in case another thread inserted while we were compiling
        let mut entries = self.entries.write();
        let cached = entries.entry(key.clone()).or_insert_with(|| Arc::clone(&primitive));
        Ok((Arc::clone(cached), false))
    }

    pub fn get(&self, key: &PrimitiveKey) -> Option<Arc<Primitive>> {
        self.entries.read().get(key).cloned()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
