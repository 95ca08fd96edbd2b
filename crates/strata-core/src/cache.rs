//! Per-context instance cache
//!
//! Maps an execution-context key (a stream name, a request id) to the
//! softmax instance built for it, so repeated calls on the same context
//! reuse the compiled plan.
//!
//! # Locking
//!
//! The registry lock is held only long enough to find or insert a per-key
//! slot, and never while waiting on a slot. Construction happens under that
//! slot's own mutex: lookups for different keys never wait on each other,
//! and concurrent lookups for the same key build exactly one instance.
//!
//! A slot that leaves the registry (through `remove`, `clear` or a failed
//! construction) is retired before anyone can build into it again; a lookup
//! that was already waiting on it starts over with the registered slot, so
//! a key never has two live instances.
//!
//! `contains`, `keys` and `len` only report keys whose instance is built.
//! A key whose construction is still running is invisible to them and to
//! `get`, none of which wait for it.
//!
//! # Shape conflicts and eviction
//!
//! A key's shape is fixed at first use; asking for it again with another
//! shape or axis fails with [`Error::ContextShapeMismatch`] and leaves the
//! cached instance in place. Nothing is evicted automatically: the owner
//! calls [`InstanceCache::remove`] or [`InstanceCache::clear`] when a
//! context ends, and an instance's resources are released once its last
//! handle is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::buffer::Buffer;
use crate::element::Element;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::shape::ShapeDescriptor;
use crate::softmax::Softmax;

/// Handle to a cached instance; clones refer to the same operator
pub type SharedSoftmax<T> = Arc<Mutex<Softmax<T>>>;

struct CacheEntry<T: Element> {
    shape: ShapeDescriptor,
    instance: SharedSoftmax<T>,
}

enum SlotState<T: Element> {
    /// Registered, nothing built yet (or a build is in progress)
    Vacant,
    Ready(CacheEntry<T>),
    /// No longer registered; lookups must start over
    Retired,
}

struct SlotCell<T: Element> {
    state: Mutex<SlotState<T>>,
    /// Mirrors `state` being `Ready`, readable without the slot lock
    ready: AtomicBool,
}

impl<T: Element> SlotCell<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Vacant),
            ready: AtomicBool::new(false),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Retire the slot, handing back its entry if one was built
    fn retire(&self) -> Option<CacheEntry<T>> {
        let mut state = self.state.lock();
        self.ready.store(false, Ordering::Release);
        match std::mem::replace(&mut *state, SlotState::Retired) {
            SlotState::Ready(entry) => Some(entry),
            SlotState::Vacant | SlotState::Retired => None,
        }
    }
}

type Slot<T> = Arc<SlotCell<T>>;

/// Registry of softmax instances keyed by execution context
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use strata_core::{Engine, InstanceCache};
///
/// let engine = Engine::new()?;
/// let cache = InstanceCache::<f32>::new(&engine);
///
/// let a = cache.get_or_create("stream-0", [8, 10], 1)?;
/// let b = cache.get_or_create("stream-0", [8, 10], 1)?;
/// assert!(Arc::ptr_eq(&a, &b));
/// assert!(cache.get_or_create("stream-0", [8, 12], 1).is_err());
/// # Ok::<(), strata_core::Error>(())
/// ```
pub struct InstanceCache<T: Element> {
    engine: Engine,
    slots: RwLock<HashMap<String, Slot<T>>>,
}

impl<T: Element> InstanceCache<T> {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn slot(&self, key: &str) -> Slot<T> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.slots
                .write()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(SlotCell::new())),
        )
    }

    /// Return the instance registered for `key`, building and setting up a
    /// new one on first use
    #[tracing::instrument(skip(self, dims), fields(key = %key))]
    pub fn get_or_create(&self, key: &str, dims: impl Into<Vec<usize>>, axis: usize) -> Result<SharedSoftmax<T>> {
        let shape = ShapeDescriptor::new(dims, axis)?;

        loop {
            let slot = self.slot(key);
            let mut state = slot.state.lock();

            match &*state {
                SlotState::Retired => {
                    tracing::trace!(key = %key, "instance_cache_slot_retired");
                    continue;
                }
                SlotState::Ready(entry) => {
                    if entry.shape != shape {
                        return Err(Error::ContextShapeMismatch {
                            key: key.to_string(),
                            cached: entry.shape.to_string(),
                            requested: shape.to_string(),
                        });
                    }
                    tracing::debug!(key = %key, shape = %shape, "instance_cache_hit");
                    return Ok(Arc::clone(&entry.instance));
                }
                SlotState::Vacant => {}
            }

            tracing::debug!(key = %key, shape = %shape, "instance_cache_miss");
            let built = Softmax::from_shape(&self.engine, shape.clone()).and_then(|mut softmax| {
                softmax.setup_forward()?;
                Ok(softmax)
            });

            return match built {
                Ok(softmax) => {
                    let instance = Arc::new(Mutex::new(softmax));
                    *state = SlotState::Ready(CacheEntry {
                        shape,
                        instance: Arc::clone(&instance),
                    });
                    slot.ready.store(true, Ordering::Release);
                    Ok(instance)
                }
                Err(err) => {
                    // Waiters see the retired slot and retry against a fresh one
                    *state = SlotState::Retired;
                    self.unregister(key, &slot);
                    Err(err)
                }
            };
        }
    }

    /// Remove `slot` from the registry if it is still the one registered for `key`
    fn unregister(&self, key: &str, slot: &Slot<T>) {
        let mut slots = self.slots.write();
        if slots.get(key).is_some_and(|registered| Arc::ptr_eq(registered, slot)) {
            slots.remove(key);
        }
    }

    /// Look up or create the instance for `key` and bind the caller's
    /// source and destination buffers to it
    pub fn create_forward(
        &self,
        key: &str,
        src: &Buffer<T>,
        dst: &Buffer<T>,
        dims: impl Into<Vec<usize>>,
        axis: usize,
    ) -> Result<SharedSoftmax<T>> {
        let instance = self.get_or_create(key, dims, axis)?;
        instance.lock().update_user_mem(src, dst);
        Ok(instance)
    }

    /// Instance registered for `key`, if any
    pub fn get(&self, key: &str) -> Option<SharedSoftmax<T>> {
        let slot = self.slots.read().get(key).map(Arc::clone)?;
        if !slot.is_ready() {
            return None;
        }
        let instance = match &*slot.state.lock() {
            SlotState::Ready(entry) => Some(Arc::clone(&entry.instance)),
            SlotState::Vacant | SlotState::Retired => None,
        };
        instance
    }

    /// Unregister `key`, returning its instance
    ///
    /// The instance stays usable through outstanding handles and is
    /// released with the last one.
    pub fn remove(&self, key: &str) -> Option<SharedSoftmax<T>> {
        let slot = self.slots.write().remove(key)?;
        let entry = slot.retire();
        if entry.is_some() {
            tracing::debug!(key = %key, "instance_cache_evicted");
        }
        entry.map(|entry| entry.instance)
    }

    /// Unregister every key
    pub fn clear(&self) {
        let drained: Vec<_> = self.slots.write().drain().collect();
        let entries = drained.iter().filter_map(|(_, slot)| slot.retire()).count();
        tracing::debug!(entries, "instance_cache_cleared");
    }

    /// Whether a built instance is registered for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.slots.read().get(key).is_some_and(|slot| slot.is_ready())
    }

    /// Keys with a built instance
    pub fn keys(&self) -> Vec<String> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.is_ready())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of built instances
    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|slot| slot.is_ready()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Element> fmt::Debug for InstanceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCache")
            .field("engine", &self.engine)
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::softmax::OperatorState;
    use std::thread;

    fn engine() -> Engine {
        Engine::with_config(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_get_or_create_reuses_instance() {
        let engine = engine();
        let cache = InstanceCache::<f32>::new(&engine);

        let a = cache.get_or_create("ctx", [2, 8, 4, 4], 1).unwrap();
        let b = cache.get_or_create("ctx", vec![2, 8, 4, 4], 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(a.lock().state(), OperatorState::PlanBuilt);
    }

    #[test]
    fn test_shape_conflict_is_rejected() {
        let engine = engine();
        let cache = InstanceCache::<f32>::new(&engine);
        let original = cache.get_or_create("ctx", [4, 10], 1).unwrap();

        let err = cache.get_or_create("ctx", [4, 10], 0).unwrap_err();
        assert!(matches!(err, Error::ContextShapeMismatch { ref key, .. } if key == "ctx"));
        assert!(Arc::ptr_eq(&original, &cache.get("ctx").unwrap()));
    }

    #[test]
    fn test_failed_construction_is_not_registered() {
        let engine = engine();
        let cache = InstanceCache::<f64>::new(&engine);

        assert!(matches!(cache.get_or_create("bad-axis", [2, 3, 4, 5], 4), Err(Error::InvalidAxis { .. })));
        assert!(matches!(cache.get_or_create("bad-rank", [2, 3, 4], 0), Err(Error::UnsupportedRank(3))));
        assert!(cache.is_empty());
        assert_eq!(engine.with_cpu_backend(|cpu| cpu.stream_count()), Some(0));
    }

    #[test]
    fn test_same_key_builds_once_under_contention() {
        let engine = engine();
        let cache = Arc::new(InstanceCache::<f32>::new(&engine));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get_or_create("shared", [16, 32], 1).unwrap())
            })
            .collect();
        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
        assert_eq!(engine.with_cpu_backend(|cpu| cpu.stream_count()), Some(1));
    }

    #[test]
    fn test_remove_and_clear() {
        let engine = engine();
        let cache = InstanceCache::<f32>::new(&engine);
        cache.get_or_create("a", [2, 2], 1).unwrap();
        cache.get_or_create("b", [2, 2], 1).unwrap();

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        let removed = cache.remove("a").unwrap();
        assert!(!cache.contains("a"));
        assert!(cache.remove("a").is_none());
        drop(removed);
        assert_eq!(engine.with_cpu_backend(|cpu| cpu.stream_count()), Some(1));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(engine.with_cpu_backend(|cpu| cpu.stream_count()), Some(0));
    }

    #[test]
    fn test_lookup_waiting_on_removed_slot_rebuilds_registered() {
        let engine = engine();
        let cache = Arc::new(InstanceCache::<f32>::new(&engine));

        // Hold the slot as an in-flight construction would
        let orphan = cache.slot("k");
        let mut state = orphan.state.lock();

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_or_create("k", [2, 4], 1).unwrap())
        };
        thread::sleep(std::time::Duration::from_millis(20));

        // Unregister and retire while the waiter may be blocked on the slot, as `remove` does
        assert!(cache.slots.write().remove("k").is_some());
        *state = SlotState::Retired;
        drop(state);

        let built = waiter.join().unwrap();
        let registered = cache.get("k").unwrap();
        assert!(Arc::ptr_eq(&built, &registered));
        assert!(Arc::ptr_eq(&cache.get_or_create("k", [2, 4], 1).unwrap(), &built));
        assert!(matches!(*orphan.state.lock(), SlotState::Retired));
        assert_eq!(engine.with_cpu_backend(|cpu| cpu.stream_count()), Some(1));
    }

    #[test]
    fn test_remove_racing_get_or_create_leaves_one_instance() {
        let engine = engine();
        let cache = Arc::new(InstanceCache::<f32>::new(&engine));

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..50 {
                        if worker == 0 {
                            cache.remove("k");
                        } else {
                            cache.get_or_create("k", [2, 4], 1).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let kept = cache.get_or_create("k", [2, 4], 1).unwrap();
        assert!(Arc::ptr_eq(&kept, &cache.get("k").unwrap()));
        assert_eq!(cache.len(), 1);

        // Removed instances were released with their last handle
        drop(kept);
        assert_eq!(engine.with_cpu_backend(|cpu| cpu.stream_count()), Some(1));
    }

    #[test]
    fn test_pending_construction_is_not_reported() {
        let engine = engine();
        let cache = InstanceCache::<f32>::new(&engine);
        cache.get_or_create("built", [2, 2], 1).unwrap();

        let pending = cache.slot("pending");
        let _in_flight = pending.state.lock();

        assert!(cache.contains("built"));
        assert!(!cache.contains("pending"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.keys(), vec!["built".to_string()]);
        assert!(cache.get("pending").is_none());
    }
}
