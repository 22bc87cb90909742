//! The weak-reference and finalization pool
//!
//! One [`WeakRefPool`] serves a whole runtime instance. It hands out
//! canonical [`WeakRef`] handles, tracks which values requested post-mortem
//! callbacks, and parks dead marked values in pending queues until the
//! runtime drains them.
//!
//! A single mutex protects the registry, both pending queues, the marking
//! counter, and every slot's mutable fields. Public methods and the
//! reclamation callback all acquire it; the reclamation callback may arrive
//! from whichever thread drives the host collector. The pre-finalization
//! hook runs outside the lock.

use crate::identity::{InertValue, ValueId, value_id};
use crate::weak_ref::{Status, WeakRef, WeakSlot};
use moonlet_vm_gc::{ObjRef, PostMortem, PostMortemHandler, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Post-mortem callback kinds requested for a value.
///
/// A small bitset: `FINALIZE` is the script-level finalizer (the `__gc`
/// metamethod), `RELEASE` the runtime-internal resource-cleanup callback.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkFlags(u8);

impl MarkFlags {
    /// No callbacks requested.
    pub const NONE: MarkFlags = MarkFlags(0);
    /// Script-level finalizer.
    pub const FINALIZE: MarkFlags = MarkFlags(1);
    /// Runtime-internal resource release.
    pub const RELEASE: MarkFlags = MarkFlags(2);

    const KNOWN: u8 = 0b11;

    /// Build from raw bits. Unknown bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::KNOWN)
    }

    /// The raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: MarkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for MarkFlags {
    type Output = MarkFlags;

    fn bitor(self, rhs: MarkFlags) -> MarkFlags {
        MarkFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MarkFlags {
    fn bitor_assign(&mut self, rhs: MarkFlags) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for MarkFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.contains(Self::FINALIZE), self.contains(Self::RELEASE)) {
            (true, true) => write!(f, "FINALIZE|RELEASE"),
            (true, false) => write!(f, "FINALIZE"),
            (false, true) => write!(f, "RELEASE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

/// Hook applied to every finalize-extraction result, outside the pool lock.
///
/// Must preserve order and must not call back into the pool with blocking
/// semantics.
pub type Prefinalizer = Arc<dyn Fn(Vec<Value>) -> Vec<Value> + Send + Sync>;

/// The pool contract the runtime programs against.
///
/// Implemented by [`WeakRefPool`] and by the strong-retention fallback
/// [`SafeRefPool`](crate::safe_pool::SafeRefPool), so a runtime can swap
/// pools without touching call sites.
pub trait RefPool {
    /// Canonical weak handle for a value, created on first use.
    ///
    /// A repeated `get` returns the same handle, with no flag or state
    /// reset. Values without heap identity get a degenerate strong handle,
    /// preserving the `get`-then-`value` round trip.
    fn get(&self, value: &Value) -> WeakRef;

    /// Request post-mortem callbacks for a value.
    ///
    /// Assigns the next marking-order number and unions `flags` into the
    /// handle's flags; remarking an already-marked value moves it later in
    /// extraction order. No-op for values without heap identity.
    fn mark(&self, value: &Value, flags: MarkFlags);

    /// Drain values that died finalize-marked since the last call,
    /// most recently marked first.
    fn extract_pending_finalize(&self) -> Vec<Value>;

    /// Drain values that died release-marked since the last call,
    /// most recently marked first.
    fn extract_pending_release(&self) -> Vec<Value>;

    /// Every finalize-marked value, dead or alive, most recently marked
    /// first; clears the finalize mark so none of them is ever returned by
    /// a finalize extraction again. Also drains the pending queue.
    fn extract_all_marked_finalize(&self) -> Vec<Value>;

    /// Symmetric to [`extract_all_marked_finalize`](Self::extract_all_marked_finalize)
    /// for release marks.
    fn extract_all_marked_release(&self) -> Vec<Value>;
}

/// A dead value parked until extraction. Holding the value here is what
/// keeps it alive: the pool reports queued values as collector roots.
struct PendingEntry {
    value: Value,
    mark_order: u64,
}

#[derive(Default)]
pub(crate) struct PoolState {
    /// Identity token → canonical slot; at most one entry per token
    registry: FxHashMap<ValueId, Arc<WeakSlot>>,
    pending_finalize: Vec<PendingEntry>,
    pending_release: Vec<PendingEntry>,
    /// Monotonic marking counter; 0 means "never marked"
    last_mark_order: u64,
}

/// State shared between the pool and the handles it gave out.
pub(crate) struct PoolShared {
    pub(crate) state: Mutex<PoolState>,
}

/// Weak-reference and finalization pool backed by the host collector.
///
/// Register it with the heap (`heap.set_post_mortem(pool.clone())`) so
/// reclamation events reach it.
pub struct WeakRefPool {
    shared: Arc<PoolShared>,
    prefinalizer: Mutex<Option<Prefinalizer>>,
}

impl WeakRefPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
            }),
            prefinalizer: Mutex::new(None),
        }
    }

    /// Install the pre-finalization hook.
    pub fn set_prefinalizer(&self, hook: Prefinalizer) {
        *self.prefinalizer.lock() = Some(hook);
    }

    /// Tear the pool down: every still-registered handle goes Dead and the
    /// queued strong references are dropped.
    ///
    /// Call after the shutdown drains (`extract_all_marked_*`), before the
    /// heap itself is discarded. Reclamation callbacks arriving afterwards
    /// find no registry entry and are ignored.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        for slot in state.registry.values() {
            slot.set_status(Status::Dead);
        }
        state.registry.clear();
        state.pending_finalize.clear();
        state.pending_release.clear();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "moonlet::weakref", "pool closed");
    }

    /// Canonical slot for a value, created (and its callback armed) on
    /// first sight. `None` for values without heap identity.
    fn ensure_slot(state: &mut PoolState, value: &Value) -> Option<Arc<WeakSlot>> {
        let id = value_id(value)?;
        if let Some(slot) = state.registry.get(&id) {
            return Some(slot.clone());
        }
        let inert = InertValue::capture(value)?;
        // SAFETY: the caller handed us the value, so the referent is live.
        unsafe { inert.obj().header().arm_post_mortem() };
        let slot = Arc::new(WeakSlot::new(id, inert));
        state.registry.insert(id, slot.clone());
        Some(slot)
    }

    fn run_prefinalizer(&self, values: Vec<Value>) -> Vec<Value> {
        let hook = self.prefinalizer.lock().clone();
        match hook {
            Some(hook) => hook(values),
            None => values,
        }
    }
}

impl Default for WeakRefPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RefPool for WeakRefPool {
    fn get(&self, value: &Value) -> WeakRef {
        let mut state = self.shared.state.lock();
        match Self::ensure_slot(&mut state, value) {
            Some(slot) => WeakRef::pooled(self.shared.clone(), slot),
            None => WeakRef::strong(value.clone()),
        }
    }

    fn mark(&self, value: &Value, flags: MarkFlags) {
        let mut state = self.shared.state.lock();
        let Some(slot) = Self::ensure_slot(&mut state, value) else {
            // Values without heap identity cannot be finalized
            return;
        };
        state.last_mark_order += 1;
        slot.set_mark_order(state.last_mark_order);
        slot.union_flags(flags);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "moonlet::weakref",
            id = slot.id().as_usize(),
            order = state.last_mark_order,
            flags = ?slot.flags(),
            "value marked"
        );
    }

    fn extract_pending_finalize(&self) -> Vec<Value> {
        let drained = std::mem::take(&mut self.shared.state.lock().pending_finalize);
        self.run_prefinalizer(sorted_values(drained))
    }

    fn extract_pending_release(&self) -> Vec<Value> {
        let drained = std::mem::take(&mut self.shared.state.lock().pending_release);
        sorted_values(drained)
    }

    fn extract_all_marked_finalize(&self) -> Vec<Value> {
        let entries = {
            let mut state = self.shared.state.lock();
            let mut entries = std::mem::take(&mut state.pending_finalize);
            for slot in state.registry.values() {
                if slot.flags().contains(MarkFlags::FINALIZE) {
                    slot.clear_flag(MarkFlags::FINALIZE);
                    entries.push(PendingEntry {
                        value: slot.inert().resolve(),
                        mark_order: slot.mark_order(),
                    });
                }
            }
            entries
        };
        self.run_prefinalizer(sorted_values(entries))
    }

    fn extract_all_marked_release(&self) -> Vec<Value> {
        let entries = {
            let mut state = self.shared.state.lock();
            let mut entries = std::mem::take(&mut state.pending_release);
            for slot in state.registry.values() {
                if slot.flags().contains(MarkFlags::RELEASE) {
                    slot.clear_flag(MarkFlags::RELEASE);
                    entries.push(PendingEntry {
                        value: slot.inert().resolve(),
                        mark_order: slot.mark_order(),
                    });
                }
            }
            entries
        };
        sorted_values(entries)
    }
}

impl PostMortemHandler for WeakRefPool {
    fn on_reclaim(&self, obj: ObjRef) -> PostMortem {
        let mut state = self.shared.state.lock();
        let id = ValueId::of(obj);
        let Some(slot) = state.registry.get(&id).cloned() else {
            // Spurious callback: nothing registered under this token
            return PostMortem::Release;
        };

        if slot.status() == Status::Resurrected {
            // Somebody observed the value since the last callback; give it
            // another chance to die quietly.
            slot.set_status(Status::Alive);

            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "moonlet::weakref",
                id = id.as_usize(),
                "death cancelled by resurrection"
            );
            return PostMortem::Retain { rearm: true };
        }

        slot.set_status(Status::Dead);
        state.registry.remove(&slot.id());

        let flags = slot.flags();
        if flags.is_empty() {
            return PostMortem::Release;
        }

        // Enqueue-and-deregister is atomic under the lock, so a value can
        // enter each queue at most once in its lifetime.
        let mark_order = slot.mark_order();
        if flags.contains(MarkFlags::FINALIZE) {
            state.pending_finalize.push(PendingEntry {
                value: slot.inert().resolve(),
                mark_order,
            });
        }
        if flags.contains(MarkFlags::RELEASE) {
            state.pending_release.push(PendingEntry {
                value: slot.inert().resolve(),
                mark_order,
            });
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "moonlet::weakref",
            id = id.as_usize(),
            order = mark_order,
            flags = ?flags,
            "dead value parked for extraction"
        );

        PostMortem::Retain { rearm: false }
    }

    fn trace_roots(&self, tracer: &mut dyn FnMut(ObjRef)) {
        let state = self.shared.state.lock();
        for entry in state
            .pending_finalize
            .iter()
            .chain(state.pending_release.iter())
        {
            if let Some(obj) = entry.value.as_object() {
                tracer(obj);
            }
        }
    }
}

impl std::fmt::Debug for WeakRefPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WeakRefPool")
            .field("registered", &state.registry.len())
            .field("pending_finalize", &state.pending_finalize.len())
            .field("pending_release", &state.pending_release.len())
            .field("last_mark_order", &state.last_mark_order)
            .finish()
    }
}

/// Most recently marked first: finalizers run in reverse marking order,
/// because later objects may depend on earlier ones during destruction.
fn sorted_values(mut entries: Vec<PendingEntry>) -> Vec<Value> {
    entries.sort_unstable_by(|a, b| b.mark_order.cmp(&a.mark_order));
    entries.into_iter().map(|entry| entry.value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        assert_eq!(MarkFlags::FINALIZE.bits(), 1);
        assert_eq!(MarkFlags::RELEASE.bits(), 2);

        let both = MarkFlags::FINALIZE | MarkFlags::RELEASE;
        assert!(both.contains(MarkFlags::FINALIZE));
        assert!(both.contains(MarkFlags::RELEASE));
        assert!(!MarkFlags::FINALIZE.contains(both));
        assert!(MarkFlags::NONE.is_empty());
    }

    #[test]
    fn test_unknown_bits_ignored() {
        let flags = MarkFlags::from_bits(0b1111_0101);
        assert_eq!(flags, MarkFlags::FINALIZE);
    }

    #[test]
    fn test_mark_on_scalar_is_a_no_op() {
        let pool = WeakRefPool::new();
        pool.mark(&Value::Integer(3), MarkFlags::FINALIZE);
        pool.mark(&Value::string("s"), MarkFlags::FINALIZE | MarkFlags::RELEASE);

        assert!(pool.extract_all_marked_finalize().is_empty());
        assert!(pool.extract_all_marked_release().is_empty());
    }

    #[test]
    fn test_extraction_on_empty_pool() {
        let pool = WeakRefPool::new();
        assert!(pool.extract_pending_finalize().is_empty());
        assert!(pool.extract_pending_release().is_empty());
    }
}
