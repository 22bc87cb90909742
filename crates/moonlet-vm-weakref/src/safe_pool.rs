//! Strong-retention fallback pool
//!
//! For platforms where the non-retaining handle trick is unavailable (a
//! moving host collector, or no post-mortem callback seam at all). The
//! trade-off is documented and deliberate: marked values are retained
//! strongly, so they never die behind the runtime's back — and therefore
//! survive until a shutdown drain extracts them. Pending extractions are
//! always empty.

use crate::identity::{ValueId, value_id};
use crate::pool::{MarkFlags, RefPool};
use crate::weak_ref::WeakRef;
use moonlet_vm_gc::Value;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

struct SafeSlot {
    value: Value,
    mark_order: u64,
    flags: MarkFlags,
}

#[derive(Default)]
struct SafeState {
    registry: FxHashMap<ValueId, SafeSlot>,
    last_mark_order: u64,
}

/// Fallback pool that retains marked values strongly.
///
/// Same [`RefPool`] surface as [`WeakRefPool`](crate::pool::WeakRefPool);
/// handles always resolve, and marked values reach the runtime only through
/// `extract_all_marked_*`.
pub struct SafeRefPool {
    state: Mutex<SafeState>,
}

impl SafeRefPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SafeState::default()),
        }
    }
}

impl Default for SafeRefPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RefPool for SafeRefPool {
    fn get(&self, value: &Value) -> WeakRef {
        WeakRef::strong(value.clone())
    }

    fn mark(&self, value: &Value, flags: MarkFlags) {
        let Some(id) = value_id(value) else {
            return;
        };
        let mut state = self.state.lock();
        state.last_mark_order += 1;
        let order = state.last_mark_order;
        let slot = state.registry.entry(id).or_insert_with(|| SafeSlot {
            value: value.clone(),
            mark_order: 0,
            flags: MarkFlags::NONE,
        });
        slot.mark_order = order;
        slot.flags |= flags;
    }

    fn extract_pending_finalize(&self) -> Vec<Value> {
        // Retained values never die behind the runtime's back
        Vec::new()
    }

    fn extract_pending_release(&self) -> Vec<Value> {
        Vec::new()
    }

    fn extract_all_marked_finalize(&self) -> Vec<Value> {
        self.extract_all_marked(MarkFlags::FINALIZE)
    }

    fn extract_all_marked_release(&self) -> Vec<Value> {
        self.extract_all_marked(MarkFlags::RELEASE)
    }
}

impl SafeRefPool {
    fn extract_all_marked(&self, which: MarkFlags) -> Vec<Value> {
        let mut state = self.state.lock();
        let mut extracted: Vec<(Value, u64)> = Vec::new();

        state.registry.retain(|_, slot| {
            if !slot.flags.contains(which) {
                return true;
            }
            extracted.push((slot.value.clone(), slot.mark_order));
            slot.flags = MarkFlags::from_bits(slot.flags.bits() & !which.bits());
            // Once no callback remains, stop retaining the value
            !slot.flags.is_empty()
        });

        extracted.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        extracted.into_iter().map(|(value, _)| value).collect()
    }
}

impl std::fmt::Debug for SafeRefPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SafeRefPool")
            .field("registered", &state.registry.len())
            .field("last_mark_order", &state.last_mark_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonlet_vm_gc::Heap;

    #[test]
    fn test_handles_always_resolve() {
        let heap = Heap::new();
        let pool = SafeRefPool::new();

        let a = heap.alloc_table();
        let handle = pool.get(&a);
        assert_eq!(handle.value(), Some(a.clone()));
        assert!(handle.is_alive());
    }

    #[test]
    fn test_marked_values_drain_in_reverse_order() {
        let heap = Heap::new();
        let pool = SafeRefPool::new();

        let a = heap.alloc_table();
        let b = heap.alloc_table();
        pool.mark(&a, MarkFlags::FINALIZE);
        pool.mark(&b, MarkFlags::FINALIZE);

        assert!(pool.extract_pending_finalize().is_empty());
        assert_eq!(pool.extract_all_marked_finalize(), vec![b, a]);
        assert!(pool.extract_all_marked_finalize().is_empty());
    }

    #[test]
    fn test_release_mark_survives_finalize_drain() {
        let heap = Heap::new();
        let pool = SafeRefPool::new();

        let a = heap.alloc_userdata();
        pool.mark(&a, MarkFlags::FINALIZE | MarkFlags::RELEASE);

        assert_eq!(pool.extract_all_marked_finalize(), vec![a.clone()]);
        assert_eq!(pool.extract_all_marked_release(), vec![a]);
        assert!(pool.extract_all_marked_release().is_empty());
    }
}
