//! Weak reference handles
//!
//! A [`WeakRef`] observes a value's liveness without keeping it alive.
//! Pooled handles go through a tri-state machine:
//!
//! | event \ state       | Alive        | Resurrected       | Dead |
//! |---------------------|--------------|-------------------|------|
//! | `value()` called    | → Resurrected, yields V | → Resurrected, yields V | stays Dead, yields `None` |
//! | reclamation callback| → Dead (enqueue if marked) | → Alive (re-arm) | — |
//!
//! The `Resurrected` state is load-bearing: returning V from `value()`
//! hands the caller a strong reference the collector may already have
//! scheduled against. The next reclamation callback then downgrades to
//! `Alive` instead of enqueueing, deferring death to a cycle in which
//! nobody revived the value.

use crate::identity::{InertValue, ValueId};
use crate::pool::{MarkFlags, PoolShared};
use moonlet_vm_gc::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Liveness state of a pooled weak reference.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Referent reachable as far as the pool knows
    Alive = 0,
    /// Observed through `value()` since the last reclamation callback
    Resurrected = 1,
    /// Referent reclaimed (or pool closed); terminal
    Dead = 2,
}

impl Status {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Status::Resurrected,
            2 => Status::Dead,
            _ => Status::Alive,
        }
    }
}

/// Pool-owned record backing one weak reference.
///
/// There is at most one slot per identity token. Mutable fields are atomics
/// written only while the pool mutex is held; lock-free reads are racy
/// snapshots, good enough for `Debug` and [`WeakRef::is_alive`].
pub(crate) struct WeakSlot {
    id: ValueId,
    inert: InertValue,
    status: AtomicU8,
    mark_order: AtomicU64,
    flags: AtomicU8,
}

impl WeakSlot {
    pub(crate) fn new(id: ValueId, inert: InertValue) -> Self {
        Self {
            id,
            inert,
            status: AtomicU8::new(Status::Alive as u8),
            mark_order: AtomicU64::new(0),
            flags: AtomicU8::new(0),
        }
    }

    pub(crate) fn id(&self) -> ValueId {
        self.id
    }

    pub(crate) fn inert(&self) -> &InertValue {
        &self.inert
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn mark_order(&self) -> u64 {
        self.mark_order.load(Ordering::Acquire)
    }

    pub(crate) fn set_mark_order(&self, order: u64) {
        self.mark_order.store(order, Ordering::Release);
    }

    pub(crate) fn flags(&self) -> MarkFlags {
        MarkFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn union_flags(&self, flags: MarkFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flags: MarkFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

impl std::fmt::Debug for WeakSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSlot")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("mark_order", &self.mark_order())
            .field("flags", &self.flags())
            .finish()
    }
}

enum Repr {
    /// Canonical pool-backed handle
    Pooled {
        shared: Arc<PoolShared>,
        slot: Arc<WeakSlot>,
    },
    /// Degenerate handle for values without heap identity: `value()` always
    /// yields the original, at the cost of retaining it
    Strong(Value),
}

/// Handle observing one value's liveness.
///
/// Obtained from a pool's `get`; cheap to clone. Two handles for the same
/// referent compare equal and resolve to the same value.
pub struct WeakRef {
    repr: Repr,
}

impl WeakRef {
    pub(crate) fn pooled(shared: Arc<PoolShared>, slot: Arc<WeakSlot>) -> Self {
        Self {
            repr: Repr::Pooled { shared, slot },
        }
    }

    pub(crate) fn strong(value: Value) -> Self {
        Self {
            repr: Repr::Strong(value),
        }
    }

    /// Resolve the referent, if it is still alive.
    ///
    /// Returning the value revives it: the pool defers any already-scheduled
    /// death until a future cycle in which `value` was not called. `None`
    /// is the sole signal that the referent is dead.
    pub fn value(&self) -> Option<Value> {
        match &self.repr {
            Repr::Strong(value) => Some(value.clone()),
            Repr::Pooled { shared, slot } => {
                let _state = shared.state.lock();
                match slot.status() {
                    Status::Dead => None,
                    Status::Alive | Status::Resurrected => {
                        slot.set_status(Status::Resurrected);
                        Some(slot.inert().resolve())
                    }
                }
            }
        }
    }

    /// Lock-free liveness snapshot.
    ///
    /// Unlike [`value`](Self::value) this has no resurrection side effect,
    /// and the answer may be stale by the time the caller acts on it.
    pub fn is_alive(&self) -> bool {
        match &self.repr {
            Repr::Strong(_) => true,
            Repr::Pooled { slot, .. } => slot.status() != Status::Dead,
        }
    }
}

impl Clone for WeakRef {
    fn clone(&self) -> Self {
        match &self.repr {
            Repr::Pooled { shared, slot } => Self::pooled(shared.clone(), slot.clone()),
            Repr::Strong(value) => Self::strong(value.clone()),
        }
    }
}

impl PartialEq for WeakRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Pooled { slot: a, .. }, Repr::Pooled { slot: b, .. }) => Arc::ptr_eq(a, b),
            (Repr::Strong(a), Repr::Strong(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Strong(value) => f.debug_tuple("WeakRef::Strong").field(value).finish(),
            Repr::Pooled { slot, .. } => f.debug_tuple("WeakRef").field(slot).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [Status::Alive, Status::Resurrected, Status::Dead] {
            assert_eq!(Status::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_strong_handle_always_resolves() {
        let handle = WeakRef::strong(Value::Integer(42));
        assert!(handle.is_alive());
        assert_eq!(handle.value(), Some(Value::Integer(42)));
        assert_eq!(handle, handle.clone());
    }
}
