//! Identity channel
//!
//! Derives a stable identity token from an opaque script value without
//! retaining it, and stashes a non-retaining handle that can resolve the
//! value back while it is alive. Scalars and interned strings have no
//! distinguishable address, so they have no token — the pool degrades
//! gracefully for them.

use moonlet_vm_gc::{ObjRef, Value};
use std::num::NonZeroUsize;

/// Stable identity token for a heap value.
///
/// Compares equal only for genuinely-the-same referent, stays fixed for the
/// referent's lifetime (the heap is non-moving), and holds no reference —
/// a token may outlive the value it once denoted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(NonZeroUsize);

impl ValueId {
    pub(crate) fn of(obj: ObjRef) -> Self {
        // Heap cells are boxed allocations, never at address zero
        Self(NonZeroUsize::new(obj.addr()).expect("heap cell at null address"))
    }

    /// The raw token value.
    pub fn as_usize(self) -> usize {
        self.0.get()
    }
}

impl std::fmt::Debug for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueId({:#x})", self.0.get())
    }
}

/// Extract the identity token of a value.
///
/// Returns `None` for values without heap identity (nil, booleans, numbers,
/// interned strings).
pub fn value_id(value: &Value) -> Option<ValueId> {
    value.as_object().map(ValueId::of)
}

/// Non-retaining handle: the value's heap reference copied into storage the
/// collector never traces.
///
/// By itself this keeps nothing alive. Resolving is only legal while the
/// pool knows the referent has not been reclaimed (slot status Alive or
/// Resurrected); the stored reference stays valid for the referent's whole
/// lifetime because the host heap never moves cells.
pub(crate) struct InertValue {
    obj: ObjRef,
}

impl InertValue {
    pub(crate) fn capture(value: &Value) -> Option<Self> {
        value.as_object().map(|obj| Self { obj })
    }

    pub(crate) fn obj(&self) -> ObjRef {
        self.obj
    }

    /// Reconstruct the value.
    pub(crate) fn resolve(&self) -> Value {
        Value::Object(self.obj)
    }
}

impl std::fmt::Debug for InertValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InertValue({:#x})", self.obj.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonlet_vm_gc::Heap;

    #[test]
    fn test_scalars_have_no_token() {
        assert!(value_id(&Value::Nil).is_none());
        assert!(value_id(&Value::Boolean(true)).is_none());
        assert!(value_id(&Value::Integer(42)).is_none());
        assert!(value_id(&Value::Number(0.5)).is_none());
        assert!(value_id(&Value::string("interned")).is_none());
    }

    #[test]
    fn test_token_is_stable_and_distinct() {
        let heap = Heap::new();
        let a = heap.alloc_table();
        let b = heap.alloc_table();

        assert_eq!(value_id(&a), value_id(&a.clone()));
        assert_ne!(value_id(&a), value_id(&b));
    }

    #[test]
    fn test_inert_round_trip() {
        let heap = Heap::new();
        let a = heap.alloc_userdata();

        let inert = InertValue::capture(&a).unwrap();
        assert_eq!(inert.resolve(), a);
        assert!(InertValue::capture(&Value::Integer(1)).is_none());
    }
}
