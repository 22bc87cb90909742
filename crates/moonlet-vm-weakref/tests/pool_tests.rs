//! Pool correctness tests
//!
//! End-to-end scenarios driving the weak-ref pool through real collection
//! cycles: weak observation, reverse-order finalization, resurrection,
//! dual callbacks, shutdown drains, and remarking.

use moonlet_vm_gc::{Heap, Value};
use moonlet_vm_weakref::{MarkFlags, RefPool, WeakRefPool};
use parking_lot::Mutex;
use std::sync::Arc;

/// A heap wired to a fresh pool.
fn rig() -> (Heap, Arc<WeakRefPool>) {
    let heap = Heap::new();
    let pool = Arc::new(WeakRefPool::new());
    heap.set_post_mortem(pool.clone());
    (heap, pool)
}

#[test]
fn test_get_round_trips_and_is_canonical() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();

    let handle = pool.get(&a);
    assert_eq!(handle.value(), Some(a.clone()));
    // Same canonical handle on every get, no state reset
    assert_eq!(pool.get(&a), handle);

    let b = heap.alloc_table();
    assert_ne!(pool.get(&b), handle);
}

#[test]
fn test_get_on_scalars_degenerates_to_strong() {
    let (_heap, pool) = rig();

    for value in [
        Value::Nil,
        Value::Boolean(false),
        Value::Integer(9),
        Value::Number(2.5),
        Value::string("interned"),
    ] {
        let handle = pool.get(&value);
        assert_eq!(handle.value(), Some(value));
        assert!(handle.is_alive());
    }
}

#[test]
fn test_weak_handle_observes_collection() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let handle = pool.get(&a);

    // Rooted, the value survives
    heap.collect(std::slice::from_ref(&a));
    assert!(handle.is_alive());

    // Unrooted, it does not — and the handle sees that
    heap.collect(&[]);
    assert!(!handle.is_alive());
    assert_eq!(handle.value(), None);
    assert_eq!(heap.object_count(), 0);
}

#[test]
fn test_unmarked_death_enqueues_nothing() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let _handle = pool.get(&a);

    heap.collect(&[]);
    assert!(pool.extract_pending_finalize().is_empty());
    assert!(pool.extract_pending_release().is_empty());
}

#[test]
fn test_finalizers_extract_in_reverse_mark_order() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let b = heap.alloc_table();
    let c = heap.alloc_table();

    pool.mark(&a, MarkFlags::FINALIZE);
    pool.mark(&b, MarkFlags::FINALIZE);
    pool.mark(&c, MarkFlags::FINALIZE);

    heap.collect(&[]);
    assert_eq!(pool.extract_pending_finalize(), vec![c, b, a]);
}

#[test]
fn test_extraction_returns_each_value_exactly_once() {
    let (heap, pool) = rig();
    let a = heap.alloc_userdata();
    pool.mark(&a, MarkFlags::FINALIZE);

    heap.collect(&[]);
    assert_eq!(pool.extract_pending_finalize(), vec![a.clone()]);
    assert!(pool.extract_pending_finalize().is_empty());

    // The extracted value was handed back to the runtime; once dropped, the
    // next cycle frees it silently
    drop(a);
    heap.collect(&[]);
    assert!(pool.extract_pending_finalize().is_empty());
    assert_eq!(heap.object_count(), 0);
}

#[test]
fn test_resurrection_defers_death() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let handle = pool.get(&a);
    pool.mark(&a, MarkFlags::FINALIZE);

    // Observing the value revives it for the cycle already in flight
    let observed = handle.value().expect("value still alive");
    drop(observed);
    drop(a);

    heap.collect(&[]);
    assert!(pool.extract_pending_finalize().is_empty());
    assert!(handle.is_alive());

    // A cycle in which nobody observed it finally schedules the death
    heap.collect(&[]);
    let extracted = pool.extract_pending_finalize();
    assert_eq!(extracted.len(), 1);
    assert!(!handle.is_alive());
}

#[test]
fn test_repeated_observation_keeps_value_alive() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let handle = pool.get(&a);
    pool.mark(&a, MarkFlags::FINALIZE);
    drop(a);

    for _ in 0..3 {
        assert!(handle.value().is_some());
        heap.collect(&[]);
        assert!(handle.is_alive());
    }

    // One unobserved cycle is all it takes
    heap.collect(&[]);
    assert_eq!(handle.value(), None);
    assert_eq!(pool.extract_pending_finalize().len(), 1);
}

#[test]
fn test_dual_flags_enqueue_once_each() {
    let (heap, pool) = rig();
    let a = heap.alloc_userdata();
    pool.mark(&a, MarkFlags::FINALIZE | MarkFlags::RELEASE);

    heap.collect(&[]);
    assert_eq!(pool.extract_pending_finalize(), vec![a.clone()]);
    assert_eq!(pool.extract_pending_release(), vec![a.clone()]);
    assert!(pool.extract_pending_finalize().is_empty());
    assert!(pool.extract_pending_release().is_empty());
}

#[test]
fn test_shutdown_drain_covers_uncollected_marks() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let b = heap.alloc_table();
    pool.mark(&a, MarkFlags::FINALIZE);
    pool.mark(&b, MarkFlags::FINALIZE);

    // Neither value has died, yet the shutdown drain reaches both
    assert_eq!(pool.extract_all_marked_finalize(), vec![b.clone(), a.clone()]);
    assert!(pool.extract_all_marked_finalize().is_empty());

    // Their marks are consumed: dying later enqueues nothing
    drop(a);
    drop(b);
    heap.collect(&[]);
    assert!(pool.extract_pending_finalize().is_empty());
}

#[test]
fn test_remark_moves_value_to_front() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let b = heap.alloc_table();

    pool.mark(&a, MarkFlags::FINALIZE);
    pool.mark(&b, MarkFlags::FINALIZE);
    pool.mark(&a, MarkFlags::FINALIZE); // remark: a now newest

    heap.collect(&[]);
    assert_eq!(pool.extract_pending_finalize(), vec![a, b]);
}

#[test]
fn test_all_marked_clears_only_matching_flag() {
    let (heap, pool) = rig();
    let a = heap.alloc_userdata();
    pool.mark(&a, MarkFlags::FINALIZE | MarkFlags::RELEASE);

    assert_eq!(pool.extract_all_marked_finalize(), vec![a.clone()]);

    // The release mark is untouched and still fires on death
    drop(a);
    heap.collect(&[]);
    assert!(pool.extract_pending_finalize().is_empty());
    assert_eq!(pool.extract_pending_release().len(), 1);
}

#[test]
fn test_all_marked_also_drains_pending() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let b = heap.alloc_table();

    pool.mark(&a, MarkFlags::FINALIZE);
    drop(a);
    heap.collect(std::slice::from_ref(&b)); // a dies, b survives
    pool.mark(&b, MarkFlags::FINALIZE);

    let drained = pool.extract_all_marked_finalize();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0], b); // marked later, extracted first
    assert!(pool.extract_pending_finalize().is_empty());
}

#[test]
fn test_prefinalizer_runs_on_extraction() {
    let (heap, pool) = rig();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    let hook_seen = seen.clone();
    let hook_pool = pool.clone();
    pool.set_prefinalizer(Arc::new(move |values| {
        hook_seen.lock().extend(values.iter().cloned());
        // The hook runs outside the pool lock, so calling back in is fine
        let _ = hook_pool.get(&Value::Integer(0));
        values
    }));

    let a = heap.alloc_table();
    let b = heap.alloc_table();
    pool.mark(&a, MarkFlags::FINALIZE);
    pool.mark(&b, MarkFlags::FINALIZE);

    heap.collect(&[]);
    assert_eq!(pool.extract_pending_finalize(), vec![b.clone(), a.clone()]);
    assert_eq!(*seen.lock(), vec![b, a]);
}

#[test]
fn test_close_kills_remaining_handles() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let b = heap.alloc_table();
    let handle = pool.get(&a);
    pool.mark(&b, MarkFlags::FINALIZE);
    drop(b);
    heap.collect(std::slice::from_ref(&a)); // b dies and is parked

    pool.close();
    assert_eq!(handle.value(), None);
    assert!(pool.extract_pending_finalize().is_empty());

    // The armed headers now raise spurious callbacks, which are ignored,
    // and the cells are freed
    drop(a);
    heap.collect(&[]);
    assert_eq!(heap.object_count(), 0);
}

#[test]
fn test_remark_after_extraction_starts_fresh_lifecycle() {
    let (heap, pool) = rig();
    let a = heap.alloc_userdata();
    let first = pool.get(&a);
    pool.mark(&a, MarkFlags::FINALIZE);

    heap.collect(&[]);
    let extracted = pool.extract_pending_finalize();
    assert_eq!(extracted, vec![a.clone()]);
    assert_eq!(first.value(), None);

    // The script set a finalizer again on the revived value
    pool.mark(&a, MarkFlags::FINALIZE);
    let second = pool.get(&a);
    assert_ne!(second, first);
    assert!(second.value().is_some());

    drop(a);
    heap.collect(&[]); // second.value() above resurrected it
    heap.collect(&[]);
    assert_eq!(pool.extract_pending_finalize().len(), 1);
}

#[test]
fn test_callbacks_arrive_from_collector_thread() {
    let (heap, pool) = rig();
    let a = heap.alloc_table();
    let b = heap.alloc_table();
    let handle = pool.get(&a);
    pool.mark(&a, MarkFlags::FINALIZE);
    pool.mark(&b, MarkFlags::FINALIZE | MarkFlags::RELEASE);
    drop(a);
    drop(b);

    // The host collector delivers reclamation events from its own thread;
    // the pool mutex is the only synchronization point.
    let heap = std::thread::spawn(move || {
        heap.collect(&[]);
        heap
    })
    .join()
    .expect("collector thread panicked");

    assert_eq!(handle.value(), None);
    assert_eq!(pool.extract_pending_finalize().len(), 2);
    assert_eq!(pool.extract_pending_release().len(), 1);
    drop(heap);
}
