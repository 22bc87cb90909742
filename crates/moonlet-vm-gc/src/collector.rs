//! Mark/sweep collection
//!
//! A cycle runs four phases:
//!
//! 1. **Reset** — every cell goes back to white.
//! 2. **Mark** — trace from the caller's roots plus the post-mortem
//!    handler's roots (values parked in pending queues).
//! 3. **Post-mortem pass** — every still-white cell with an armed header is
//!    reported to the handler. `Retain` verdicts resurrect the cell and its
//!    subgraph for this cycle; `Release` verdicts leave it to the sweep.
//!    All verdicts are gathered before any subgraph is re-marked, so two
//!    unreachable finalizable objects referencing each other each get their
//!    own reclamation event in the same cycle.
//! 4. **Sweep** — free everything still white.

use crate::heap::{CELL_SIZE, Heap, PostMortem};
use crate::object::MarkColor;
use crate::value::{ObjRef, ObjectCell};

impl Heap {
    /// Run a full collection cycle.
    ///
    /// `roots` is the complete strong root set: globals, the stack, the
    /// registry. Anything not reachable from it (or from the handler's
    /// roots) is unreachable. Returns the number of bytes reclaimed.
    pub fn collect(&self, roots: &[crate::value::Value]) -> usize {
        let handler = self.post_mortem_handler();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "moonlet::gc",
            roots = roots.len(),
            heap_bytes = self.total_bytes(),
            objects = self.object_count(),
            "GC cycle starting"
        );

        // Phase 1: reset all marks to white
        {
            let cells = self.cells().borrow();
            for cell in cells.iter() {
                cell.header().set_mark(MarkColor::White);
            }
        }

        // Phase 2: mark from roots
        let mut worklist: Vec<*const ObjectCell> = Vec::new();
        for value in roots {
            if let Some(obj) = value.as_object() {
                gray(obj, &mut worklist);
            }
        }
        if let Some(handler) = &handler {
            handler.trace_roots(&mut |obj| gray(obj, &mut worklist));
        }
        drain_worklist(&mut worklist);

        // Phase 3: post-mortem pass over unreachable armed objects
        if let Some(handler) = &handler {
            {
                let cells = self.cells().borrow();
                for cell in cells.iter() {
                    let header = cell.header();
                    if header.mark() != MarkColor::White || !header.post_mortem_armed() {
                        continue;
                    }
                    match handler.on_reclaim(ObjRef::from_cell(cell.as_ref())) {
                        PostMortem::Release => header.disarm_post_mortem(),
                        PostMortem::Retain { rearm } => {
                            if !rearm {
                                header.disarm_post_mortem();
                            }
                            header.set_mark(MarkColor::Gray);
                            worklist.push(&**cell as *const ObjectCell);
                        }
                    }
                }
            }
            // Resurrect the retained objects' subgraphs: a to-be-finalized
            // object must be able to reach its children until extraction.
            drain_worklist(&mut worklist);
        }

        // Phase 4: sweep everything still white
        let dead = {
            let mut cells = self.cells().borrow_mut();
            let taken = std::mem::take(&mut *cells);
            let (live, dead): (Vec<_>, Vec<_>) = taken
                .into_iter()
                .partition(|cell| cell.header().mark() != MarkColor::White);
            *cells = live;
            dead
        };
        let reclaimed = dead.len() * CELL_SIZE;
        // Cell drops run after the cells borrow is released
        drop(dead);

        self.sub_bytes(reclaimed);
        let _collection = self.note_collection(reclaimed);

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "moonlet::gc",
            collection = _collection,
            reclaimed_bytes = reclaimed,
            live_bytes = self.total_bytes(),
            live_objects = self.object_count(),
            "GC cycle complete"
        );

        reclaimed
    }
}

/// Gray an object and queue it for scanning, if it is still white.
fn gray(obj: ObjRef, worklist: &mut Vec<*const ObjectCell>) {
    // SAFETY: roots and traced slots only ever reference live cells; nothing
    // has been freed this cycle.
    let cell = unsafe { &*obj.as_ptr() };
    if cell.header().mark() == MarkColor::White {
        cell.header().set_mark(MarkColor::Gray);
        worklist.push(obj.as_ptr());
    }
}

/// Scan queued gray objects until the worklist is empty.
fn drain_worklist(worklist: &mut Vec<*const ObjectCell>) {
    while let Some(ptr) = worklist.pop() {
        // SAFETY: worklist entries come from `gray`, which only accepts live
        // cells; the sweep has not run yet.
        let cell = unsafe { &*ptr };
        for child in cell.slots().borrow().iter() {
            if let Some(obj) = child.as_object() {
                gray(obj, worklist);
            }
        }
        cell.header().set_mark(MarkColor::Black);
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::Heap;

    #[test]
    fn test_collect_empty_heap() {
        let heap = Heap::new();
        assert_eq!(heap.collect(&[]), 0);
        assert_eq!(heap.stats().collection_count, 1);
    }

    #[test]
    fn test_collect_updates_stats() {
        let heap = Heap::new();
        let _garbage = heap.alloc_table();
        let reclaimed = heap.collect(&[]);
        assert!(reclaimed > 0);
        assert_eq!(heap.stats().last_reclaimed, reclaimed);
        assert_eq!(heap.object_count(), 0);
    }
}
