//! GC heap management

use crate::object::tags;
use crate::value::{ObjRef, ObjectCell, Value};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes charged per heap cell.
pub(crate) const CELL_SIZE: usize = std::mem::size_of::<ObjectCell>();

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Allocation threshold that makes [`Heap::should_gc`] report true
    /// (default: 1MB)
    pub gc_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 1024 * 1024, // 1MB
        }
    }
}

/// Verdict returned by a post-mortem handler for an unreachable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostMortem {
    /// Free the object in this cycle.
    Release,
    /// Keep the object (and its subgraph) alive through this cycle.
    Retain {
        /// Whether the post-mortem callback stays armed for the next cycle.
        rearm: bool,
    },
}

/// Consumer of reclamation events, registered via [`Heap::set_post_mortem`].
///
/// The collector invokes `on_reclaim` for every unreachable object whose
/// header is armed, before the sweep frees anything. The handler may be
/// called from whichever thread drives the collection; it must do its own
/// locking and must not call back into the heap.
pub trait PostMortemHandler: Send + Sync {
    /// Decide the fate of an unreachable armed object.
    fn on_reclaim(&self, obj: ObjRef) -> PostMortem;

    /// Report extra strong roots (e.g. values parked awaiting finalization).
    fn trace_roots(&self, tracer: &mut dyn FnMut(ObjRef));
}

/// Heap statistics snapshot
#[derive(Debug, Default, Clone)]
pub struct HeapStats {
    /// Bytes currently allocated
    pub total_bytes: usize,
    /// Live heap cells
    pub object_count: usize,
    /// Number of collections performed
    pub collection_count: usize,
    /// Bytes reclaimed in the last collection
    pub last_reclaimed: usize,
}

/// The script heap: owns every cell, allocates, and collects.
///
/// Single mutator ownership — the heap lives on one thread at a time
/// (it is `Send` but not `Sync`). Stack-held [`Value`]s are not roots;
/// liveness is decided by the root set passed to
/// [`collect`](Heap::collect) plus the registered handler's roots.
pub struct Heap {
    /// Every live cell. Boxes keep cell addresses stable across Vec growth.
    cells: RefCell<Vec<Box<ObjectCell>>>,
    /// Total bytes allocated
    total_bytes: AtomicUsize,
    /// GC trigger threshold
    gc_threshold: AtomicUsize,
    /// Number of collections performed
    collection_count: AtomicUsize,
    /// Bytes reclaimed in last collection
    last_reclaimed: AtomicUsize,
    /// Reclamation-event consumer (the weak-ref pool, in practice)
    post_mortem: RefCell<Option<Arc<dyn PostMortemHandler>>>,
}

impl Heap {
    /// Create a new heap with default config
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create a new heap with custom config
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            cells: RefCell::new(Vec::new()),
            total_bytes: AtomicUsize::new(0),
            gc_threshold: AtomicUsize::new(config.gc_threshold),
            collection_count: AtomicUsize::new(0),
            last_reclaimed: AtomicUsize::new(0),
            post_mortem: RefCell::new(None),
        }
    }

    /// Register the consumer of reclamation events.
    ///
    /// At most one handler is active; registering replaces the previous one.
    pub fn set_post_mortem(&self, handler: Arc<dyn PostMortemHandler>) {
        *self.post_mortem.borrow_mut() = Some(handler);
    }

    pub(crate) fn post_mortem_handler(&self) -> Option<Arc<dyn PostMortemHandler>> {
        self.post_mortem.borrow().clone()
    }

    pub(crate) fn cells(&self) -> &RefCell<Vec<Box<ObjectCell>>> {
        &self.cells
    }

    /// Allocate a heap object with the given type tag.
    pub fn alloc(&self, tag: u8) -> Value {
        let cell = Box::new(ObjectCell::new(tag));
        let obj = ObjRef::from_cell(cell.as_ref());
        self.cells.borrow_mut().push(cell);
        self.total_bytes.fetch_add(CELL_SIZE, Ordering::Relaxed);
        Value::Object(obj)
    }

    /// Allocate a table.
    pub fn alloc_table(&self) -> Value {
        self.alloc(tags::TABLE)
    }

    /// Allocate a closure.
    pub fn alloc_closure(&self) -> Value {
        self.alloc(tags::CLOSURE)
    }

    /// Allocate a userdata.
    pub fn alloc_userdata(&self) -> Value {
        self.alloc(tags::USERDATA)
    }

    /// Get current allocated bytes
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn sub_bytes(&self, bytes: usize) {
        self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn note_collection(&self, reclaimed: usize) -> usize {
        self.last_reclaimed.store(reclaimed, Ordering::Relaxed);
        self.collection_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of live heap cells
    pub fn object_count(&self) -> usize {
        self.cells.borrow().len()
    }

    /// Get the GC trigger threshold
    pub fn gc_threshold(&self) -> usize {
        self.gc_threshold.load(Ordering::Relaxed)
    }

    /// Set the GC trigger threshold
    pub fn set_gc_threshold(&self, threshold: usize) {
        self.gc_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Check if a collection should be triggered
    pub fn should_gc(&self) -> bool {
        self.total_bytes() >= self.gc_threshold()
    }

    /// Get collection statistics
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_bytes: self.total_bytes(),
            object_count: self.object_count(),
            collection_count: self.collection_count.load(Ordering::Relaxed),
            last_reclaimed: self.last_reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}
