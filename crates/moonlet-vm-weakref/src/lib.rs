//! # Moonlet weak-reference & finalization pool
//!
//! The runtime-facing registry that lets script values be observed weakly
//! and finalized exactly once, in reverse marking order, by interlocking
//! with the host collector in `moonlet-vm-gc`.
//!
//! ## How the pieces fit
//!
//! - [`identity`] derives a stable, non-retaining token from an opaque
//!   value and stashes the handle that resolves it back while alive
//! - [`weak_ref`] is the tri-state handle (`Alive` / `Resurrected` /
//!   `Dead`) callers hold
//! - [`pool`] is the registry, the pending-finalization queues, and the
//!   marking-order counter behind one mutex
//! - [`safe_pool`] is the strong-retention fallback for platforms without
//!   a usable weak primitive
//!
//! ## Wiring
//!
//! ```
//! use moonlet_vm_gc::Heap;
//! use moonlet_vm_weakref::{MarkFlags, RefPool, WeakRefPool};
//! use std::sync::Arc;
//!
//! let heap = Heap::new();
//! let pool = Arc::new(WeakRefPool::new());
//! heap.set_post_mortem(pool.clone());
//!
//! let resource = heap.alloc_userdata();
//! pool.mark(&resource, MarkFlags::FINALIZE);
//! drop(resource);
//!
//! heap.collect(&[]);
//! assert_eq!(pool.extract_pending_finalize().len(), 1);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod identity;
pub mod pool;
pub mod safe_pool;
pub mod weak_ref;

pub use identity::{ValueId, value_id};
pub use pool::{MarkFlags, Prefinalizer, RefPool, WeakRefPool};
pub use safe_pool::SafeRefPool;
pub use weak_ref::{Status, WeakRef};
