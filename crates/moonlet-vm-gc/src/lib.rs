//! # Moonlet VM Garbage Collector
//!
//! Tracing collector for the Moonlet script heap.
//!
//! ## Design
//!
//! - **Explicit roots**: liveness is decided by the root set passed to each
//!   [`Heap::collect`] call — stack-held [`Value`]s are not roots
//! - **Tri-color mark/sweep**: stop-the-world, cycle-safe
//! - **Post-mortem pass**: unreachable objects with an armed header are
//!   reported to a registered [`PostMortemHandler`] before the sweep, which
//!   may resurrect them (and their subgraph) for the cycle — this is the
//!   seam the weak-reference pool plugs into
//! - **Non-moving**: cells never change address, so their addresses are
//!   stable identity tokens

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod collector;
pub mod heap;
pub mod object;
pub mod value;

pub use heap::{GcConfig, Heap, HeapStats, PostMortem, PostMortemHandler};
pub use object::{GcHeader, MarkColor, tags};
pub use value::{ObjRef, Value};
