//! # Marten VM GC
//!
//! Reference-counted heap with a cycle collector for the Marten
//! JavaScript engine.
//!
//! ## Design
//!
//! - **Eager refcounting**: `GcRef` clones and drops mirror every pointer
//!   bump; acyclic garbage dies the moment its last reference does.
//! - **List partition**: every allocation is on exactly one of the live
//!   list (refcount ≥ 1) or the zero-ref list (pending free).
//! - **Cycle collection**: a threshold-triggered DecRef/Scan/Free pass
//!   frees strongly connected garbage invisible to the counts.
//! - **Phase gate**: collection never starts inside a finalizer or while a
//!   caller holds a [`NoGcGuard`].
//!
//! The heap is thread-confined: handles are `!Send`, and a runtime owns
//! exactly one heap.

#![warn(clippy::all)]
#![warn(missing_docs)]
// Unsafe is confined to box allocation/teardown and the intrusive lists.
// All unsafe code must have SAFETY comments.

mod cycles;
mod handle;
mod header;
mod heap;
mod trace;

pub use cycles::GcStats;
pub use handle::{GcAny, GcRef};
pub use header::{GcHeader, GcKind};
pub use heap::{DEFAULT_GC_THRESHOLD, GcHeap, GcPhase, NoGcGuard, Sweeper};
pub use trace::{GcValue, Trace};
