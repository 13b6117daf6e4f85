//! Allocation registry: live/zero-ref list partition and eager freeing
//!
//! Every allocation lives on exactly one of two intrusive doubly-linked
//! lists: the live list (refcount ≥ 1) or the zero-ref list (pending
//! free). `GcRef` drops move allocations between them; the heap drains the
//! zero-ref list eagerly whenever no collection phase is running.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::handle::{GcAny, GcBox, GcRef};
use crate::header::{GcHeader, GcKind, flags};
use crate::trace::Trace;

/// Initial cycle-collection threshold (bytes of live allocation).
pub const DEFAULT_GC_THRESHOLD: usize = 256 * 1024;

/// Collection phase gate. Refcount zero events behave differently while a
/// collection is running, and nested collections are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Normal mutation
    Idle,
    /// Computing internal reference counts
    DecRef,
    /// Scanning roots and freeing unreachable cycles
    RemoveCycles,
}

/// Callbacks the runtime installs so the heap can run class-level cleanup
/// while freeing.
///
/// A sweeper must not own `GcRef`s or the heap itself, directly or through
/// captured state; it is kept alive by the heap and would otherwise pin
/// the world.
pub trait Sweeper {
    /// Clear weak references targeting `obj`. Runs before any finalizer of
    /// the same free batch.
    fn clear_weak(&self, obj: GcAny);

    /// Run the class finalizer for `obj`. Must not resurrect it.
    fn finalize(&self, obj: GcAny);
}

pub(crate) struct ListHead {
    pub(crate) first: Cell<Option<GcAny>>,
}

impl ListHead {
    const fn new() -> Self {
        Self {
            first: Cell::new(None),
        }
    }
}

pub(crate) struct HeapState {
    pub(crate) live: ListHead,
    pub(crate) zero: ListHead,
    pub(crate) live_count: Cell<usize>,
    pub(crate) total_bytes: Cell<usize>,
    pub(crate) gc_threshold: Cell<usize>,
    pub(crate) memory_limit: Cell<usize>,
    pub(crate) phase: Cell<GcPhase>,
    pub(crate) draining: Cell<bool>,
    pub(crate) no_gc: Cell<u32>,
    pub(crate) sweeper: RefCell<Option<Rc<dyn Sweeper>>>,
}

impl HeapState {
    pub(crate) fn link_front(&self, list: &ListHead, any: GcAny) {
        let h = any.header();
        h.prev.set(None);
        h.next.set(list.first.get());
        if let Some(next) = list.first.get() {
            next.header().prev.set(Some(any));
        }
        list.first.set(Some(any));
    }

    pub(crate) fn unlink(&self, list: &ListHead, any: GcAny) {
        let h = any.header();
        match h.prev.get() {
            Some(prev) => prev.header().next.set(h.next.get()),
            None => list.first.set(h.next.get()),
        }
        if let Some(next) = h.next.get() {
            next.header().prev.set(h.prev.get());
        }
        h.prev.set(None);
        h.next.set(None);
    }

    /// Move an allocation whose refcount just reached zero onto the
    /// pending-free list.
    pub(crate) fn suspend(&self, any: GcAny) {
        debug_assert!(!any.header().has_flag(flags::IN_ZERO_LIST));
        self.unlink(&self.live, any);
        self.live_count.set(self.live_count.get() - 1);
        any.header().set_flag(flags::IN_ZERO_LIST);
        self.link_front(&self.zero, any);
    }

    /// Free everything on the zero-ref list, cascading.
    pub(crate) fn drain_zero_refs(&self) {
        if self.draining.get() {
            return;
        }
        self.draining.set(true);
        let sweeper = self.sweeper.borrow().clone();
        while let Some(any) = self.zero.first.get() {
            debug_assert_eq!(any.header().ref_count(), 0);
            self.unlink(&self.zero, any);
            any.header().clear_flag(flags::IN_ZERO_LIST);
            if let Some(s) = &sweeper {
                s.clear_weak(any);
                s.finalize(any);
            }
            // SAFETY: refcount is zero and the allocation left both lists;
            // nothing can reach it again. Dropping the box releases child
            // references, which may push more entries onto the zero list
            // for the next loop iteration.
            unsafe { self.free_box(any) };
        }
        self.draining.set(false);
    }

    /// Drop and deallocate one unlisted allocation.
    ///
    /// # Safety
    /// `any` must be unlinked from both lists and unreachable.
    pub(crate) unsafe fn free_box(&self, any: GcAny) {
        let ptr = any.ptr.as_ptr();
        // SAFETY: per contract the box is still allocated here.
        let size = std::mem::size_of_val(unsafe { &*ptr });
        self.total_bytes.set(self.total_bytes.get() - size);
        // SAFETY: ownership transfers back to the box for the final drop.
        drop(unsafe { Box::from_raw(ptr) });
    }

    pub(crate) fn live_vec(&self) -> Vec<GcAny> {
        let mut out = Vec::with_capacity(self.live_count.get());
        let mut cur = self.live.first.get();
        while let Some(any) = cur {
            out.push(any);
            cur = any.header().next.get();
        }
        out
    }
}

/// Decrement the refcount behind a dropped `GcRef`.
pub(crate) fn release(any: GcAny) {
    let h = any.header();
    if h.has_flag(flags::DOOMED) {
        // The cycle sweeper owns this allocation; it frees the memory
        // after every cycle member has been torn down.
        h.dec_ref();
        return;
    }
    if h.dec_ref() == 0 {
        // SAFETY: the heap outlives its allocations (the runtime drops all
        // value-holding state before the heap itself).
        let heap = unsafe { &*h.heap.get() };
        heap.suspend(any);
        if heap.phase.get() == GcPhase::Idle {
            heap.drain_zero_refs();
        }
    }
}

/// Keeps cycle collection from starting while alive (finalizers,
/// shape-hash mutation).
pub struct NoGcGuard<'a> {
    state: &'a HeapState,
}

impl Drop for NoGcGuard<'_> {
    fn drop(&mut self) {
        self.state.no_gc.set(self.state.no_gc.get() - 1);
    }
}

/// The per-runtime allocation registry.
///
/// Owns every `GcBox` it hands out. Dropping the heap force-frees whatever
/// is left, so it must be the last runtime field to go.
pub struct GcHeap {
    pub(crate) state: Box<HeapState>,
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHeap {
    /// Create an empty heap with the default collection threshold.
    pub fn new() -> Self {
        Self {
            state: Box::new(HeapState {
                live: ListHead::new(),
                zero: ListHead::new(),
                live_count: Cell::new(0),
                total_bytes: Cell::new(0),
                gc_threshold: Cell::new(DEFAULT_GC_THRESHOLD),
                memory_limit: Cell::new(usize::MAX),
                phase: Cell::new(GcPhase::Idle),
                draining: Cell::new(false),
                no_gc: Cell::new(0),
                sweeper: RefCell::new(None),
            }),
        }
    }

    /// Install the runtime's sweep callbacks.
    pub fn set_sweeper(&self, sweeper: Rc<dyn Sweeper>) {
        *self.state.sweeper.borrow_mut() = Some(sweeper);
    }

    /// Allocate a traced value at refcount 1 on the live list.
    pub fn alloc<T: Trace>(&self, kind: GcKind, value: T) -> GcRef<T> {
        let boxed = Box::new(GcBox {
            header: GcHeader::new(kind),
            value,
        });
        let size = std::mem::size_of::<GcBox<T>>();
        let ptr = NonNull::from(Box::leak(boxed));
        // SAFETY: freshly leaked box; unique pointer.
        unsafe {
            ptr.as_ref()
                .header
                .heap
                .set(&*self.state as *const HeapState);
        }
        let gc_ref = GcRef::from_raw(ptr);
        self.state.link_front(&self.state.live, gc_ref.as_any());
        self.state.live_count.set(self.state.live_count.get() + 1);
        self.state.total_bytes.set(self.state.total_bytes.get() + size);
        gc_ref
    }

    /// True once live allocation crosses the collection threshold.
    pub fn needs_gc(&self) -> bool {
        self.state.phase.get() == GcPhase::Idle
            && self.state.no_gc.get() == 0
            && self.state.total_bytes.get() > self.state.gc_threshold.get()
    }

    /// True if allocating `extra` more bytes would cross the memory limit.
    pub fn would_exceed_limit(&self, extra: usize) -> bool {
        let limit = self.state.memory_limit.get();
        limit != usize::MAX && self.state.total_bytes.get().saturating_add(extra) > limit
    }

    /// Set the hard memory limit in bytes (`usize::MAX` disables it).
    pub fn set_memory_limit(&self, bytes: usize) {
        self.state.memory_limit.set(bytes);
    }

    /// Set the cycle-collection trigger threshold in bytes.
    pub fn set_gc_threshold(&self, bytes: usize) {
        self.state.gc_threshold.set(bytes);
    }

    /// Current collection threshold.
    pub fn gc_threshold(&self) -> usize {
        self.state.gc_threshold.get()
    }

    /// Number of allocations on the live list.
    pub fn live_count(&self) -> usize {
        self.state.live_count.get()
    }

    /// Bytes currently allocated across both lists.
    pub fn total_bytes(&self) -> usize {
        self.state.total_bytes.get()
    }

    /// Current collection phase.
    pub fn phase(&self) -> GcPhase {
        self.state.phase.get()
    }

    /// Free anything already at refcount zero.
    pub fn drain_zero_refs(&self) {
        if self.state.phase.get() == GcPhase::Idle {
            self.state.drain_zero_refs();
        }
    }

    /// Block cycle collection while the returned guard is alive.
    pub fn defer_gc(&self) -> NoGcGuard<'_> {
        self.state.no_gc.set(self.state.no_gc.get() + 1);
        NoGcGuard { state: &self.state }
    }

    /// Force-free every remaining allocation, ignoring refcounts.
    ///
    /// Teardown only: any `GcRef` still held outside the heap afterwards is
    /// a contract violation by the embedder.
    pub fn free_all(&self) {
        let sweeper = self.state.sweeper.borrow().clone();
        let mut doomed = self.state.live_vec();
        let mut cur = self.state.zero.first.get();
        while let Some(any) = cur {
            doomed.push(any);
            cur = any.header().next.get();
        }
        for any in &doomed {
            any.header().set_flag(flags::DOOMED);
        }
        if let Some(s) = &sweeper {
            for any in &doomed {
                s.clear_weak(*any);
            }
            for any in &doomed {
                s.finalize(*any);
            }
        }
        for any in &doomed {
            let h = any.header();
            if h.has_flag(flags::IN_ZERO_LIST) {
                self.state.unlink(&self.state.zero, *any);
                h.clear_flag(flags::IN_ZERO_LIST);
            } else {
                self.state.unlink(&self.state.live, *any);
                self.state.live_count.set(self.state.live_count.get() - 1);
            }
        }
        // Two passes: values first so cross-references between doomed
        // allocations resolve against still-allocated headers, then the
        // memory itself. Layouts are captured while the values are intact.
        let layouts: Vec<std::alloc::Layout> = doomed
            .iter()
            // SAFETY: boxes are unlinked but still allocated.
            .map(|any| std::alloc::Layout::for_value(unsafe { &*any.ptr.as_ptr() }))
            .collect();
        for any in &doomed {
            // SAFETY: unlinked above; header stays allocated until the
            // second pass.
            unsafe { std::ptr::drop_in_place(any.ptr.as_ptr()) };
        }
        for (any, layout) in doomed.iter().zip(layouts) {
            // SAFETY: value already dropped; the layout was captured from
            // the live value above.
            unsafe { std::alloc::dealloc(any.ptr.as_ptr() as *mut u8, layout) };
        }
        self.state.total_bytes.set(0);
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        self.drain_zero_refs();
        self.collect_cycles();
        self.free_all();
        *self.state.sweeper.borrow_mut() = None;
    }
}
