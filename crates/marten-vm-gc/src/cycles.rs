//! Cycle collection: DecRef → Scan → Free
//!
//! Refcounting frees acyclic garbage eagerly; this pass finds strongly
//! connected garbage the counts cannot see. The algorithm runs over the
//! live list only; the zero-ref list is drained before and after.
//!
//! 1. **DecRef**: every live allocation traces its children, decrementing
//!    each child's transient `mark`. Afterwards `ref_count + mark` is the
//!    number of references from outside the heap graph.
//! 2. **Scan**: allocations with a nonzero external count are roots; the
//!    pass re-increments marks along the way and flags everything
//!    transitively reachable from a root.
//! 3. **Free**: the rest is cyclic garbage. Weak references into the doomed
//!    set are cleared first, then finalizers run, then values are dropped,
//!    and only after every member's value is down does the memory go.

use std::time::{Duration, Instant};

use crate::handle::GcAny;
use crate::header::flags;
use crate::heap::{DEFAULT_GC_THRESHOLD, GcHeap, GcPhase};

/// Result of one cycle-collection pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Live allocations before the pass
    pub live_before: usize,
    /// Live allocations after the pass
    pub live_after: usize,
    /// Cycle members freed
    pub freed_objects: usize,
    /// Bytes released by freeing cycle members
    pub freed_bytes: usize,
    /// Wall-clock duration of the pass
    pub duration: Duration,
}

impl GcHeap {
    /// Run a full cycle collection if no phase is active and collection is
    /// not deferred. Returns zeroed stats when the pass was refused.
    pub fn collect_cycles(&self) -> GcStats {
        let st = &self.state;
        if st.phase.get() != GcPhase::Idle || st.no_gc.get() > 0 {
            return GcStats::default();
        }
        let start = Instant::now();
        st.drain_zero_refs();
        let live_before = st.live_count.get();

        // Phase 1: compute internal reference counts.
        st.phase.set(GcPhase::DecRef);
        let live = st.live_vec();
        for any in &live {
            let h = any.header();
            h.set_mark(0);
            h.clear_flag(flags::SCANNED);
            h.clear_flag(flags::DIRTY);
        }
        for any in &live {
            any.trace_children(&mut |child| child.header().mark_dec());
        }

        // Phase 2: flag everything reachable from an external reference.
        st.phase.set(GcPhase::RemoveCycles);
        let mut worklist: Vec<GcAny> = live
            .iter()
            .copied()
            .filter(|any| {
                let h = any.header();
                h.ref_count() as i64 + h.mark() as i64 > 0
            })
            .collect();
        while let Some(any) = worklist.pop() {
            let h = any.header();
            if h.has_flag(flags::SCANNED) {
                continue;
            }
            h.set_flag(flags::SCANNED);
            any.trace_children(&mut |child| {
                child.header().mark_inc();
                if !child.header().has_flag(flags::SCANNED) {
                    worklist.push(child);
                }
            });
        }

        // Phase 3: free the unreachable remainder.
        let doomed: Vec<GcAny> = live
            .iter()
            .copied()
            .filter(|any| !any.header().has_flag(flags::SCANNED))
            .collect();
        let freed_objects = doomed.len();
        let mut freed_bytes = 0usize;
        if !doomed.is_empty() {
            let sweeper = st.sweeper.borrow().clone();
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
            let mut layouts = Vec::with_capacity(doomed.len());
            for any in &doomed {
                st.unlink(&st.live, *any);
                st.live_count.set(st.live_count.get() - 1);
                // SAFETY: unlinked but still allocated; the value is intact.
                let value_ref = unsafe { &*any.ptr.as_ptr() };
                freed_bytes += std::mem::size_of_val(value_ref);
                layouts.push(std::alloc::Layout::for_value(value_ref));
            }
            for any in &doomed {
                // SAFETY: doomed allocations are unreachable as a set;
                // peer headers stay allocated until the dealloc loop.
                unsafe { std::ptr::drop_in_place(any.ptr.as_ptr()) };
            }
            for (any, layout) in doomed.iter().zip(layouts) {
                // SAFETY: value dropped above; layout captured while live.
                unsafe { std::alloc::dealloc(any.ptr.as_ptr() as *mut u8, layout) };
            }
            st.total_bytes.set(st.total_bytes.get() - freed_bytes);
        }

        st.phase.set(GcPhase::Idle);
        // References dropped by doomed values may have orphaned acyclic
        // allocations in the meantime.
        st.drain_zero_refs();

        let total = st.total_bytes.get();
        st.gc_threshold
            .set(DEFAULT_GC_THRESHOLD.max(total + total / 2));

        let stats = GcStats {
            live_before,
            live_after: st.live_count.get(),
            freed_objects,
            freed_bytes,
            duration: start.elapsed(),
        };
        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            freed = stats.freed_objects,
            bytes = stats.freed_bytes,
            live = stats.live_after,
            "cycle collection"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::handle::{GcAny, GcRef};
    use crate::header::GcKind;
    use crate::heap::{GcHeap, Sweeper};
    use crate::trace::Trace;

    struct Node {
        children: RefCell<Vec<GcRef<Node>>>,
    }

    impl Node {
        fn new() -> Self {
            Self {
                children: RefCell::new(Vec::new()),
            }
        }
    }

    impl Trace for Node {
        fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
            for child in self.children.borrow().iter() {
                mark(child.as_any());
            }
        }
    }

    #[test]
    fn test_refcount_free() {
        let heap = GcHeap::new();
        let a = heap.alloc(GcKind::Object, Node::new());
        assert_eq!(heap.live_count(), 1);
        assert_eq!(a.ref_count(), 1);
        let b = a.clone();
        assert_eq!(b.ref_count(), 2);
        drop(a);
        assert_eq!(heap.live_count(), 1);
        drop(b);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.total_bytes(), 0);
    }

    #[test]
    fn test_acyclic_cascade() {
        let heap = GcHeap::new();
        let leaf = heap.alloc(GcKind::Object, Node::new());
        let root = heap.alloc(GcKind::Object, Node::new());
        root.children.borrow_mut().push(leaf.clone());
        drop(leaf);
        assert_eq!(heap.live_count(), 2);
        drop(root);
        // Dropping the root cascades into the leaf without a collection.
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_cycle_collected() {
        let heap = GcHeap::new();
        let a = heap.alloc(GcKind::Object, Node::new());
        let b = heap.alloc(GcKind::Object, Node::new());
        a.children.borrow_mut().push(b.clone());
        b.children.borrow_mut().push(a.clone());
        drop(a);
        drop(b);
        // Refcounting alone cannot see the cycle.
        assert_eq!(heap.live_count(), 2);
        let stats = heap.collect_cycles();
        assert_eq!(stats.freed_objects, 2);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.total_bytes(), 0);
    }

    #[test]
    fn test_self_cycle_collected() {
        let heap = GcHeap::new();
        let a = heap.alloc(GcKind::Object, Node::new());
        a.children.borrow_mut().push(a.clone());
        drop(a);
        assert_eq!(heap.live_count(), 1);
        let stats = heap.collect_cycles();
        assert_eq!(stats.freed_objects, 1);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_externally_referenced_cycle_survives() {
        let heap = GcHeap::new();
        let a = heap.alloc(GcKind::Object, Node::new());
        let b = heap.alloc(GcKind::Object, Node::new());
        a.children.borrow_mut().push(b.clone());
        b.children.borrow_mut().push(a.clone());
        drop(b);
        let stats = heap.collect_cycles();
        assert_eq!(stats.freed_objects, 0);
        assert_eq!(heap.live_count(), 2);
        // Releasing the last external reference makes the cycle garbage.
        drop(a);
        let stats = heap.collect_cycles();
        assert_eq!(stats.freed_objects, 2);
        assert_eq!(heap.live_count(), 0);
    }

    struct RecordingSweeper {
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Sweeper for RecordingSweeper {
        fn clear_weak(&self, _obj: GcAny) {
            self.log.borrow_mut().push("clear_weak");
        }

        fn finalize(&self, _obj: GcAny) {
            self.log.borrow_mut().push("finalize");
        }
    }

    #[test]
    fn test_sweeper_order() {
        let heap = GcHeap::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        heap.set_sweeper(Rc::new(RecordingSweeper { log: log.clone() }));
        let a = heap.alloc(GcKind::Object, Node::new());
        let b = heap.alloc(GcKind::Object, Node::new());
        a.children.borrow_mut().push(b.clone());
        b.children.borrow_mut().push(a.clone());
        drop(a);
        drop(b);
        heap.collect_cycles();
        // Weak clearing for the whole batch precedes any finalizer.
        assert_eq!(
            &*log.borrow(),
            &["clear_weak", "clear_weak", "finalize", "finalize"]
        );
    }

    #[test]
    fn test_defer_gc_blocks_collection() {
        let heap = GcHeap::new();
        let a = heap.alloc(GcKind::Object, Node::new());
        a.children.borrow_mut().push(a.clone());
        drop(a);
        {
            let _guard = heap.defer_gc();
            let stats = heap.collect_cycles();
            assert_eq!(stats.freed_objects, 0);
            assert_eq!(heap.live_count(), 1);
        }
        let stats = heap.collect_cycles();
        assert_eq!(stats.freed_objects, 1);
    }

    #[test]
    fn test_threshold_grows_after_collection() {
        let heap = GcHeap::new();
        let initial = heap.gc_threshold();
        heap.collect_cycles();
        assert!(heap.gc_threshold() >= initial);
    }

    #[test]
    fn test_upgrade_and_downcast() {
        let heap = GcHeap::new();
        let a = heap.alloc(GcKind::Object, Node::new());
        let any = a.as_any();
        assert!(any.downcast_ref::<Node>().is_some());
        let strong = any.upgrade::<Node>().unwrap();
        assert_eq!(strong.ref_count(), 2);
        assert!(GcRef::ptr_eq(&a, &strong));
    }
}
