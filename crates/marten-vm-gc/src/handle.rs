//! Strong and erased handles to heap allocations

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::header::{GcHeader, GcKind, flags};
use crate::heap;
use crate::trace::{GcValue, Trace};

/// A header followed immediately by the traced value.
///
/// `repr(C)` so the header can be reached from an erased pointer without
/// knowing the value type.
#[repr(C)]
pub struct GcBox<T: ?Sized> {
    pub(crate) header: GcHeader,
    pub(crate) value: T,
}

/// Owning, reference-counted handle to a GC allocation.
///
/// Cloning bumps the refcount; dropping the last handle moves the
/// allocation to the zero-ref list and (outside a collection) frees it.
/// Handles are `!Send`: a runtime's heap belongs to one thread.
pub struct GcRef<T: Trace> {
    ptr: NonNull<GcBox<T>>,
    _not_send: PhantomData<*const ()>,
}

impl<T: Trace> GcRef<T> {
    pub(crate) fn from_raw(ptr: NonNull<GcBox<T>>) -> Self {
        Self {
            ptr,
            _not_send: PhantomData,
        }
    }

    /// The allocation header.
    #[inline]
    pub fn header(&self) -> &GcHeader {
        // SAFETY: the box is alive as long as a strong handle exists.
        unsafe { &self.ptr.as_ref().header }
    }

    /// Erased view of this handle (non-owning).
    #[inline]
    pub fn as_any(&self) -> GcAny {
        // SAFETY: strong handle keeps the box alive for the reference's scope.
        let b: &GcBox<dyn GcValue> = unsafe { self.ptr.as_ref() };
        GcAny {
            ptr: NonNull::from(b),
        }
    }

    /// Identity of the allocation, usable as a map key.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Pointer identity comparison.
    #[inline]
    pub fn ptr_eq(a: &GcRef<T>, b: &GcRef<T>) -> bool {
        a.ptr == b.ptr
    }

    /// Current reference count (diagnostics and shape-sharing checks).
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.header().ref_count()
    }
}

impl<T: Trace> Deref for GcRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the box is alive as long as a strong handle exists.
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T: Trace> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        self.header().inc_ref();
        Self {
            ptr: self.ptr,
            _not_send: PhantomData,
        }
    }
}

impl<T: Trace> Drop for GcRef<T> {
    fn drop(&mut self) {
        heap::release(self.as_any());
    }
}

impl<T: Trace + std::fmt::Debug> std::fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({:?})", &**self)
    }
}

/// Non-owning, type-erased pointer to a GC allocation.
///
/// `GcAny` does not keep its target alive; it is only handed out where the
/// heap guarantees liveness (trace callbacks, sweep callbacks, weak slots
/// that the sweeper clears before the target dies).
#[derive(Clone, Copy)]
pub struct GcAny {
    pub(crate) ptr: NonNull<GcBox<dyn GcValue>>,
}

impl GcAny {
    /// The allocation header.
    #[inline]
    pub fn header(&self) -> &GcHeader {
        // SAFETY: callers only hold GcAny while the target is alive.
        unsafe { &self.ptr.as_ref().header }
    }

    /// Allocation kind.
    #[inline]
    pub fn kind(&self) -> GcKind {
        self.header().kind()
    }

    /// Identity of the allocation, usable as a map key.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as *const u8 as usize
    }

    /// Borrow the value if it is a `T`.
    #[inline]
    pub fn downcast_ref<T: Trace>(&self) -> Option<&T> {
        // SAFETY: callers only hold GcAny while the target is alive.
        let value = unsafe { &self.ptr.as_ref().value };
        value.as_any().downcast_ref::<T>()
    }

    /// Promote to a strong handle if the value is a `T`.
    ///
    /// Used by weak slots: the sweeper clears slots before their target is
    /// finalized, so an un-cleared slot always points at a live allocation.
    pub fn upgrade<T: Trace>(&self) -> Option<GcRef<T>> {
        if self.downcast_ref::<T>().is_none() {
            return None;
        }
        if self.header().has_flag(flags::DOOMED) || self.header().ref_count() == 0 {
            return None;
        }
        self.header().inc_ref();
        Some(GcRef::from_raw(self.ptr.cast::<GcBox<T>>()))
    }

    pub(crate) fn trace_children(&self, mark: &mut dyn FnMut(GcAny)) {
        // SAFETY: only invoked by the heap on listed (live) allocations.
        let value = unsafe { &self.ptr.as_ref().value };
        value.trace_value(mark);
    }
}

impl PartialEq for GcAny {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for GcAny {}

impl std::hash::Hash for GcAny {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl std::fmt::Debug for GcAny {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcAny({:?}@{:#x})", self.kind(), self.addr())
    }
}
