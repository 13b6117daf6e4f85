//! Weak reference slots
//!
//! A `WeakSlot` is a non-owning pointer at a target object, recorded on
//! the target's weak-reference chain. The sweeper clears every slot of a
//! dying object *before* finalizers run (both in the zero-ref drain and
//! in the cycle collector's free pass), so an un-cleared slot always
//! points at a live object.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use marten_vm_gc::{GcAny, GcRef};

use crate::map_set::MapState;
use crate::object::JsObject;

/// What owns the weak slot.
pub enum WeakKind {
    /// A `WeakRef` object
    WeakRef,
    /// A WeakMap/WeakSet entry keyed by the target
    MapEntry {
        /// The owning table
        map: Weak<MapState>,
        /// Identity key of the target inside the table
        key_addr: usize,
    },
    /// An ArrayBuffer's view-list entry
    BufferView,
}

/// One weak pointer.
pub struct WeakSlot {
    target: Cell<Option<GcAny>>,
    /// Owner discriminator
    pub kind: WeakKind,
}

impl WeakSlot {
    /// Create a slot and register it on the target's chain.
    pub fn register(target: &GcRef<JsObject>, kind: WeakKind) -> Rc<WeakSlot> {
        let slot = Rc::new(WeakSlot {
            target: Cell::new(Some(target.as_any())),
            kind,
        });
        target.add_weak_slot(slot.clone());
        slot
    }

    /// The target, if not yet cleared.
    pub fn target(&self) -> Option<GcAny> {
        self.target.get()
    }

    /// Strong handle to the target, if alive.
    pub fn upgrade(&self) -> Option<GcRef<JsObject>> {
        self.target.get().and_then(|any| any.upgrade::<JsObject>())
    }

    /// Drop the pointer (explicit deletes).
    pub fn clear(&self) {
        self.target.set(None);
    }

    /// Sweeper path: clear the pointer and evict the dependent state the
    /// slot guards (WeakMap/WeakSet entries).
    pub fn clear_for_dead_target(slot: &Rc<WeakSlot>) {
        let Some(target) = slot.target.take() else {
            return;
        };
        if let WeakKind::MapEntry { map, key_addr } = &slot.kind
            && let Some(map) = map.upgrade()
        {
            map.remove_weak_key(*key_addr);
        }
        let _ = target;
    }
}
