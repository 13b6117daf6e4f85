//! ArrayBuffer and SharedArrayBuffer backing storage
//!
//! A plain buffer owns its bytes and can be detached: the payload is
//! dropped, the flag set, and every registered view has its element count
//! zeroed. Shared buffers hand out a refcounted payload and are never
//! observed detached. The view list is weak: views keep the buffer
//! alive, never the other way around.

use std::cell::RefCell;
use std::rc::Rc;

use marten_vm_gc::GcRef;

use crate::context::Context;
use crate::error::JsResult;
use crate::object::{JsObject, ObjectData, class_ids};
use crate::value::Value;
use crate::weak::{WeakKind, WeakSlot};

/// Byte storage of a buffer object.
pub enum BufferStorage {
    /// Owned bytes; `None` once detached
    Plain(RefCell<Option<Vec<u8>>>),
    /// Shared refcounted bytes; never detached
    Shared(Rc<RefCell<Vec<u8>>>),
}

/// ArrayBuffer payload.
pub struct ArrayBufferData {
    storage: BufferStorage,
    /// Weak list of typed-array views over this buffer
    views: RefCell<Vec<Rc<WeakSlot>>>,
}

impl ArrayBufferData {
    /// Owned zeroed storage.
    pub fn new_plain(byte_length: usize) -> ArrayBufferData {
        ArrayBufferData {
            storage: BufferStorage::Plain(RefCell::new(Some(vec![0; byte_length]))),
            views: RefCell::new(Vec::new()),
        }
    }

    /// Owned storage copied from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> ArrayBufferData {
        ArrayBufferData {
            storage: BufferStorage::Plain(RefCell::new(Some(bytes.to_vec()))),
            views: RefCell::new(Vec::new()),
        }
    }

    /// Shared storage.
    pub fn new_shared(byte_length: usize) -> ArrayBufferData {
        ArrayBufferData {
            storage: BufferStorage::Shared(Rc::new(RefCell::new(vec![0; byte_length]))),
            views: RefCell::new(Vec::new()),
        }
    }

    /// Shared storage handle (SAB serialization passes these around).
    pub fn shared_payload(&self) -> Option<Rc<RefCell<Vec<u8>>>> {
        match &self.storage {
            BufferStorage::Shared(rc) => Some(rc.clone()),
            BufferStorage::Plain(_) => None,
        }
    }

    /// Wrap an existing shared payload.
    pub fn from_shared(payload: Rc<RefCell<Vec<u8>>>) -> ArrayBufferData {
        ArrayBufferData {
            storage: BufferStorage::Shared(payload),
            views: RefCell::new(Vec::new()),
        }
    }

    /// True once detached.
    pub fn is_detached(&self) -> bool {
        match &self.storage {
            BufferStorage::Plain(data) => data.borrow().is_none(),
            BufferStorage::Shared(_) => false,
        }
    }

    /// Byte length (0 when detached).
    pub fn byte_length(&self) -> usize {
        match &self.storage {
            BufferStorage::Plain(data) => data.borrow().as_ref().map(Vec::len).unwrap_or(0),
            BufferStorage::Shared(data) => data.borrow().len(),
        }
    }

    /// Read access to the bytes; `None` when detached.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        match &self.storage {
            BufferStorage::Plain(data) => data.borrow().as_deref().map(f),
            BufferStorage::Shared(data) => Some(f(&data.borrow())),
        }
    }

    /// Write access to the bytes; `None` when detached.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        match &self.storage {
            BufferStorage::Plain(data) => data.borrow_mut().as_deref_mut().map(f),
            BufferStorage::Shared(data) => Some(f(&mut data.borrow_mut())),
        }
    }

    pub(crate) fn register_view(&self, slot: Rc<WeakSlot>) {
        self.views.borrow_mut().push(slot);
    }

    fn take_views(&self) -> Vec<Rc<WeakSlot>> {
        std::mem::take(&mut *self.views.borrow_mut())
    }
}

impl Context {
    /// `new ArrayBuffer(byteLength)`.
    pub fn new_array_buffer(&self, byte_length: usize) -> GcRef<JsObject> {
        self.new_object_class(
            class_ids::ARRAY_BUFFER,
            ObjectData::ArrayBuffer(ArrayBufferData::new_plain(byte_length)),
        )
    }

    /// An ArrayBuffer initialized from `bytes`.
    pub fn new_array_buffer_from(&self, bytes: &[u8]) -> GcRef<JsObject> {
        self.new_object_class(
            class_ids::ARRAY_BUFFER,
            ObjectData::ArrayBuffer(ArrayBufferData::from_bytes(bytes)),
        )
    }

    /// `new SharedArrayBuffer(byteLength)`.
    pub fn new_shared_array_buffer(&self, byte_length: usize) -> GcRef<JsObject> {
        self.new_object_class(
            class_ids::SHARED_ARRAY_BUFFER,
            ObjectData::ArrayBuffer(ArrayBufferData::new_shared(byte_length)),
        )
    }

    /// A SharedArrayBuffer object over an existing payload.
    pub fn new_shared_array_buffer_from(
        &self,
        payload: Rc<RefCell<Vec<u8>>>,
    ) -> GcRef<JsObject> {
        self.new_object_class(
            class_ids::SHARED_ARRAY_BUFFER,
            ObjectData::ArrayBuffer(ArrayBufferData::from_shared(payload)),
        )
    }

    /// Run `f` over a buffer object's payload.
    pub fn with_array_buffer<R>(
        &self,
        obj: &GcRef<JsObject>,
        f: impl FnOnce(&ArrayBufferData) -> R,
    ) -> JsResult<R> {
        obj.with_data(|d| match d {
            ObjectData::ArrayBuffer(b) => Some(f(b)),
            _ => None,
        })
        .ok_or_else(|| self.throw_type_error("not an ArrayBuffer"))
    }

    /// Detach: drop the bytes and zero every live view. Shared buffers
    /// refuse.
    pub fn detach_array_buffer(&self, obj: &GcRef<JsObject>) -> JsResult<()> {
        let views = obj.with_data(|d| match d {
            ObjectData::ArrayBuffer(b) => match &b.storage {
                BufferStorage::Plain(data) => {
                    *data.borrow_mut() = None;
                    Some(b.take_views())
                }
                BufferStorage::Shared(_) => None,
            },
            _ => None,
        });
        let Some(views) = views else {
            return Err(self.throw_type_error("cannot detach this buffer"));
        };
        for slot in views {
            if let Some(view) = slot.upgrade() {
                view.with_data(|d| {
                    if let ObjectData::TypedArray(ta) = d {
                        ta.neuter();
                    }
                });
            }
            slot.clear();
        }
        Ok(())
    }

    pub(crate) fn register_buffer_view(
        &self,
        buffer: &GcRef<JsObject>,
        view: &GcRef<JsObject>,
    ) -> JsResult<()> {
        let slot = WeakSlot::register(view, WeakKind::BufferView);
        self.with_array_buffer(buffer, |b| b.register_view(slot))
    }
}
