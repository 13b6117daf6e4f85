//! Objects: class id, flags, shape-indexed property storage, class data
//!
//! The property-values array is always exactly as long as the shape's
//! entry list (deleted placeholders included). Property semantics
//! (lookup, definition, deletion, exotic dispatch) live in
//! `object_ops.rs`; this module is the storage model.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcRef, Trace};

use crate::array_buffer::ArrayBufferData;
use crate::context::Realm;
use crate::coroutine::GeneratorData;
use crate::frame::VarRef;
use crate::function::{BoundFunctionData, ClosureData, NativeFunctionData};
use crate::map_set::MapState;
use crate::module::ModuleRecord;
use crate::promise::PromiseData;
use crate::proxy::ProxyData;
use crate::shape::Shape;
use crate::typed_array::TypedArrayData;
use crate::value::Value;
use crate::weak::WeakSlot;

/// Class identifier; small integers, built-ins in a reserved low range.
pub type ClassId = u16;

/// Built-in class ids.
pub mod class_ids {
    use super::ClassId;

    pub const OBJECT: ClassId = 1;
    pub const ARRAY: ClassId = 2;
    pub const ERROR: ClassId = 3;
    pub const C_FUNCTION: ClassId = 4;
    pub const BYTECODE_FUNCTION: ClassId = 5;
    pub const BOUND_FUNCTION: ClassId = 6;
    pub const GENERATOR: ClassId = 7;
    pub const ASYNC_FUNCTION: ClassId = 8;
    pub const PROXY: ClassId = 9;
    pub const PROMISE: ClassId = 10;
    pub const ARRAY_BUFFER: ClassId = 11;
    pub const SHARED_ARRAY_BUFFER: ClassId = 12;
    pub const UINT8C_ARRAY: ClassId = 13;
    pub const INT8_ARRAY: ClassId = 14;
    pub const UINT8_ARRAY: ClassId = 15;
    pub const INT16_ARRAY: ClassId = 16;
    pub const UINT16_ARRAY: ClassId = 17;
    pub const INT32_ARRAY: ClassId = 18;
    pub const UINT32_ARRAY: ClassId = 19;
    pub const BIG_INT64_ARRAY: ClassId = 20;
    pub const BIG_UINT64_ARRAY: ClassId = 21;
    pub const FLOAT32_ARRAY: ClassId = 22;
    pub const FLOAT64_ARRAY: ClassId = 23;
    pub const MAP: ClassId = 24;
    pub const SET: ClassId = 25;
    pub const WEAK_MAP: ClassId = 26;
    pub const WEAK_SET: ClassId = 27;
    pub const WEAK_REF: ClassId = 28;
    pub const MODULE_NS: ClassId = 29;
    pub const FOR_IN_ITERATOR: ClassId = 30;
    pub const ARGUMENTS: ClassId = 31;
    pub const NUMBER: ClassId = 32;
    pub const STRING: ClassId = 33;
    pub const BOOLEAN: ClassId = 34;
    pub const SYMBOL: ClassId = 35;
    pub const DATE: ClassId = 36;

    /// First id handed out to embedder-registered classes.
    pub const FIRST_USER: ClassId = 64;

    /// True for the contiguous typed-array id range.
    pub fn is_typed_array(id: ClassId) -> bool {
        (UINT8C_ARRAY..=FLOAT64_ARRAY).contains(&id)
    }
}

/// Object flag bits.
pub mod obj_flags {
    /// New properties may be added.
    pub const EXTENSIBLE: u8 = 1 << 0;
    /// Dense element storage is active (Array fast path).
    pub const FAST_ARRAY: u8 = 1 << 1;
    /// The class has exotic fundamental operations.
    pub const EXOTIC: u8 = 1 << 2;
    /// The object can be used with `new`.
    pub const CONSTRUCTOR: u8 = 1 << 3;
    /// `document.all`-style undetectable object.
    pub const HTMLDDA: u8 = 1 << 4;
}

/// One property slot. The slot kind always agrees with the kind bits of
/// the shape entry at the same index.
pub enum Property {
    /// Plain data slot
    Value(Value),
    /// Accessor pair
    GetSet {
        /// Getter function object, if any
        getter: Option<GcRef<JsObject>>,
        /// Setter function object, if any
        setter: Option<GcRef<JsObject>>,
    },
    /// Live binding into a closure/module cell
    VarRef(GcRef<VarRef>),
    /// Materialized on first access
    AutoInit {
        /// Realm to materialize in
        realm: GcRef<Realm>,
        /// What to materialize
        kind: AutoInitKind,
    },
    /// Placeholder for a deleted shape entry
    Deleted,
}

/// Lazily materialized property payloads.
#[derive(Clone)]
pub enum AutoInitKind {
    /// `export * as ns from "mod"`: the required module's namespace
    ModuleNs(GcRef<ModuleRecord>),
}

impl Clone for Property {
    fn clone(&self) -> Self {
        match self {
            Property::Value(v) => Property::Value(v.clone()),
            Property::GetSet { getter, setter } => Property::GetSet {
                getter: getter.clone(),
                setter: setter.clone(),
            },
            Property::VarRef(r) => Property::VarRef(r.clone()),
            Property::AutoInit { realm, kind } => Property::AutoInit {
                realm: realm.clone(),
                kind: kind.clone(),
            },
            Property::Deleted => Property::Deleted,
        }
    }
}

impl Property {
    /// Report GC children.
    pub fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        match self {
            Property::Value(v) => v.trace(mark),
            Property::GetSet { getter, setter } => {
                if let Some(g) = getter {
                    mark(g.as_any());
                }
                if let Some(s) = setter {
                    mark(s.as_any());
                }
            }
            Property::VarRef(r) => mark(r.as_any()),
            Property::AutoInit { realm, kind } => {
                mark(realm.as_any());
                match kind {
                    AutoInitKind::ModuleNs(m) => mark(m.as_any()),
                }
            }
            Property::Deleted => {}
        }
    }
}

impl std::fmt::Debug for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Property::Value(v) => write!(f, "Value({v:?})"),
            Property::GetSet { getter, setter } => write!(
                f,
                "GetSet(get={}, set={})",
                getter.is_some(),
                setter.is_some()
            ),
            Property::VarRef(_) => write!(f, "VarRef"),
            Property::AutoInit { .. } => write!(f, "AutoInit"),
            Property::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Embedder payloads for user-registered classes trace their own GC
/// children.
pub trait OpaqueData: Any {
    /// Report GC children held by the payload.
    fn trace(&self, _mark: &mut dyn FnMut(GcAny)) {}

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

/// Class-specific payload.
pub enum ObjectData {
    /// Nothing beyond ordinary properties
    Ordinary,
    /// Dense element storage (valid while `FAST_ARRAY` is set)
    Array(Vec<Value>),
    /// Bytecode function closure
    Closure(Box<ClosureData>),
    /// Native function
    Native(Box<NativeFunctionData>),
    /// `Function.prototype.bind` result
    Bound(Box<BoundFunctionData>),
    /// Generator state
    Generator(Box<GeneratorData>),
    /// ArrayBuffer / SharedArrayBuffer backing storage
    ArrayBuffer(ArrayBufferData),
    /// Typed-array view over a buffer
    TypedArray(TypedArrayData),
    /// Proxy target/handler pair
    Proxy(ProxyData),
    /// Promise state machine
    Promise(Box<PromiseData>),
    /// Map/Set/WeakMap/WeakSet storage
    Map(Rc<MapState>),
    /// WeakRef target slot
    WeakRef(Rc<WeakSlot>),
    /// Module namespace exotic object
    ModuleNamespace(GcRef<ModuleRecord>),
    /// `for-in` iterator snapshot
    ForIn(Box<ForInIterator>),
    /// Boxed primitive (Number/String/Boolean/Symbol wrappers, Date)
    Boxed(Value),
    /// Embedder-defined payload
    Opaque(Box<dyn OpaqueData>),
}

impl ObjectData {
    /// Report GC children.
    pub fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        match self {
            ObjectData::Ordinary => {}
            ObjectData::Array(values) => {
                for v in values {
                    v.trace(mark);
                }
            }
            ObjectData::Closure(c) => c.trace(mark),
            ObjectData::Native(n) => n.trace(mark),
            ObjectData::Bound(b) => b.trace(mark),
            ObjectData::Generator(g) => g.trace(mark),
            ObjectData::ArrayBuffer(_) => {}
            ObjectData::TypedArray(t) => t.trace(mark),
            ObjectData::Proxy(p) => p.trace(mark),
            ObjectData::Promise(p) => p.trace(mark),
            ObjectData::Map(m) => m.trace(mark),
            ObjectData::WeakRef(_) => {}
            ObjectData::ModuleNamespace(m) => mark(m.as_any()),
            ObjectData::ForIn(it) => it.target.trace(mark),
            ObjectData::Boxed(v) => v.trace(mark),
            ObjectData::Opaque(o) => o.trace(mark),
        }
    }
}

/// Snapshot state of a `for-in` enumeration. Keys are held as strings so
/// the snapshot owns no atom references.
pub struct ForInIterator {
    /// The object being enumerated
    pub target: Value,
    /// Enumerable string keys captured at creation
    pub keys: Vec<Rc<crate::string::JsString>>,
    /// Next position
    pub pos: Cell<usize>,
}

/// A JavaScript object.
pub struct JsObject {
    class_id: ClassId,
    flags: Cell<u8>,
    shape: RefCell<GcRef<Shape>>,
    props: RefCell<Vec<Property>>,
    data: RefCell<ObjectData>,
    /// Weak slots whose target is this object; cleared by the sweeper
    weak_refs: RefCell<Vec<Rc<WeakSlot>>>,
}

impl Trace for JsObject {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        mark(self.shape.borrow().as_any());
        for prop in self.props.borrow().iter() {
            prop.trace(mark);
        }
        self.data.borrow().trace(mark);
    }
}

impl JsObject {
    /// Create an object with the given class, shape and payload. The
    /// property array starts sized to the shape (all slots `Deleted` when
    /// the shape is non-empty, which only happens for cloned layouts).
    pub fn new(class_id: ClassId, shape: GcRef<Shape>, data: ObjectData) -> JsObject {
        let prop_count = shape.prop_count();
        let mut props = Vec::with_capacity(prop_count);
        for _ in 0..prop_count {
            props.push(Property::Deleted);
        }
        JsObject {
            class_id,
            flags: Cell::new(obj_flags::EXTENSIBLE),
            shape: RefCell::new(shape),
            props: RefCell::new(props),
            data: RefCell::new(data),
            weak_refs: RefCell::new(Vec::new()),
        }
    }

    /// The class this object was created with.
    #[inline]
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Test a flag bit.
    #[inline]
    pub fn has_flag(&self, bit: u8) -> bool {
        self.flags.get() & bit != 0
    }

    /// Set or clear a flag bit.
    pub fn set_flag(&self, bit: u8, on: bool) {
        if on {
            self.flags.set(self.flags.get() | bit);
        } else {
            self.flags.set(self.flags.get() & !bit);
        }
    }

    /// New properties may be added.
    #[inline]
    pub fn is_extensible(&self) -> bool {
        self.has_flag(obj_flags::EXTENSIBLE)
    }

    /// Dense element storage is active.
    #[inline]
    pub fn is_fast_array(&self) -> bool {
        self.has_flag(obj_flags::FAST_ARRAY)
    }

    /// Current shape.
    pub fn shape(&self) -> GcRef<Shape> {
        self.shape.borrow().clone()
    }

    /// Retarget to a different shape. The caller keeps the property array
    /// consistent with the new shape.
    pub fn set_shape(&self, shape: GcRef<Shape>) {
        *self.shape.borrow_mut() = shape;
    }

    /// Number of property slots (== shape entry count).
    pub fn prop_len(&self) -> usize {
        self.props.borrow().len()
    }

    /// Run `f` over the property slot at `idx`.
    pub fn with_prop<R>(&self, idx: usize, f: impl FnOnce(&Property) -> R) -> R {
        f(&self.props.borrow()[idx])
    }

    /// Replace the property slot at `idx`.
    pub fn set_prop(&self, idx: usize, prop: Property) {
        self.props.borrow_mut()[idx] = prop;
    }

    /// Append a property slot (paired with a shape `add_prop`).
    pub fn push_prop(&self, prop: Property) {
        self.props.borrow_mut().push(prop);
    }

    /// Rewrite the whole slot array (compaction, fast-array conversion).
    pub fn replace_props(&self, props: Vec<Property>) {
        *self.props.borrow_mut() = props;
    }

    /// Take the slot at `idx`, leaving `Deleted`.
    pub fn take_prop(&self, idx: usize) -> Property {
        std::mem::replace(&mut self.props.borrow_mut()[idx], Property::Deleted)
    }

    /// Run `f` over the class payload.
    pub fn with_data<R>(&self, f: impl FnOnce(&ObjectData) -> R) -> R {
        f(&self.data.borrow())
    }

    /// Run `f` over the class payload mutably.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut ObjectData) -> R) -> R {
        f(&mut self.data.borrow_mut())
    }

    /// Replace the class payload (revocation, detach).
    pub fn replace_data(&self, data: ObjectData) -> ObjectData {
        std::mem::replace(&mut self.data.borrow_mut(), data)
    }

    /// Register a weak slot targeting this object.
    pub fn add_weak_slot(&self, slot: Rc<WeakSlot>) {
        self.weak_refs.borrow_mut().push(slot);
    }

    /// Unregister a weak slot (by `Rc` identity).
    pub fn remove_weak_slot(&self, slot: &Rc<WeakSlot>) {
        self.weak_refs
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(s, slot));
    }

    /// Drain the weak slot list (sweeper).
    pub fn take_weak_slots(&self) -> Vec<Rc<WeakSlot>> {
        std::mem::take(&mut *self.weak_refs.borrow_mut())
    }
}

impl std::fmt::Debug for JsObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsObject")
            .field("class_id", &self.class_id)
            .field("props", &self.prop_len())
            .field("fast_array", &self.is_fast_array())
            .finish()
    }
}
