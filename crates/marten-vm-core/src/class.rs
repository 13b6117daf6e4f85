//! Class registry: per-class finalizer, marker, call and exotic methods
//!
//! A class is a small-integer id plus an optional set of hooks. Built-in
//! classes occupy a reserved low-id range; embedders register further
//! classes at runtime, which also grows every realm's prototype array.
//! Hook fields left empty short-circuit to the ordinary algorithms.

use std::rc::Rc;

use marten_vm_gc::{GcAny, GcRef};

use crate::atom::Atom;
use crate::context::Context;
use crate::error::JsResult;
use crate::function::CallFlags;
use crate::object::{ClassId, JsObject, class_ids};
use crate::shape::PropFlags;
use crate::value::Value;

/// `[[Call]]` hook: `(ctx, func, this, args, flags)`.
pub type ClassCallFn = Rc<dyn Fn(&Context, &Value, &Value, &[Value], CallFlags) -> JsResult<Value>>;

/// Per-object finalizer hook, run before the allocation is freed.
pub type ClassFinalizer = Box<dyn Fn(&JsObject)>;

/// Extra GC marking for classes whose payload the object model cannot see.
pub type ClassGcMark = fn(&JsObject, &mut dyn FnMut(GcAny));

/// Outcome of an exotic method: handled here, or fall through to the
/// ordinary algorithm.
pub enum ExoticResult<T> {
    /// The exotic behavior produced a result
    Handled(T),
    /// Continue with the default algorithm
    Ordinary,
}

/// A property as seen by `get_own_property`.
#[derive(Clone, Debug)]
pub struct OwnProperty {
    /// Payload
    pub kind: OwnPropertyKind,
    /// Attribute bits
    pub flags: PropFlags,
}

/// Own-property payload.
#[derive(Clone, Debug)]
pub enum OwnPropertyKind {
    /// Data property (var-ref and auto-init slots read as data)
    Value(Value),
    /// Accessor property
    GetSet {
        /// Getter, if any
        getter: Option<Value>,
        /// Setter, if any
        setter: Option<Value>,
    },
}

impl OwnProperty {
    /// The data value, if this is a data property.
    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            OwnPropertyKind::Value(v) => Some(v),
            OwnPropertyKind::GetSet { .. } => None,
        }
    }

    /// True for data properties.
    pub fn is_data(&self) -> bool {
        matches!(self.kind, OwnPropertyKind::Value(_))
    }

    /// True when the property is a non-configurable, non-writable data
    /// property (the proxy invariants test this case repeatedly).
    pub fn is_frozen_data(&self) -> bool {
        self.is_data()
            && !self.flags.has(PropFlags::CONFIGURABLE)
            && !self.flags.has(PropFlags::WRITABLE)
    }
}

/// A (partial) property descriptor record, as passed to
/// `define_property`. Absent fields keep their current/default values per
/// the ordinary algorithm.
#[derive(Clone, Debug, Default)]
pub struct PropertyDescriptor {
    /// `value`
    pub value: Option<Value>,
    /// `get` (may be explicitly `undefined`)
    pub getter: Option<Value>,
    /// `set` (may be explicitly `undefined`)
    pub setter: Option<Value>,
    /// `writable`
    pub writable: Option<bool>,
    /// `enumerable`
    pub enumerable: Option<bool>,
    /// `configurable`
    pub configurable: Option<bool>,
}

impl PropertyDescriptor {
    /// Plain data descriptor with the given attributes.
    pub fn data(value: Value, writable: bool, enumerable: bool, configurable: bool) -> Self {
        Self {
            value: Some(value),
            writable: Some(writable),
            enumerable: Some(enumerable),
            configurable: Some(configurable),
            ..Default::default()
        }
    }

    /// Fully populated `{value, writable: true, enumerable: true,
    /// configurable: true}`.
    pub fn data_cwe(value: Value) -> Self {
        Self::data(value, true, true, true)
    }

    /// Accessor descriptor.
    pub fn accessor(
        getter: Option<Value>,
        setter: Option<Value>,
        enumerable: bool,
        configurable: bool,
    ) -> Self {
        Self {
            getter: Some(getter.unwrap_or(Value::Undefined)),
            setter: Some(setter.unwrap_or(Value::Undefined)),
            enumerable: Some(enumerable),
            configurable: Some(configurable),
            ..Default::default()
        }
    }

    /// Mentions `get` or `set`.
    pub fn is_accessor_descriptor(&self) -> bool {
        self.getter.is_some() || self.setter.is_some()
    }

    /// Mentions `value` or `writable`.
    pub fn is_data_descriptor(&self) -> bool {
        self.value.is_some() || self.writable.is_some()
    }

    /// Mentions neither kind (generic descriptor).
    pub fn is_generic_descriptor(&self) -> bool {
        !self.is_accessor_descriptor() && !self.is_data_descriptor()
    }
}

/// Exotic fundamental operations. Every method defaults to
/// [`ExoticResult::Ordinary`], mirroring a vtable of optional slots.
#[allow(unused_variables)]
pub trait ExoticMethods {
    /// `[[GetOwnProperty]]`
    fn get_own_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<Option<OwnProperty>>> {
        Ok(ExoticResult::Ordinary)
    }

    /// `[[DefineOwnProperty]]`
    fn define_own_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        desc: &PropertyDescriptor,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        Ok(ExoticResult::Ordinary)
    }

    /// `[[Delete]]`
    fn delete_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<bool>> {
        Ok(ExoticResult::Ordinary)
    }

    /// `[[HasProperty]]`
    fn has_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<bool>> {
        Ok(ExoticResult::Ordinary)
    }

    /// `[[Get]]`
    fn get_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        receiver: &Value,
    ) -> JsResult<ExoticResult<Value>> {
        Ok(ExoticResult::Ordinary)
    }

    /// `[[Set]]`; `true`/`false` per the set-property contract.
    fn set_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        value: Value,
        receiver: &Value,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        Ok(ExoticResult::Ordinary)
    }

    /// `[[OwnPropertyKeys]]`; returned atoms carry a reference each.
    fn own_property_names(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
    ) -> JsResult<ExoticResult<Vec<Atom>>> {
        Ok(ExoticResult::Ordinary)
    }
}

/// One registered class.
pub struct ClassDef {
    /// Class name (diagnostics, `Object.prototype.toString` tag)
    pub name: &'static str,
    /// Cleanup hook run before the object's allocation is freed
    pub finalizer: Option<ClassFinalizer>,
    /// Extra marking for opaque payloads
    pub gc_mark: Option<ClassGcMark>,
    /// `[[Call]]` behavior (present ⇒ the object is callable)
    pub call: Option<ClassCallFn>,
    /// Exotic fundamental operations
    pub exotic: Option<Rc<dyn ExoticMethods>>,
}

impl ClassDef {
    /// A data-only class with no hooks.
    pub fn plain(name: &'static str) -> ClassDef {
        ClassDef {
            name,
            finalizer: None,
            gc_mark: None,
            call: None,
            exotic: None,
        }
    }
}

/// The per-runtime class table, indexed by `ClassId`.
pub struct ClassRegistry {
    defs: Vec<Option<ClassDef>>,
    next_user_id: ClassId,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    /// Empty registry with room for the built-in range.
    pub fn new() -> ClassRegistry {
        let mut defs = Vec::with_capacity(class_ids::FIRST_USER as usize);
        defs.resize_with(class_ids::FIRST_USER as usize, || None);
        ClassRegistry {
            defs,
            next_user_id: class_ids::FIRST_USER,
        }
    }

    /// Install a definition at a fixed (built-in) id.
    pub fn register_builtin(&mut self, id: ClassId, def: ClassDef) {
        debug_assert!(id < class_ids::FIRST_USER);
        self.defs[id as usize] = Some(def);
    }

    /// Allocate the next user class id and install `def`. The caller
    /// (runtime) grows every realm's prototype array afterwards.
    pub fn register(&mut self, def: ClassDef) -> ClassId {
        let id = self.next_user_id;
        self.next_user_id += 1;
        if self.defs.len() <= id as usize {
            self.defs.resize_with(id as usize + 1, || None);
        }
        self.defs[id as usize] = Some(def);
        id
    }

    /// Definition lookup.
    pub fn get(&self, id: ClassId) -> Option<&ClassDef> {
        self.defs.get(id as usize).and_then(|d| d.as_ref())
    }

    /// Highest id any realm prototype array must cover.
    pub fn id_upper_bound(&self) -> usize {
        self.defs.len()
    }

    /// Call hook of a class, if any.
    pub fn call_of(&self, id: ClassId) -> Option<ClassCallFn> {
        self.get(id).and_then(|d| d.call.clone())
    }

    /// Exotic vtable of a class, if any.
    pub fn exotic_of(&self, id: ClassId) -> Option<Rc<dyn ExoticMethods>> {
        self.get(id).and_then(|d| d.exotic.clone())
    }
}

pub(crate) mod builtin {
    //! Built-in class table, installed at runtime creation.

    use std::rc::Rc;

    use super::{ClassDef, ExoticMethods};
    use crate::object::class_ids;
    use crate::runtime::Runtime;

    fn exotic(name: &'static str, methods: Rc<dyn ExoticMethods>) -> ClassDef {
        ClassDef {
            exotic: Some(methods),
            ..ClassDef::plain(name)
        }
    }

    pub(crate) fn register_builtin_classes(rt: &Runtime) {
        let mut reg = rt.inner.classes.borrow_mut();
        let typed_array: Rc<dyn ExoticMethods> = Rc::new(crate::typed_array::TypedArrayExotic);
        let module_ns: Rc<dyn ExoticMethods> = Rc::new(crate::module::ModuleNsExotic);
        let proxy: Rc<dyn ExoticMethods> = Rc::new(crate::proxy::ProxyExotic);
        let string_wrapper: Rc<dyn ExoticMethods> =
            Rc::new(crate::intrinsics::StringWrapperExotic);

        reg.register_builtin(class_ids::OBJECT, ClassDef::plain("Object"));
        reg.register_builtin(class_ids::ARRAY, ClassDef::plain("Array"));
        reg.register_builtin(class_ids::ERROR, ClassDef::plain("Error"));
        reg.register_builtin(class_ids::C_FUNCTION, ClassDef::plain("Function"));
        reg.register_builtin(class_ids::BYTECODE_FUNCTION, ClassDef::plain("Function"));
        reg.register_builtin(class_ids::BOUND_FUNCTION, ClassDef::plain("Function"));
        reg.register_builtin(class_ids::GENERATOR, ClassDef::plain("Generator"));
        reg.register_builtin(class_ids::ASYNC_FUNCTION, ClassDef::plain("AsyncFunction"));
        reg.register_builtin(class_ids::PROXY, exotic("Proxy", proxy));
        reg.register_builtin(class_ids::PROMISE, ClassDef::plain("Promise"));
        reg.register_builtin(class_ids::ARRAY_BUFFER, ClassDef::plain("ArrayBuffer"));
        reg.register_builtin(
            class_ids::SHARED_ARRAY_BUFFER,
            ClassDef::plain("SharedArrayBuffer"),
        );
        for (id, name) in [
            (class_ids::UINT8C_ARRAY, "Uint8ClampedArray"),
            (class_ids::INT8_ARRAY, "Int8Array"),
            (class_ids::UINT8_ARRAY, "Uint8Array"),
            (class_ids::INT16_ARRAY, "Int16Array"),
            (class_ids::UINT16_ARRAY, "Uint16Array"),
            (class_ids::INT32_ARRAY, "Int32Array"),
            (class_ids::UINT32_ARRAY, "Uint32Array"),
            (class_ids::BIG_INT64_ARRAY, "BigInt64Array"),
            (class_ids::BIG_UINT64_ARRAY, "BigUint64Array"),
            (class_ids::FLOAT32_ARRAY, "Float32Array"),
            (class_ids::FLOAT64_ARRAY, "Float64Array"),
        ] {
            reg.register_builtin(id, exotic(name, typed_array.clone()));
        }
        reg.register_builtin(class_ids::MAP, ClassDef::plain("Map"));
        reg.register_builtin(class_ids::SET, ClassDef::plain("Set"));
        reg.register_builtin(class_ids::WEAK_MAP, ClassDef::plain("WeakMap"));
        reg.register_builtin(class_ids::WEAK_SET, ClassDef::plain("WeakSet"));
        reg.register_builtin(class_ids::WEAK_REF, ClassDef::plain("WeakRef"));
        reg.register_builtin(class_ids::MODULE_NS, exotic("Module", module_ns));
        reg.register_builtin(
            class_ids::FOR_IN_ITERATOR,
            ClassDef::plain("ForInIterator"),
        );
        reg.register_builtin(class_ids::ARGUMENTS, ClassDef::plain("Arguments"));
        reg.register_builtin(class_ids::NUMBER, ClassDef::plain("Number"));
        reg.register_builtin(class_ids::STRING, exotic("String", string_wrapper));
        reg.register_builtin(class_ids::BOOLEAN, ClassDef::plain("Boolean"));
        reg.register_builtin(class_ids::SYMBOL, ClassDef::plain("Symbol"));
        reg.register_builtin(class_ids::DATE, ClassDef::plain("Date"));
    }
}
