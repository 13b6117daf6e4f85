//! Realms and contexts
//!
//! A realm is a GC object holding per-realm intrinsics: the class
//! prototype array, the error prototypes, the global object and the
//! well-known symbols. A `Context` is the host handle, a `(runtime,
//! realm)` pair; `dup_context` is `Clone`.

use std::cell::RefCell;
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcRef, Trace};

use crate::atom::JsSymbol;
use crate::error::{ErrorKind, JsException, JsResult};
use crate::object::{ClassId, JsObject, ObjectData, class_ids};
use crate::runtime::Runtime;
use crate::shape::PropFlags;
use crate::string::JsString;
use crate::value::Value;

/// The well-known symbols of one realm.
#[derive(Clone)]
pub struct WellKnownSymbols {
    /// `Symbol.iterator`
    pub iterator: Rc<JsSymbol>,
    /// `Symbol.species`
    pub species: Rc<JsSymbol>,
    /// `Symbol.toPrimitive`
    pub to_primitive: Rc<JsSymbol>,
    /// `Symbol.toStringTag`
    pub to_string_tag: Rc<JsSymbol>,
    /// `Symbol.hasInstance`
    pub has_instance: Rc<JsSymbol>,
}

/// Per-realm intrinsics (GC kind `Realm`).
pub struct Realm {
    class_protos: RefCell<Vec<Value>>,
    error_protos: RefCell<Vec<Value>>,
    global_obj: RefCell<Value>,
    promise_ctor: RefCell<Value>,
    symbols: RefCell<Option<WellKnownSymbols>>,
}

impl Trace for Realm {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        for v in self.class_protos.borrow().iter() {
            v.trace(mark);
        }
        for v in self.error_protos.borrow().iter() {
            v.trace(mark);
        }
        self.global_obj.borrow().trace(mark);
        self.promise_ctor.borrow().trace(mark);
    }
}

impl Realm {
    pub(crate) fn empty(class_count: usize) -> Realm {
        Realm {
            class_protos: RefCell::new(vec![Value::Undefined; class_count]),
            error_protos: RefCell::new(vec![Value::Undefined; 8]),
            global_obj: RefCell::new(Value::Undefined),
            promise_ctor: RefCell::new(Value::Undefined),
            symbols: RefCell::new(None),
        }
    }

    /// Prototype registered for a class in this realm.
    pub fn class_proto(&self, id: ClassId) -> Value {
        self.class_protos
            .borrow()
            .get(id as usize)
            .cloned()
            .unwrap_or(Value::Undefined)
    }

    /// Install a class prototype.
    pub fn set_class_proto(&self, id: ClassId, proto: Value) {
        self.ensure_class_slot(id);
        self.class_protos.borrow_mut()[id as usize] = proto;
    }

    pub(crate) fn ensure_class_slot(&self, id: ClassId) {
        let mut protos = self.class_protos.borrow_mut();
        if protos.len() <= id as usize {
            protos.resize(id as usize + 1, Value::Undefined);
        }
    }

    /// Error prototype for `kind`.
    pub fn error_proto(&self, kind: ErrorKind) -> Value {
        self.error_protos.borrow()[kind.index()].clone()
    }

    pub(crate) fn set_error_proto(&self, kind: ErrorKind, proto: Value) {
        self.error_protos.borrow_mut()[kind.index()] = proto;
    }

    /// The realm's global object.
    pub fn global(&self) -> Value {
        self.global_obj.borrow().clone()
    }

    pub(crate) fn set_global(&self, global: Value) {
        *self.global_obj.borrow_mut() = global;
    }

    /// The intrinsic `Promise` constructor (species fast path).
    pub fn promise_ctor(&self) -> Value {
        self.promise_ctor.borrow().clone()
    }

    pub(crate) fn set_promise_ctor(&self, ctor: Value) {
        *self.promise_ctor.borrow_mut() = ctor;
    }

    /// Well-known symbols.
    pub fn symbols(&self) -> WellKnownSymbols {
        self.symbols
            .borrow()
            .clone()
            .expect("realm symbols initialized at context creation")
    }

    pub(crate) fn set_symbols(&self, symbols: WellKnownSymbols) {
        *self.symbols.borrow_mut() = Some(symbols);
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Realm")
    }
}

/// Host handle to a realm within a runtime.
#[derive(Clone)]
pub struct Context {
    pub(crate) rt: Runtime,
    pub(crate) realm: GcRef<Realm>,
}

impl Context {
    /// Create a realm with its intrinsics and hand back the context.
    pub fn new(rt: &Runtime) -> Context {
        let class_count = rt.inner.classes.borrow().id_upper_bound();
        let realm = rt
            .heap()
            .alloc(marten_vm_gc::GcKind::Realm, Realm::empty(class_count));
        rt.register_realm(&realm);
        let ctx = Context {
            rt: rt.clone(),
            realm,
        };
        crate::intrinsics::init_realm(&ctx);
        ctx
    }

    /// Rebuild a context handle from stored parts (jobs, native realms).
    pub fn from_parts(rt: Runtime, realm: GcRef<Realm>) -> Context {
        Context { rt, realm }
    }

    /// The owning runtime.
    pub fn rt(&self) -> &Runtime {
        &self.rt
    }

    /// The realm record.
    pub fn realm(&self) -> &GcRef<Realm> {
        &self.realm
    }

    /// Realm identity comparison.
    pub fn same_realm(a: &Context, b: &Context) -> bool {
        GcRef::ptr_eq(&a.realm, &b.realm)
    }

    /// The realm's global object.
    pub fn global(&self) -> Value {
        self.realm.global()
    }

    // ---- exception helpers ----------------------------------------------

    /// Throw an arbitrary value.
    pub fn throw(&self, value: Value) -> JsException {
        self.rt.throw(value)
    }

    /// Consume the pending exception.
    pub fn get_exception(&self) -> Value {
        self.rt.take_exception()
    }

    /// Build an error object of `kind` with a message and captured stack.
    pub fn new_error(&self, kind: ErrorKind, message: &str) -> Value {
        let proto = self.realm.error_proto(kind);
        let proto_obj = proto.as_object().cloned();
        let obj = self.new_object_full(class_ids::ERROR, proto_obj, ObjectData::Ordinary);
        let common = self.rt.common_atoms();
        self.define_own_property_raw(
            &obj,
            common.message,
            crate::object::Property::Value(Value::string(message)),
            PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
        );
        let backtrace = self.build_backtrace(1);
        self.define_own_property_raw(
            &obj,
            common.stack,
            crate::object::Property::Value(Value::string(&backtrace)),
            PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
        );
        Value::Object(obj)
    }

    /// Throw a freshly built error of `kind`.
    pub fn throw_error(&self, kind: ErrorKind, message: &str) -> JsException {
        let err = self.new_error(kind, message);
        self.throw(err)
    }

    /// `TypeError`
    pub fn throw_type_error(&self, message: impl AsRef<str>) -> JsException {
        self.throw_error(ErrorKind::Type, message.as_ref())
    }

    /// `RangeError`
    pub fn throw_range_error(&self, message: impl AsRef<str>) -> JsException {
        self.throw_error(ErrorKind::Range, message.as_ref())
    }

    /// `ReferenceError`
    pub fn throw_reference_error(&self, message: impl AsRef<str>) -> JsException {
        self.throw_error(ErrorKind::Reference, message.as_ref())
    }

    /// `SyntaxError`
    pub fn throw_syntax_error(&self, message: impl AsRef<str>) -> JsException {
        self.throw_error(ErrorKind::Syntax, message.as_ref())
    }

    /// `InternalError`
    pub fn throw_internal_error(&self, message: impl AsRef<str>) -> JsException {
        self.throw_error(ErrorKind::Internal, message.as_ref())
    }

    /// Out-of-memory: uncatchable by design.
    pub fn throw_out_of_memory(&self) -> JsException {
        let exc = self.throw_error(ErrorKind::Internal, "out of memory");
        self.rt.set_uncatchable_error(true);
        exc
    }

    /// `"Name: message"` rendering of a (usually error) value.
    pub fn error_to_string(&self, value: &Value) -> String {
        if let Some(obj) = value.as_object() {
            let common = self.rt.common_atoms();
            let name = self
                .get_property_value(&Value::Object(obj.clone()), common.name)
                .ok()
                .and_then(|v| v.as_string().map(|s| s.to_rust_string()))
                .unwrap_or_else(|| "Error".to_string());
            let message = self
                .get_property_value(&Value::Object(obj.clone()), common.message)
                .ok()
                .and_then(|v| v.as_string().map(|s| s.to_rust_string()))
                .unwrap_or_default();
            if message.is_empty() {
                return name;
            }
            return format!("{name}: {message}");
        }
        match value {
            Value::String(s) => s.to_rust_string(),
            other => format!("{other:?}"),
        }
    }

    /// Render the current frame chain, newest first. `skip_levels`
    /// suppresses the innermost frames (hides the Error constructor).
    pub fn build_backtrace(&self, skip_levels: usize) -> String {
        // Snapshot first: naming a function can run user lookups, which
        // must not observe the frame list borrowed.
        let funcs: Vec<Value> = {
            let frames = self.rt.inner.frames.borrow();
            frames
                .iter()
                .rev()
                .skip(skip_levels)
                .map(|frame| frame.func.clone())
                .collect()
        };
        let mut out = String::new();
        for func in &funcs {
            out.push_str("    at ");
            out.push_str(&self.function_name_of(func));
            out.push('\n');
        }
        out
    }

    fn function_name_of(&self, func: &Value) -> String {
        if let Some(obj) = func.as_object() {
            let name = obj.with_data(|data| match data {
                ObjectData::Closure(c) => {
                    let atom = c.func.name.get();
                    if atom.is_null() {
                        None
                    } else {
                        Some(self.rt.atom_to_string(atom).to_rust_string())
                    }
                }
                _ => None,
            });
            if let Some(name) = name
                && !name.is_empty()
            {
                return name;
            }
            let common = self.rt.common_atoms();
            if let Ok(v) = self.get_property_value(func, common.name)
                && let Some(s) = v.as_string()
                && !s.is_empty()
            {
                return s.to_rust_string();
            }
        }
        "<anonymous>".to_string()
    }

    // ---- cooperative scheduling ------------------------------------------

    /// Poll the host interrupt hook; throws a catchable `InternalError`
    /// when the host asks to abort.
    pub fn poll_interrupt(&self) -> JsResult<()> {
        let interrupted = {
            let handler = self.rt.inner.interrupt.borrow();
            match handler.as_ref() {
                Some(h) => h(),
                None => false,
            }
        };
        if interrupted {
            return Err(self.throw_internal_error("interrupted"));
        }
        Ok(())
    }

    /// Refuse calls that would overflow the configured stack budget.
    pub fn check_stack(&self) -> JsResult<()> {
        if self.rt.stack_used() > self.rt.inner.max_stack_size.get() {
            return Err(self.throw_internal_error("stack overflow"));
        }
        Ok(())
    }

    /// New string value helper.
    pub fn new_string(&self, s: &str) -> Value {
        Value::String(JsString::from_str(s))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context")
    }
}
