//! Call dispatch
//!
//! Every invocation funnels through [`Context::call_flags`]: native
//! functions run in their recorded realm, bytecode functions get a frame
//! pushed and their [`FunctionBody`](crate::function::FunctionBody) run,
//! bound functions splice arguments, proxies trap, and anything else
//! falls back to the class `call` hook.

use marten_vm_gc::{GcKind, GcRef};

use crate::context::Context;
use crate::error::JsResult;
use crate::frame::{Frame, VarRef};
use crate::function::{
    BoundFunctionData, CallFlags, ClosureData, FrameRef, FunctionBytecode, NativeFn,
    NativeFunctionData,
};
use crate::object::{JsObject, ObjectData, Property, class_ids, obj_flags};
use crate::shape::PropFlags;
use crate::value::Value;

impl Context {
    /// True when `[[Call]]` would succeed on `value`.
    pub fn is_callable(&self, value: &Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        match obj.class_id() {
            class_ids::C_FUNCTION | class_ids::BYTECODE_FUNCTION | class_ids::BOUND_FUNCTION => {
                true
            }
            class_ids::PROXY => obj.with_data(|d| match d {
                ObjectData::Proxy(p) => p.is_callable(),
                _ => false,
            }),
            id => {
                let call = self.rt.inner.classes.borrow().call_of(id);
                call.is_some()
            }
        }
    }

    /// `[[Call]]`.
    pub fn call(&self, func: &Value, this: &Value, args: &[Value]) -> JsResult<Value> {
        self.call_flags(func, this, args, CallFlags::default())
    }

    /// `[[Call]]`/`[[Construct]]` with explicit flags.
    pub fn call_flags(
        &self,
        func: &Value,
        this: &Value,
        args: &[Value],
        flags: CallFlags,
    ) -> JsResult<Value> {
        self.check_stack()?;
        self.poll_interrupt()?;
        let Some(obj) = func.as_object() else {
            return Err(self.throw_type_error("value is not a function"));
        };
        match obj.class_id() {
            class_ids::C_FUNCTION => {
                let (realm, native, magic, data) = obj.with_data(|d| match d {
                    ObjectData::Native(n) => {
                        (n.realm.clone(), n.func.clone(), n.magic, n.data.clone())
                    }
                    _ => unreachable!("C function without native payload"),
                });
                let ctx = Context::from_parts(self.rt.clone(), realm);
                native(&ctx, this, args, &data, magic)
            }
            class_ids::BYTECODE_FUNCTION => self.call_closure(obj, this, args, flags),
            class_ids::BOUND_FUNCTION => {
                let (target, bound_this, mut all_args) = obj.with_data(|d| match d {
                    ObjectData::Bound(b) => {
                        (b.target.clone(), b.this_val.clone(), b.bound_args.clone())
                    }
                    _ => unreachable!("bound function without payload"),
                });
                all_args.extend_from_slice(args);
                let this = if flags.constructor { this } else { &bound_this };
                self.call_flags(&target, this, &all_args, flags)
            }
            class_ids::PROXY => crate::proxy::proxy_call(self, obj, this, args, flags),
            id => {
                let call = self.rt.inner.classes.borrow().call_of(id);
                match call {
                    Some(hook) => hook(self, func, this, args, flags),
                    None => Err(self.throw_type_error("value is not a function")),
                }
            }
        }
    }

    /// `new F(...)`: ordinary construct for closures (fresh `this` from
    /// `F.prototype`), flag-forwarded for everything else.
    pub fn call_constructor(&self, func: &Value, args: &[Value]) -> JsResult<Value> {
        let Some(obj) = func.as_object() else {
            return Err(self.throw_type_error("value is not a constructor"));
        };
        if !obj.has_flag(obj_flags::CONSTRUCTOR) {
            return Err(self.throw_type_error("value is not a constructor"));
        }
        let flags = CallFlags {
            constructor: true,
            generator: false,
        };
        if obj.class_id() == class_ids::BYTECODE_FUNCTION {
            let proto = self.get_property_value(func, self.rt.common_atoms().prototype)?;
            let this_obj = match proto.as_object() {
                Some(p) => self.new_object_full(
                    class_ids::OBJECT,
                    Some(p.clone()),
                    ObjectData::Ordinary,
                ),
                None => self.new_plain_object(),
            };
            let this = Value::Object(this_obj);
            let ret = self.call_flags(func, &this, args, flags)?;
            return Ok(if ret.is_object() { ret } else { this });
        }
        self.call_flags(func, &Value::Undefined, args, flags)
    }

    fn call_closure(
        &self,
        obj: &GcRef<JsObject>,
        this: &Value,
        args: &[Value],
        flags: CallFlags,
    ) -> JsResult<Value> {
        let (func_rec, realm) = obj.with_data(|d| match d {
            ObjectData::Closure(c) => (c.func.clone(), c.realm.clone()),
            _ => unreachable!("closure without payload"),
        });
        if (func_rec.flags.is_generator || func_rec.flags.is_async) && !flags.generator {
            return crate::coroutine::start_coroutine(self, obj, this, args);
        }
        let body = func_rec.body_or_throw(self)?;
        let ctx = Context::from_parts(self.rt.clone(), realm);
        let frame = Frame::new(
            Value::Object(obj.clone()),
            this.clone(),
            args,
            func_rec.var_count as usize,
            func_rec.flags.strict,
        );
        let depth = self.rt.push_frame(frame);
        let result = body.call(&ctx, FrameRef { depth });
        self.rt.pop_frame();
        result
    }

    // ---- frame access for function bodies --------------------------------

    /// Argument `i` of the activation (missing → `undefined`).
    pub fn frame_arg(&self, frame: FrameRef, i: usize) -> Value {
        self.rt.with_frame(frame.depth, |f| {
            if i < f.arg_count {
                f.locals[i].clone()
            } else {
                Value::Undefined
            }
        })
    }

    /// Number of arguments passed.
    pub fn frame_argc(&self, frame: FrameRef) -> usize {
        self.rt.with_frame(frame.depth, |f| f.arg_count)
    }

    /// `this` of the activation.
    pub fn frame_this(&self, frame: FrameRef) -> Value {
        self.rt.with_frame(frame.depth, |f| f.this.clone())
    }

    /// The function object of the activation.
    pub fn frame_func(&self, frame: FrameRef) -> Value {
        self.rt.with_frame(frame.depth, |f| f.func.clone())
    }

    /// Read local slot `slot` (arguments occupy the leading slots).
    pub fn frame_local(&self, frame: FrameRef, slot: usize) -> Value {
        self.rt
            .with_frame(frame.depth, |f| f.locals[slot].clone())
    }

    /// Write local slot `slot`.
    pub fn frame_set_local(&self, frame: FrameRef, slot: usize, value: Value) {
        self.rt.with_frame(frame.depth, |f| f.locals[slot] = value);
    }

    /// The open variable cell for a frame slot, created on first capture.
    pub fn capture_var_ref(&self, frame: FrameRef, slot: usize) -> GcRef<VarRef> {
        let existing = self
            .rt
            .with_frame(frame.depth, |f| f.find_var_ref(frame.depth, slot));
        if let Some(vr) = existing {
            return vr;
        }
        let vr = self
            .rt
            .heap()
            .alloc(GcKind::VarRef, VarRef::new_open(frame.depth, slot));
        self.rt
            .with_frame(frame.depth, |f| f.var_refs.push(vr.clone()));
        vr
    }

    /// Read through a variable cell (open cells read their frame slot).
    pub fn var_ref_value(&self, vr: &GcRef<VarRef>) -> JsResult<Value> {
        match vr.open_slot() {
            Some((frame, slot)) => Ok(self
                .rt
                .with_frame(frame, |f| f.locals.get(slot).cloned())
                .unwrap_or(Value::Undefined)),
            None => Ok(vr.closed_value().unwrap_or(Value::Undefined)),
        }
    }

    /// Write through a variable cell.
    pub fn var_ref_set(&self, vr: &GcRef<VarRef>, value: Value) {
        match vr.open_slot() {
            Some((frame, slot)) => self.rt.with_frame(frame, |f| {
                if slot < f.locals.len() {
                    f.locals[slot] = value;
                }
            }),
            None => vr.set_closed_value(value),
        }
    }

    // ---- function object construction ------------------------------------

    /// Build the function object for a compiled record, snapshotting the
    /// captured cells described by its closure variables.
    ///
    /// `parent` is the creating activation; `None` is only valid for
    /// functions that capture nothing (or module functions whose cells
    /// are supplied via `module_var_refs`).
    pub fn new_closure(
        &self,
        func: &GcRef<FunctionBytecode>,
        parent: Option<FrameRef>,
        module_var_refs: Option<&[GcRef<VarRef>]>,
    ) -> JsResult<GcRef<JsObject>> {
        let mut var_refs = Vec::with_capacity(func.closure_vars.len());
        if let Some(cells) = module_var_refs {
            var_refs.extend(cells.iter().cloned());
        } else {
            for cv in &func.closure_vars {
                if cv.is_local {
                    let Some(parent) = parent else {
                        return Err(
                            self.throw_internal_error("closure capture without parent frame")
                        );
                    };
                    var_refs.push(self.capture_var_ref(parent, cv.idx as usize));
                } else {
                    let Some(parent) = parent else {
                        return Err(
                            self.throw_internal_error("closure capture without parent frame")
                        );
                    };
                    let parent_func = self.frame_func(parent);
                    let captured = parent_func
                        .as_object()
                        .map(|o| {
                            o.with_data(|d| match d {
                                ObjectData::Closure(c) => {
                                    c.var_refs.get(cv.idx as usize).cloned()
                                }
                                _ => None,
                            })
                        })
                        .unwrap_or(None);
                    match captured {
                        Some(vr) => var_refs.push(vr),
                        None => {
                            return Err(self.throw_internal_error(
                                "closure variable index out of range",
                            ));
                        }
                    }
                }
            }
        }
        let obj = self.new_object_class(
            class_ids::BYTECODE_FUNCTION,
            ObjectData::Closure(Box::new(ClosureData {
                func: func.clone(),
                var_refs,
                home_object: None,
                realm: self.realm.clone(),
            })),
        );
        obj.set_flag(obj_flags::CONSTRUCTOR, !func.flags.is_generator && !func.flags.is_async);
        let common = self.rt.common_atoms();
        let name = self.rt.atom_to_string(func.name.get());
        self.define_own_property_raw(
            &obj,
            common.name,
            Property::Value(Value::String(name)),
            PropFlags::from_bits(PropFlags::CONFIGURABLE),
        );
        self.define_own_property_raw(
            &obj,
            common.length,
            Property::Value(Value::Int(func.arg_count as i32)),
            PropFlags::from_bits(PropFlags::CONFIGURABLE),
        );
        Ok(obj)
    }

    /// Build a native function object.
    pub fn new_native_function(
        &self,
        name: &str,
        length: u16,
        func: NativeFn,
    ) -> GcRef<JsObject> {
        self.new_native_function_data(name, length, 0, Vec::new(), func)
    }

    /// Build a native function object with a traced data payload and a
    /// magic discriminator.
    pub fn new_native_function_data(
        &self,
        name: &str,
        length: u16,
        magic: i32,
        data: Vec<Value>,
        func: NativeFn,
    ) -> GcRef<JsObject> {
        let obj = self.new_object_class(
            class_ids::C_FUNCTION,
            ObjectData::Native(Box::new(NativeFunctionData {
                realm: self.realm.clone(),
                func,
                magic,
                data,
            })),
        );
        let common = self.rt.common_atoms();
        self.define_own_property_raw(
            &obj,
            common.name,
            Property::Value(Value::string(name)),
            PropFlags::from_bits(PropFlags::CONFIGURABLE),
        );
        self.define_own_property_raw(
            &obj,
            common.length,
            Property::Value(Value::Int(length as i32)),
            PropFlags::from_bits(PropFlags::CONFIGURABLE),
        );
        obj
    }

    /// `Function.prototype.bind`.
    pub fn new_bound_function(
        &self,
        target: &Value,
        this_val: &Value,
        bound_args: &[Value],
    ) -> JsResult<GcRef<JsObject>> {
        if !self.is_callable(target) {
            return Err(self.throw_type_error("bind target is not callable"));
        }
        let obj = self.new_object_class(
            class_ids::BOUND_FUNCTION,
            ObjectData::Bound(Box::new(BoundFunctionData {
                target: target.clone(),
                this_val: this_val.clone(),
                bound_args: bound_args.to_vec(),
            })),
        );
        if target
            .as_object()
            .map(|o| o.has_flag(obj_flags::CONSTRUCTOR))
            .unwrap_or(false)
        {
            obj.set_flag(obj_flags::CONSTRUCTOR, true);
        }
        let common = self.rt.common_atoms();
        let target_name = self
            .get_property_value(target, common.name)
            .ok()
            .and_then(|v| v.as_string().map(|s| s.to_rust_string()))
            .unwrap_or_default();
        self.define_own_property_raw(
            &obj,
            common.name,
            Property::Value(Value::string(&format!("bound {target_name}"))),
            PropFlags::from_bits(PropFlags::CONFIGURABLE),
        );
        let target_len = self
            .get_property_value(target, common.length)
            .ok()
            .and_then(|v| v.as_number())
            .unwrap_or(0.0);
        let remaining = (target_len - bound_args.len() as f64).max(0.0);
        self.define_own_property_raw(
            &obj,
            common.length,
            Property::Value(Value::number(remaining)),
            PropFlags::from_bits(PropFlags::CONFIGURABLE),
        );
        Ok(obj)
    }
}
