//! Proxy objects
//!
//! A proxy forwards every fundamental operation to a handler trap and
//! validates the language invariants against the target's own property
//! state afterwards. A missing trap forwards to the target directly. Revocation
//! nulls the pair; handles cloned for an in-flight trap keep the objects
//! alive until that call returns.

use std::cell::{Cell, RefCell};

use marten_vm_gc::{GcAny, GcRef};

use crate::atom::Atom;
use crate::class::{
    ExoticMethods, ExoticResult, OwnProperty, OwnPropertyKind, PropertyDescriptor,
};
use crate::context::Context;
use crate::error::JsResult;
use crate::function::CallFlags;
use crate::object::{JsObject, ObjectData, class_ids};
use crate::object_ops::gpn_flags;
use crate::shape::PropFlags;
use crate::value::Value;

/// Proxy payload.
pub struct ProxyData {
    target: RefCell<Value>,
    handler: RefCell<Value>,
    is_func: bool,
    revoked: Cell<bool>,
}

impl ProxyData {
    /// The target was callable at construction.
    pub fn is_callable(&self) -> bool {
        self.is_func && !self.revoked.get()
    }

    /// Revoked proxies refuse every operation.
    pub fn is_revoked(&self) -> bool {
        self.revoked.get()
    }

    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        self.target.borrow().trace(mark);
        self.handler.borrow().trace(mark);
    }
}

impl Context {
    /// `new Proxy(target, handler)`.
    pub fn new_proxy(&self, target: &Value, handler: &Value) -> JsResult<GcRef<JsObject>> {
        let (Value::Object(_), Value::Object(_)) = (target, handler) else {
            return Err(self.throw_type_error("Proxy target and handler must be objects"));
        };
        let is_func = self.is_callable(target);
        let obj = self.new_object_full(
            class_ids::PROXY,
            None,
            ObjectData::Proxy(ProxyData {
                target: RefCell::new(target.clone()),
                handler: RefCell::new(handler.clone()),
                is_func,
                revoked: Cell::new(false),
            }),
        );
        Ok(obj)
    }

    /// Revoke a proxy: clears target and handler; in-flight traps keep
    /// their own handles.
    pub fn revoke_proxy(&self, proxy: &GcRef<JsObject>) {
        proxy.with_data(|d| {
            if let ObjectData::Proxy(p) = d {
                p.revoked.set(true);
                *p.target.borrow_mut() = Value::Null;
                *p.handler.borrow_mut() = Value::Null;
            }
        });
    }

    /// Convert an atom to its value form (string or symbol).
    pub fn atom_to_value(&self, atom: Atom) -> Value {
        if let Some(sym) = self.rt.inner.atoms.borrow().symbol(atom) {
            return Value::Symbol(sym);
        }
        Value::String(self.rt.atom_to_string(atom))
    }
}

/// Fetch `(trap, target, handler)`, duplicating the pair for the duration
/// of one trap call. `Ok(None)` means "no trap installed; forward".
fn get_trap(
    ctx: &Context,
    proxy: &GcRef<JsObject>,
    name: &str,
) -> JsResult<Option<Value>> {
    let (target, handler, revoked) = proxy.with_data(|d| match d {
        ObjectData::Proxy(p) => (
            p.target.borrow().clone(),
            p.handler.borrow().clone(),
            p.revoked.get(),
        ),
        _ => (Value::Null, Value::Null, true),
    });
    if revoked {
        return Err(ctx.throw_type_error("proxy has been revoked"));
    }
    let atom = ctx.rt().intern_atom(name);
    let trap = ctx.get_property_value(&handler, atom);
    ctx.rt().release_atom(atom);
    let trap = trap?;
    let _ = target;
    if trap.is_nullish() {
        return Ok(None);
    }
    if !ctx.is_callable(&trap) {
        return Err(ctx.throw_type_error(format!("proxy trap '{name}' is not callable")));
    }
    Ok(Some(trap))
}

fn proxy_parts(ctx: &Context, proxy: &GcRef<JsObject>) -> JsResult<(Value, Value)> {
    let (target, handler, revoked) = proxy.with_data(|d| match d {
        ObjectData::Proxy(p) => (
            p.target.borrow().clone(),
            p.handler.borrow().clone(),
            p.revoked.get(),
        ),
        _ => (Value::Null, Value::Null, true),
    });
    if revoked {
        return Err(ctx.throw_type_error("proxy has been revoked"));
    }
    Ok((target, handler))
}

fn target_object(ctx: &Context, target: &Value) -> JsResult<GcRef<JsObject>> {
    target
        .as_object()
        .cloned()
        .ok_or_else(|| ctx.throw_type_error("proxy target is not an object"))
}

/// Build a JS descriptor object for the `defineProperty` trap argument.
fn descriptor_to_object(ctx: &Context, desc: &PropertyDescriptor) -> JsResult<Value> {
    let obj = ctx.new_plain_object();
    let common = ctx.rt().common_atoms();
    let this = Value::Object(obj.clone());
    if let Some(v) = &desc.value {
        ctx.set_property_value(&this, common.value, v.clone())?;
    }
    if let Some(w) = desc.writable {
        ctx.set_property_value(&this, common.writable, Value::Bool(w))?;
    }
    if let Some(g) = &desc.getter {
        ctx.set_property_value(&this, common.get, g.clone())?;
    }
    if let Some(s) = &desc.setter {
        ctx.set_property_value(&this, common.set, s.clone())?;
    }
    if let Some(e) = desc.enumerable {
        ctx.set_property_value(&this, common.enumerable, Value::Bool(e))?;
    }
    if let Some(c) = desc.configurable {
        ctx.set_property_value(&this, common.configurable, Value::Bool(c))?;
    }
    Ok(this)
}

/// Read a JS descriptor object back into a descriptor record.
fn object_to_descriptor(ctx: &Context, value: &Value) -> JsResult<PropertyDescriptor> {
    let Some(obj) = value.as_object() else {
        return Err(ctx.throw_type_error("property descriptor must be an object"));
    };
    let common = ctx.rt().common_atoms();
    let mut desc = PropertyDescriptor::default();
    for (atom, slot) in [
        (common.value, 0),
        (common.writable, 1),
        (common.get, 2),
        (common.set, 3),
        (common.enumerable, 4),
        (common.configurable, 5),
    ] {
        if ctx.has_property(obj, atom)? {
            let v = ctx.get_property_value(value, atom)?;
            match slot {
                0 => desc.value = Some(v),
                1 => desc.writable = Some(ctx.to_boolean(&v)),
                2 => desc.getter = Some(v),
                3 => desc.setter = Some(v),
                4 => desc.enumerable = Some(ctx.to_boolean(&v)),
                _ => desc.configurable = Some(ctx.to_boolean(&v)),
            }
        }
    }
    Ok(desc)
}

/// The exotic vtable for proxies.
pub struct ProxyExotic;

impl ExoticMethods for ProxyExotic {
    fn get_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        receiver: &Value,
    ) -> JsResult<ExoticResult<Value>> {
        let (target, _) = proxy_parts(ctx, obj)?;
        let Some(trap) = get_trap(ctx, obj, "get")? else {
            return Ok(ExoticResult::Handled(ctx.get_property(
                &target,
                prop,
                receiver,
            )?));
        };
        let key = ctx.atom_to_value(prop);
        let (_, handler) = proxy_parts(ctx, obj)?;
        let result = ctx.call(&trap, &handler, &[target.clone(), key, receiver.clone()])?;
        // Invariant: a frozen data property must come back unchanged; a
        // non-configurable getter-less accessor must come back undefined.
        let tobj = target_object(ctx, &target)?;
        if let Some(own) = ctx.get_own_property(&tobj, prop)? {
            if own.is_frozen_data() {
                if let OwnPropertyKind::Value(v) = &own.kind
                    && !Value::same_value(&result, v)
                {
                    return Err(ctx.throw_type_error(
                        "proxy get must report the same value for a frozen property",
                    ));
                }
            }
            if let OwnPropertyKind::GetSet { getter, .. } = &own.kind
                && !own.flags.has(PropFlags::CONFIGURABLE)
                && getter.is_none()
                && !result.is_undefined()
            {
                return Err(ctx.throw_type_error(
                    "proxy get must report undefined for a getter-less property",
                ));
            }
        }
        Ok(ExoticResult::Handled(result))
    }

    fn set_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        value: Value,
        receiver: &Value,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        let (target, _) = proxy_parts(ctx, obj)?;
        let Some(trap) = get_trap(ctx, obj, "set")? else {
            return Ok(ExoticResult::Handled(ctx.set_property(
                &target,
                prop,
                value,
                receiver,
                throw,
            )?));
        };
        let key = ctx.atom_to_value(prop);
        let (_, handler) = proxy_parts(ctx, obj)?;
        let ok = ctx.call(
            &trap,
            &handler,
            &[target.clone(), key, value.clone(), receiver.clone()],
        )?;
        if !ctx.to_boolean(&ok) {
            if throw {
                return Err(ctx.throw_type_error("proxy set trap returned false"));
            }
            return Ok(ExoticResult::Handled(false));
        }
        let tobj = target_object(ctx, &target)?;
        if let Some(own) = ctx.get_own_property(&tobj, prop)? {
            if own.is_frozen_data()
                && let OwnPropertyKind::Value(v) = &own.kind
                && !Value::same_value(&value, v)
            {
                return Err(ctx.throw_type_error(
                    "proxy set cannot change the value of a frozen property",
                ));
            }
            if let OwnPropertyKind::GetSet { setter, .. } = &own.kind
                && !own.flags.has(PropFlags::CONFIGURABLE)
                && setter.is_none()
            {
                return Err(ctx.throw_type_error(
                    "proxy set cannot succeed on a setter-less property",
                ));
            }
        }
        Ok(ExoticResult::Handled(true))
    }

    fn has_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<bool>> {
        let (target, _) = proxy_parts(ctx, obj)?;
        let Some(trap) = get_trap(ctx, obj, "has")? else {
            let tobj = target_object(ctx, &target)?;
            return Ok(ExoticResult::Handled(ctx.has_property(&tobj, prop)?));
        };
        let key = ctx.atom_to_value(prop);
        let (_, handler) = proxy_parts(ctx, obj)?;
        let found = ctx.call(&trap, &handler, &[target.clone(), key])?;
        let found = ctx.to_boolean(&found);
        if !found {
            let tobj = target_object(ctx, &target)?;
            if let Some(own) = ctx.get_own_property(&tobj, prop)? {
                if !own.flags.has(PropFlags::CONFIGURABLE) {
                    return Err(ctx.throw_type_error(
                        "proxy has cannot hide a non-configurable property",
                    ));
                }
                if !tobj.is_extensible() {
                    return Err(ctx.throw_type_error(
                        "proxy has cannot hide a property of a non-extensible target",
                    ));
                }
            }
        }
        Ok(ExoticResult::Handled(found))
    }

    fn get_own_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<Option<OwnProperty>>> {
        let (target, _) = proxy_parts(ctx, obj)?;
        let tobj = target_object(ctx, &target)?;
        let Some(trap) = get_trap(ctx, obj, "getOwnPropertyDescriptor")? else {
            return Ok(ExoticResult::Handled(ctx.get_own_property(&tobj, prop)?));
        };
        let key = ctx.atom_to_value(prop);
        let (_, handler) = proxy_parts(ctx, obj)?;
        let result = ctx.call(&trap, &handler, &[target.clone(), key])?;
        let target_own = ctx.get_own_property(&tobj, prop)?;
        if result.is_undefined() {
            if let Some(own) = &target_own {
                if !own.flags.has(PropFlags::CONFIGURABLE) {
                    return Err(ctx.throw_type_error(
                        "proxy cannot hide a non-configurable property",
                    ));
                }
                if !tobj.is_extensible() {
                    return Err(ctx.throw_type_error(
                        "proxy cannot hide a property of a non-extensible target",
                    ));
                }
            }
            return Ok(ExoticResult::Handled(None));
        }
        let desc = object_to_descriptor(ctx, &result)?;
        if target_own.is_none() && !tobj.is_extensible() {
            return Err(ctx.throw_type_error(
                "proxy cannot report a new property on a non-extensible target",
            ));
        }
        let configurable = desc.configurable.unwrap_or(false);
        if !configurable {
            let compatible = target_own
                .as_ref()
                .map(|own| !own.flags.has(PropFlags::CONFIGURABLE))
                .unwrap_or(false);
            if !compatible {
                return Err(ctx.throw_type_error(
                    "proxy cannot report a non-configurable property that is configurable",
                ));
            }
        }
        let mut flags = PropFlags::NONE;
        if desc.writable.unwrap_or(false) {
            flags = flags.with(PropFlags::WRITABLE);
        }
        if desc.enumerable.unwrap_or(false) {
            flags = flags.with(PropFlags::ENUMERABLE);
        }
        if configurable {
            flags = flags.with(PropFlags::CONFIGURABLE);
        }
        let kind = if desc.is_accessor_descriptor() {
            OwnPropertyKind::GetSet {
                getter: desc.getter.clone().filter(|g| !g.is_undefined()),
                setter: desc.setter.clone().filter(|s| !s.is_undefined()),
            }
        } else {
            OwnPropertyKind::Value(desc.value.clone().unwrap_or(Value::Undefined))
        };
        if desc.is_accessor_descriptor() {
            flags = flags.with(PropFlags::GETSET);
        }
        Ok(ExoticResult::Handled(Some(OwnProperty { kind, flags })))
    }

    fn define_own_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        desc: &PropertyDescriptor,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        let (target, _) = proxy_parts(ctx, obj)?;
        let tobj = target_object(ctx, &target)?;
        let Some(trap) = get_trap(ctx, obj, "defineProperty")? else {
            return Ok(ExoticResult::Handled(ctx.define_property(
                &tobj, prop, desc, throw,
            )?));
        };
        let key = ctx.atom_to_value(prop);
        let desc_obj = descriptor_to_object(ctx, desc)?;
        let (_, handler) = proxy_parts(ctx, obj)?;
        let ok = ctx.call(&trap, &handler, &[target.clone(), key, desc_obj])?;
        if !ctx.to_boolean(&ok) {
            if throw {
                return Err(ctx.throw_type_error("proxy defineProperty trap returned false"));
            }
            return Ok(ExoticResult::Handled(false));
        }
        let target_own = ctx.get_own_property(&tobj, prop)?;
        if target_own.is_none() && !tobj.is_extensible() {
            return Err(ctx.throw_type_error(
                "proxy cannot add a property to a non-extensible target",
            ));
        }
        if desc.configurable == Some(false) {
            let compatible = target_own
                .as_ref()
                .map(|own| !own.flags.has(PropFlags::CONFIGURABLE))
                .unwrap_or(false);
            if !compatible {
                return Err(ctx.throw_type_error(
                    "proxy cannot define a non-configurable property over a configurable one",
                ));
            }
        }
        Ok(ExoticResult::Handled(true))
    }

    fn delete_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<bool>> {
        let (target, _) = proxy_parts(ctx, obj)?;
        let tobj = target_object(ctx, &target)?;
        let Some(trap) = get_trap(ctx, obj, "deleteProperty")? else {
            return Ok(ExoticResult::Handled(ctx.delete_property(&tobj, prop)?));
        };
        let key = ctx.atom_to_value(prop);
        let (_, handler) = proxy_parts(ctx, obj)?;
        let ok = ctx.call(&trap, &handler, &[target.clone(), key])?;
        if !ctx.to_boolean(&ok) {
            return Ok(ExoticResult::Handled(false));
        }
        if let Some(own) = ctx.get_own_property(&tobj, prop)?
            && !own.flags.has(PropFlags::CONFIGURABLE)
        {
            return Err(ctx.throw_type_error(
                "proxy cannot delete a non-configurable property",
            ));
        }
        Ok(ExoticResult::Handled(true))
    }

    fn own_property_names(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
    ) -> JsResult<ExoticResult<Vec<Atom>>> {
        let (target, _) = proxy_parts(ctx, obj)?;
        let tobj = target_object(ctx, &target)?;
        let Some(trap) = get_trap(ctx, obj, "ownKeys")? else {
            return Ok(ExoticResult::Handled(ctx.get_own_property_names(
                &tobj,
                gpn_flags::STRING | gpn_flags::SYMBOL,
            )?));
        };
        let (_, handler) = proxy_parts(ctx, obj)?;
        let list = ctx.call(&trap, &handler, &[target.clone()])?;
        let Some(list_obj) = list.as_object() else {
            return Err(ctx.throw_type_error("proxy ownKeys must return an object"));
        };
        let len = crate::array::array_length(ctx, list_obj)?;
        let mut atoms: Vec<Atom> = Vec::with_capacity(len as usize);
        for i in 0..len {
            let v = ctx.get_property_value(&list, Atom::from_index(i))?;
            if !matches!(v, Value::String(_) | Value::Symbol(_)) {
                ctx.release_atoms(&atoms);
                return Err(ctx.throw_type_error(
                    "proxy ownKeys must return strings and symbols",
                ));
            }
            let atom = ctx.to_property_key(&v)?;
            if atoms.contains(&atom) {
                ctx.rt().release_atom(atom);
                ctx.release_atoms(&atoms);
                return Err(ctx.throw_type_error("proxy ownKeys reported a duplicate key"));
            }
            atoms.push(atom);
        }
        // Every non-configurable own key of the target must be present;
        // a non-extensible target must be covered exactly.
        let target_keys =
            ctx.get_own_property_names(&tobj, gpn_flags::STRING | gpn_flags::SYMBOL)?;
        let extensible = tobj.is_extensible();
        let mut missing: Option<Atom> = None;
        let mut extra_count = atoms.len();
        for tk in &target_keys {
            let present = atoms.contains(tk);
            if present {
                extra_count -= 1;
            }
            if !present {
                let own = ctx.get_own_property(&tobj, *tk)?;
                let non_configurable = own
                    .map(|o| !o.flags.has(PropFlags::CONFIGURABLE))
                    .unwrap_or(false);
                if non_configurable || !extensible {
                    missing = Some(*tk);
                    break;
                }
            }
        }
        let invariant_broken = missing.is_some() || (!extensible && extra_count > 0);
        ctx.release_atoms(&target_keys);
        if invariant_broken {
            ctx.release_atoms(&atoms);
            return Err(ctx.throw_type_error(
                "proxy ownKeys does not match the target's own keys",
            ));
        }
        Ok(ExoticResult::Handled(atoms))
    }
}

/// `[[Call]]`/`[[Construct]]` through the `apply`/`construct` traps.
pub(crate) fn proxy_call(
    ctx: &Context,
    proxy: &GcRef<JsObject>,
    this: &Value,
    args: &[Value],
    flags: CallFlags,
) -> JsResult<Value> {
    let (target, _) = proxy_parts(ctx, proxy)?;
    let trap_name = if flags.constructor { "construct" } else { "apply" };
    let Some(trap) = get_trap(ctx, proxy, trap_name)? else {
        return ctx.call_flags(&target, this, args, flags);
    };
    let args_array = Value::Object(ctx.new_array_from(args.to_vec()));
    let (_, handler) = proxy_parts(ctx, proxy)?;
    if flags.constructor {
        let result = ctx.call(
            &trap,
            &handler,
            &[target.clone(), args_array, target.clone()],
        )?;
        if !result.is_object() {
            return Err(ctx.throw_type_error("proxy construct trap must return an object"));
        }
        Ok(result)
    } else {
        ctx.call(&trap, &handler, &[target.clone(), this.clone(), args_array])
    }
}

/// `[[GetPrototypeOf]]` through the trap.
pub(crate) fn proxy_get_prototype(ctx: &Context, proxy: &GcRef<JsObject>) -> JsResult<Value> {
    let (target, _) = proxy_parts(ctx, proxy)?;
    let tobj = target_object(ctx, &target)?;
    let Some(trap) = get_trap(ctx, proxy, "getPrototypeOf")? else {
        return ctx.get_prototype(&tobj);
    };
    let (_, handler) = proxy_parts(ctx, proxy)?;
    let proto = ctx.call(&trap, &handler, &[target.clone()])?;
    if !proto.is_object() && !proto.is_null() {
        return Err(ctx.throw_type_error("getPrototypeOf trap must return an object or null"));
    }
    if !tobj.is_extensible() {
        let real = ctx.get_prototype(&tobj)?;
        if !Value::same_value(&proto, &real) {
            return Err(ctx.throw_type_error(
                "proxy cannot report a different prototype for a non-extensible target",
            ));
        }
    }
    Ok(proto)
}

/// `[[SetPrototypeOf]]` through the trap.
pub(crate) fn proxy_set_prototype(
    ctx: &Context,
    proxy: &GcRef<JsObject>,
    proto: &Value,
    throw: bool,
) -> JsResult<bool> {
    let (target, _) = proxy_parts(ctx, proxy)?;
    let tobj = target_object(ctx, &target)?;
    let Some(trap) = get_trap(ctx, proxy, "setPrototypeOf")? else {
        return ctx.set_prototype(&tobj, proto, throw);
    };
    let (_, handler) = proxy_parts(ctx, proxy)?;
    let ok = ctx.call(&trap, &handler, &[target.clone(), proto.clone()])?;
    if !ctx.to_boolean(&ok) {
        if throw {
            return Err(ctx.throw_type_error("proxy setPrototypeOf trap returned false"));
        }
        return Ok(false);
    }
    if !tobj.is_extensible() {
        let real = ctx.get_prototype(&tobj)?;
        if !Value::same_value(proto, &real) {
            return Err(ctx.throw_type_error(
                "proxy cannot change the prototype of a non-extensible target",
            ));
        }
    }
    Ok(true)
}

/// `[[IsExtensible]]` through the trap.
pub(crate) fn proxy_is_extensible(ctx: &Context, proxy: &GcRef<JsObject>) -> JsResult<bool> {
    let (target, _) = proxy_parts(ctx, proxy)?;
    let tobj = target_object(ctx, &target)?;
    let Some(trap) = get_trap(ctx, proxy, "isExtensible")? else {
        return ctx.is_extensible(&tobj);
    };
    let (_, handler) = proxy_parts(ctx, proxy)?;
    let claimed = ctx.call(&trap, &handler, &[target.clone()])?;
    let claimed = ctx.to_boolean(&claimed);
    if claimed != ctx.is_extensible(&tobj)? {
        return Err(ctx.throw_type_error(
            "proxy isExtensible must agree with its target",
        ));
    }
    Ok(claimed)
}

/// `[[PreventExtensions]]` through the trap.
pub(crate) fn proxy_prevent_extensions(ctx: &Context, proxy: &GcRef<JsObject>) -> JsResult<bool> {
    let (target, _) = proxy_parts(ctx, proxy)?;
    let tobj = target_object(ctx, &target)?;
    let Some(trap) = get_trap(ctx, proxy, "preventExtensions")? else {
        return ctx.prevent_extensions(&tobj);
    };
    let (_, handler) = proxy_parts(ctx, proxy)?;
    let ok = ctx.call(&trap, &handler, &[target.clone()])?;
    if ctx.to_boolean(&ok) && ctx.is_extensible(&tobj)? {
        return Err(ctx.throw_type_error(
            "proxy preventExtensions reported success on an extensible target",
        ));
    }
    Ok(ctx.to_boolean(&ok))
}
