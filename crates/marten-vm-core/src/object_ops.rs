//! Property operations
//!
//! The fundamental object operations: lookup along the prototype chain,
//! the three-valued set, `OrdinaryDefineOwnProperty` with its
//! compatibility rules, deletion with shape compaction, name listing, and
//! prototype mutation with cycle detection. Exotic classes (Array length,
//! typed arrays, module namespaces, proxies) intercept through the class
//! vtable before the ordinary algorithm runs.
//!
//! Atom ownership: APIs borrow atoms from the caller; any structure that
//! stores an atom takes its own reference. Name listings are the one
//! exception: they return owned references the caller releases.

use marten_vm_gc::{GcKind, GcRef};

use crate::atom::Atom;
use crate::class::{ExoticResult, OwnProperty, OwnPropertyKind, PropertyDescriptor};
use crate::context::Context;
use crate::error::JsResult;
use crate::object::{
    AutoInitKind, ClassId, JsObject, ObjectData, Property, class_ids, obj_flags,
};
use crate::shape::{PropFlags, Shape};
use crate::value::Value;

/// Name-listing filter bits (`get_own_property_names`).
pub mod gpn_flags {
    /// Include string (and array-index) keys
    pub const STRING: u32 = 1 << 0;
    /// Include symbol keys
    pub const SYMBOL: u32 = 1 << 1;
    /// Include private names
    pub const PRIVATE: u32 = 1 << 2;
    /// Only enumerable properties
    pub const ENUM_ONLY: u32 = 1 << 3;
}

/// A snapshot of one property slot, detached from the object's interior
/// mutability so user code can run while it is held.
#[derive(Clone)]
pub(crate) enum SlotCopy {
    Value(Value),
    GetSet {
        getter: Option<GcRef<JsObject>>,
        setter: Option<GcRef<JsObject>>,
    },
    VarRef(GcRef<crate::frame::VarRef>),
    AutoInit {
        realm: GcRef<crate::context::Realm>,
        kind: AutoInitKind,
    },
    Deleted,
}

impl Context {
    /// Exotic vtable of an object's class, fetched without holding the
    /// registry borrow across user code.
    pub(crate) fn exotic_of(
        &self,
        obj: &GcRef<JsObject>,
    ) -> Option<std::rc::Rc<dyn crate::class::ExoticMethods>> {
        if !obj.has_flag(obj_flags::EXOTIC) {
            return None;
        }
        let exotic = self.rt.inner.classes.borrow().exotic_of(obj.class_id());
        exotic
    }

    // =====================================================================
    // creation
    // =====================================================================

    /// Allocate an object with an explicit prototype, class and payload.
    pub fn new_object_full(
        &self,
        class_id: ClassId,
        proto: Option<GcRef<JsObject>>,
        data: ObjectData,
    ) -> GcRef<JsObject> {
        self.rt.maybe_gc();
        let shape = self.rt.initial_shape(proto);
        let obj = self
            .rt
            .heap()
            .alloc(GcKind::Object, JsObject::new(class_id, shape, data));
        let has_exotic = self.rt.inner.classes.borrow().exotic_of(class_id).is_some();
        if has_exotic {
            obj.set_flag(obj_flags::EXOTIC, true);
        }
        obj
    }

    /// Allocate an object whose prototype is the realm's class prototype.
    pub fn new_object_class(&self, class_id: ClassId, data: ObjectData) -> GcRef<JsObject> {
        let proto = self.realm.class_proto(class_id);
        let proto = proto.as_object().cloned();
        self.new_object_full(class_id, proto, data)
    }

    /// `{}` with `Object.prototype`.
    pub fn new_plain_object(&self) -> GcRef<JsObject> {
        let proto = self.realm.class_proto(class_ids::OBJECT);
        self.new_object_full(class_ids::OBJECT, proto.as_object().cloned(), ObjectData::Ordinary)
    }

    /// A fast array of the given elements. The `length` property is always
    /// the object's first shape entry.
    pub fn new_array_from(&self, elements: Vec<Value>) -> GcRef<JsObject> {
        let proto = self.realm.class_proto(class_ids::ARRAY);
        let len = elements.len();
        let obj = self.new_object_full(
            class_ids::ARRAY,
            proto.as_object().cloned(),
            ObjectData::Array(elements),
        );
        obj.set_flag(obj_flags::FAST_ARRAY, true);
        let common = self.rt.common_atoms();
        self.define_own_property_raw(
            &obj,
            common.length,
            Property::Value(Value::number(len as f64)),
            PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::LENGTH),
        );
        obj
    }

    /// `[]`
    pub fn new_array(&self) -> GcRef<JsObject> {
        self.new_array_from(Vec::new())
    }

    // =====================================================================
    // shape bookkeeping
    // =====================================================================

    /// Make the object's shape privately mutable: clone when shared,
    /// unhash when this object is the sole owner.
    pub(crate) fn prepare_shape_update(&self, obj: &GcRef<JsObject>) {
        let shape = obj.shape();
        if !shape.is_hashed() {
            return;
        }
        // The object itself plus our local handle account for two refs.
        if shape.ref_count() > 2 {
            let clone = self.rt.clone_shape_for_update(&shape);
            obj.set_shape(clone);
        } else {
            self.rt.unhash_shape(&shape);
        }
    }

    /// Append `(atom, flags, slot)`; shares an interned shape transition
    /// when one exists.
    pub(crate) fn add_own_property(
        &self,
        obj: &GcRef<JsObject>,
        atom: Atom,
        flags: PropFlags,
        slot: Property,
    ) -> usize {
        let shape = obj.shape();
        if shape.is_hashed() {
            let child = self.rt.shape_transition(&shape, atom, flags);
            obj.set_shape(child);
            obj.push_prop(slot);
            obj.prop_len() - 1
        } else {
            self.rt.dup_atom(atom);
            let idx = shape.add_prop(atom, flags);
            obj.push_prop(slot);
            idx
        }
    }

    /// Unchecked define used by intrinsics building and internal slots:
    /// replaces an existing own property or appends a new one.
    pub fn define_own_property_raw(
        &self,
        obj: &GcRef<JsObject>,
        atom: Atom,
        slot: Property,
        flags: PropFlags,
    ) {
        let shape = obj.shape();
        if let Some(idx) = shape.find(atom) {
            if shape.prop(idx).flags != flags {
                self.prepare_shape_update(obj);
                obj.shape().set_prop_flags(idx, flags);
            }
            obj.set_prop(idx, slot);
        } else {
            self.add_own_property(obj, atom, flags, slot);
        }
    }

    pub(crate) fn read_slot(&self, obj: &GcRef<JsObject>, idx: usize) -> SlotCopy {
        obj.with_prop(idx, |p| match p {
            Property::Value(v) => SlotCopy::Value(v.clone()),
            Property::GetSet { getter, setter } => SlotCopy::GetSet {
                getter: getter.clone(),
                setter: setter.clone(),
            },
            Property::VarRef(r) => SlotCopy::VarRef(r.clone()),
            Property::AutoInit { realm, kind } => SlotCopy::AutoInit {
                realm: realm.clone(),
                kind: kind.clone(),
            },
            Property::Deleted => SlotCopy::Deleted,
        })
    }

    /// Replace an auto-init slot with its materialized value.
    fn materialize_autoinit(
        &self,
        obj: &GcRef<JsObject>,
        idx: usize,
        realm: GcRef<crate::context::Realm>,
        kind: AutoInitKind,
    ) -> JsResult<Value> {
        let value = match kind {
            AutoInitKind::ModuleNs(module) => {
                let ctx = Context::from_parts(self.rt.clone(), realm);
                let ns = crate::module::get_module_namespace(&ctx, &module)?;
                Value::Object(ns)
            }
        };
        self.prepare_shape_update(obj);
        let shape = obj.shape();
        let flags = shape.prop(idx).flags.without(PropFlags::AUTOINIT);
        shape.set_prop_flags(idx, flags);
        obj.set_prop(idx, Property::Value(value.clone()));
        Ok(value)
    }

    // =====================================================================
    // get
    // =====================================================================

    /// `[[GetOwnProperty]]` with exotic dispatch.
    pub fn get_own_property(
        &self,
        obj: &GcRef<JsObject>,
        atom: Atom,
    ) -> JsResult<Option<OwnProperty>> {
        if let Some(exotic) = self.exotic_of(obj)
            && let ExoticResult::Handled(r) = exotic.get_own_property(self, obj, atom)?
        {
            return Ok(r);
        }
        self.ordinary_get_own_property(obj, atom)
    }

    /// The ordinary (shape/fast-array) own-property read, without exotic
    /// dispatch. Proxy invariant checks use this on targets.
    pub fn ordinary_get_own_property(
        &self,
        obj: &GcRef<JsObject>,
        atom: Atom,
    ) -> JsResult<Option<OwnProperty>> {
        if obj.is_fast_array()
            && let Some(idx) = atom.as_index()
        {
            let elem = obj.with_data(|data| match data {
                ObjectData::Array(values) => values.get(idx as usize).cloned(),
                _ => None,
            });
            if let Some(v) = elem {
                return Ok(Some(OwnProperty {
                    kind: OwnPropertyKind::Value(v),
                    flags: PropFlags::cwe(),
                }));
            }
        }
        let shape = obj.shape();
        let Some(idx) = shape.find(atom) else {
            return Ok(None);
        };
        let flags = shape.prop(idx).flags;
        let kind = match self.read_slot(obj, idx) {
            SlotCopy::Value(v) => OwnPropertyKind::Value(v),
            SlotCopy::GetSet { getter, setter } => OwnPropertyKind::GetSet {
                getter: getter.map(Value::Object),
                setter: setter.map(Value::Object),
            },
            SlotCopy::VarRef(r) => {
                let v = self.var_ref_value(&r)?;
                if v.is_uninitialized() {
                    return Err(self.throw_reference_error("binding is not initialized"));
                }
                OwnPropertyKind::Value(v)
            }
            SlotCopy::AutoInit { realm, kind } => {
                OwnPropertyKind::Value(self.materialize_autoinit(obj, idx, realm, kind)?)
            }
            SlotCopy::Deleted => return Ok(None),
        };
        Ok(Some(OwnProperty { kind, flags }))
    }

    /// `[[Get]]` with `receiver` for accessor dispatch.
    pub fn get_property(&self, obj: &Value, atom: Atom, receiver: &Value) -> JsResult<Value> {
        match obj {
            Value::Object(start) => self.get_property_chain(start.clone(), atom, receiver),
            Value::Undefined | Value::Null => Err(self.throw_type_error(format!(
                "cannot read property '{}' of {}",
                self.rt.atom_to_string(atom),
                if obj.is_null() { "null" } else { "undefined" }
            ))),
            Value::String(s) => {
                // String primitives answer length/index directly, then
                // fall through to the wrapper prototype.
                let common = self.rt.common_atoms();
                if atom == common.length {
                    return Ok(Value::number(s.len() as f64));
                }
                if let Some(idx) = atom.as_index()
                    && let Some(unit) = s.code_unit_at(idx as usize)
                {
                    return Ok(Value::String(crate::string::JsString::from_utf16(&[unit])));
                }
                self.get_from_primitive_proto(class_ids::STRING, atom, receiver)
            }
            Value::Int(_) | Value::Float(_) => {
                self.get_from_primitive_proto(class_ids::NUMBER, atom, receiver)
            }
            Value::Bool(_) => self.get_from_primitive_proto(class_ids::BOOLEAN, atom, receiver),
            Value::Symbol(_) => self.get_from_primitive_proto(class_ids::SYMBOL, atom, receiver),
            _ => Ok(Value::Undefined),
        }
    }

    /// Convenience `[[Get]]` with the base as receiver.
    pub fn get_property_value(&self, obj: &Value, atom: Atom) -> JsResult<Value> {
        self.get_property(obj, atom, obj)
    }

    fn get_from_primitive_proto(
        &self,
        class_id: ClassId,
        atom: Atom,
        receiver: &Value,
    ) -> JsResult<Value> {
        match self.realm.class_proto(class_id) {
            Value::Object(proto) => self.get_property_chain(proto, atom, receiver),
            _ => Ok(Value::Undefined),
        }
    }

    fn get_property_chain(
        &self,
        start: GcRef<JsObject>,
        atom: Atom,
        receiver: &Value,
    ) -> JsResult<Value> {
        let mut cur = start;
        loop {
            // Keep the link alive across user traps: `cur` is a strong
            // handle for the duration of one hop.
            if let Some(exotic) = self.exotic_of(&cur)
                && let ExoticResult::Handled(v) = exotic.get_property(self, &cur, atom, receiver)?
            {
                return Ok(v);
            }
            if cur.is_fast_array()
                && let Some(idx) = atom.as_index()
            {
                let elem = cur.with_data(|data| match data {
                    ObjectData::Array(values) => values.get(idx as usize).cloned(),
                    _ => None,
                });
                if let Some(v) = elem {
                    return Ok(v);
                }
            }
            let shape = cur.shape();
            if let Some(idx) = shape.find(atom) {
                match self.read_slot(&cur, idx) {
                    SlotCopy::Value(v) => return Ok(v),
                    SlotCopy::GetSet { getter, .. } => {
                        return match getter {
                            Some(g) => self.call(&Value::Object(g), receiver, &[]),
                            None => Ok(Value::Undefined),
                        };
                    }
                    SlotCopy::VarRef(r) => {
                        let v = self.var_ref_value(&r)?;
                        if v.is_uninitialized() {
                            return Err(
                                self.throw_reference_error("binding is not initialized")
                            );
                        }
                        return Ok(v);
                    }
                    SlotCopy::AutoInit { realm, kind } => {
                        return self.materialize_autoinit(&cur, idx, realm, kind);
                    }
                    SlotCopy::Deleted => {}
                }
            }
            match shape.proto() {
                Some(proto) => cur = proto,
                None => return Ok(Value::Undefined),
            }
        }
    }

    // =====================================================================
    // set
    // =====================================================================

    /// `[[Set]]`: `Ok(true)` success, `Ok(false)` quiet rejection,
    /// `Err` with a pending exception (always when `throw` is set).
    pub fn set_property(
        &self,
        obj: &Value,
        atom: Atom,
        value: Value,
        receiver: &Value,
        throw: bool,
    ) -> JsResult<bool> {
        let Value::Object(start) = obj else {
            if obj.is_nullish() {
                return Err(self.throw_type_error(format!(
                    "cannot set property '{}' of {}",
                    self.rt.atom_to_string(atom),
                    if obj.is_null() { "null" } else { "undefined" }
                )));
            }
            // Primitive bases never store; strict mode throws.
            return self.reject_set(throw, atom, "primitive value");
        };
        let mut cur = start.clone();
        loop {
            if let Some(exotic) = self.exotic_of(&cur)
                && let ExoticResult::Handled(ok) =
                    exotic.set_property(self, &cur, atom, value.clone(), receiver, throw)?
            {
                return Ok(ok);
            }
            if cur.is_fast_array()
                && let Some(idx) = atom.as_index()
                && GcRef::ptr_eq(&cur, start)
                && matches!(receiver, Value::Object(r) if GcRef::ptr_eq(r, start))
            {
                match self.fast_array_set(&cur, idx, &value)? {
                    FastSet::Done => return Ok(true),
                    FastSet::NotCovered => {}
                }
            }
            let shape = cur.shape();
            if let Some(idx) = shape.find(atom) {
                let flags = shape.prop(idx).flags;
                match self.read_slot(&cur, idx) {
                    SlotCopy::GetSet { setter, .. } => {
                        return match setter {
                            Some(s) => {
                                self.call(&Value::Object(s), receiver, &[value])?;
                                Ok(true)
                            }
                            None => self.reject_set(throw, atom, "getter-only property"),
                        };
                    }
                    SlotCopy::VarRef(r) => {
                        if !flags.has(PropFlags::WRITABLE) {
                            return self.reject_set(throw, atom, "read-only binding");
                        }
                        self.var_ref_set(&r, value);
                        return Ok(true);
                    }
                    SlotCopy::AutoInit { realm, kind } => {
                        self.materialize_autoinit(&cur, idx, realm, kind)?;
                        continue;
                    }
                    SlotCopy::Value(_) | SlotCopy::Deleted => {
                        if flags.has(PropFlags::LENGTH) && cur.class_id() == class_ids::ARRAY {
                            if GcRef::ptr_eq(&cur, start)
                                && matches!(receiver, Value::Object(r) if GcRef::ptr_eq(r, start))
                            {
                                return crate::array::set_array_length(self, &cur, value, throw);
                            }
                            // `length` found on an Array further up the
                            // chain: ordinary receiver-create semantics.
                            return self.create_data_on_receiver(receiver, atom, value, throw);
                        }
                        if !flags.has(PropFlags::WRITABLE) {
                            return self.reject_set(throw, atom, "read-only property");
                        }
                        if GcRef::ptr_eq(&cur, start)
                            && matches!(receiver, Value::Object(r) if GcRef::ptr_eq(r, start))
                        {
                            cur.set_prop(idx, Property::Value(value));
                            return Ok(true);
                        }
                        // Writable data on the chain (or a foreign
                        // receiver): define on the receiver.
                        return self.create_data_on_receiver(receiver, atom, value, throw);
                    }
                }
            }
            match shape.proto() {
                Some(proto) => cur = proto,
                None => break,
            }
        }
        self.create_data_on_receiver(receiver, atom, value, throw)
    }

    /// Convenience `[[Set]]` with the base as receiver, non-throwing.
    pub fn set_property_value(&self, obj: &Value, atom: Atom, value: Value) -> JsResult<bool> {
        self.set_property(obj, atom, value, obj, false)
    }

    fn reject_set(&self, throw: bool, atom: Atom, why: &str) -> JsResult<bool> {
        if throw {
            Err(self.throw_type_error(format!(
                "cannot write property '{}': {}",
                self.rt.atom_to_string(atom),
                why
            )))
        } else {
            Ok(false)
        }
    }

    fn create_data_on_receiver(
        &self,
        receiver: &Value,
        atom: Atom,
        value: Value,
        throw: bool,
    ) -> JsResult<bool> {
        let Value::Object(robj) = receiver else {
            return self.reject_set(throw, atom, "primitive receiver");
        };
        // The receiver may already own the property (chain walk started
        // above it).
        if let Some(own) = self.get_own_property(robj, atom)? {
            match own.kind {
                OwnPropertyKind::GetSet { .. } => {
                    return self.reject_set(throw, atom, "getter-only property");
                }
                OwnPropertyKind::Value(_) => {
                    if !own.flags.has(PropFlags::WRITABLE) {
                        return self.reject_set(throw, atom, "read-only property");
                    }
                    let desc = PropertyDescriptor {
                        value: Some(value),
                        ..Default::default()
                    };
                    return self.define_property(robj, atom, &desc, throw);
                }
            }
        }
        if !robj.is_extensible() {
            return self.reject_set(throw, atom, "object is not extensible");
        }
        let desc = PropertyDescriptor::data_cwe(value);
        self.define_property(robj, atom, &desc, throw)
    }

    fn fast_array_set(&self, obj: &GcRef<JsObject>, idx: u32, value: &Value) -> JsResult<FastSet> {
        let idx = idx as usize;
        let outcome = obj.with_data_mut(|data| match data {
            ObjectData::Array(values) => {
                if idx < values.len() {
                    values[idx] = value.clone();
                    FastSet::Done
                } else if idx == values.len() && obj.is_extensible() {
                    values.push(value.clone());
                    FastSet::Done
                } else {
                    FastSet::NotCovered
                }
            }
            _ => FastSet::NotCovered,
        });
        if matches!(outcome, FastSet::Done) {
            crate::array::sync_fast_length(self, obj);
        }
        Ok(outcome)
    }

    // =====================================================================
    // define
    // =====================================================================

    /// `OrdinaryDefineOwnProperty` plus the exotic hook and the Array
    /// special cases.
    pub fn define_property(
        &self,
        obj: &GcRef<JsObject>,
        atom: Atom,
        desc: &PropertyDescriptor,
        throw: bool,
    ) -> JsResult<bool> {
        if let Some(exotic) = self.exotic_of(obj)
            && let ExoticResult::Handled(ok) =
                exotic.define_own_property(self, obj, atom, desc, throw)?
        {
            return Ok(ok);
        }
        if obj.class_id() == class_ids::ARRAY {
            let common = self.rt.common_atoms();
            if atom == common.length
                && let Some(v) = &desc.value
            {
                if desc.is_accessor_descriptor() {
                    return self.reject_define(throw, atom, "length must stay a data property");
                }
                let ok = crate::array::set_array_length(self, obj, v.clone(), throw)?;
                if let Some(false) = desc.writable
                    && ok
                {
                    self.freeze_length(obj);
                }
                return Ok(ok);
            }
            if obj.is_fast_array()
                && let Some(idx) = atom.as_index()
            {
                // Plain dense definitions keep the fast path; anything
                // else degrades the array first.
                let plain_dense = desc.is_data_descriptor()
                    && !desc.is_accessor_descriptor()
                    && desc.writable != Some(false)
                    && desc.enumerable != Some(false)
                    && desc.configurable != Some(false);
                let count = crate::array::fast_len(obj);
                if plain_dense && (idx as usize) <= count {
                    if let Some(v) = &desc.value {
                        let covered = self.fast_array_set(obj, idx, v)?;
                        if matches!(covered, FastSet::Done) {
                            return Ok(true);
                        }
                    } else if (idx as usize) < count {
                        return Ok(true);
                    }
                }
                crate::array::convert_fast_array_to_array(self, obj);
            }
        }
        let ok = self.ordinary_define_own_property(obj, atom, desc, throw)?;
        // Defining an element at or past the current length grows it.
        if ok
            && obj.class_id() == class_ids::ARRAY
            && let Some(idx) = atom.as_index()
        {
            let len = crate::array::array_length(self, obj)?;
            if idx >= len {
                crate::array::write_length_slot(self, obj, idx + 1);
            }
        }
        Ok(ok)
    }

    fn freeze_length(&self, obj: &GcRef<JsObject>) {
        let shape = obj.shape();
        if let Some(idx) = shape.find(self.rt.common_atoms().length) {
            self.prepare_shape_update(obj);
            let shape = obj.shape();
            let flags = shape.prop(idx).flags.without(PropFlags::WRITABLE);
            shape.set_prop_flags(idx, flags);
        }
    }

    /// The ordinary definition algorithm, shared by proxies (on targets)
    /// and the generic path.
    pub fn ordinary_define_own_property(
        &self,
        obj: &GcRef<JsObject>,
        atom: Atom,
        desc: &PropertyDescriptor,
        throw: bool,
    ) -> JsResult<bool> {
        let current = self.ordinary_get_own_property(obj, atom)?;
        let Some(current) = current else {
            if !obj.is_extensible() {
                return self.reject_define(throw, atom, "object is not extensible");
            }
            let (slot, flags) = self.slot_from_descriptor(desc, None);
            let slot = slot.unwrap_or(Property::Value(Value::Undefined));
            self.add_own_property(obj, atom, flags, slot);
            return Ok(true);
        };

        // Validate compatibility against the current property.
        if !current.flags.has(PropFlags::CONFIGURABLE) {
            if desc.configurable == Some(true) {
                return self.reject_define(throw, atom, "property is not configurable");
            }
            if let Some(e) = desc.enumerable
                && e != current.flags.has(PropFlags::ENUMERABLE)
            {
                return self.reject_define(throw, atom, "property is not configurable");
            }
            match (&current.kind, desc.is_accessor_descriptor(), desc.is_data_descriptor()) {
                (OwnPropertyKind::Value(_), true, _) => {
                    return self.reject_define(throw, atom, "cannot convert data to accessor");
                }
                (OwnPropertyKind::GetSet { .. }, _, true) => {
                    return self.reject_define(throw, atom, "cannot convert accessor to data");
                }
                (OwnPropertyKind::Value(cur_v), _, _) => {
                    if !current.flags.has(PropFlags::WRITABLE) {
                        if desc.writable == Some(true) {
                            return self.reject_define(throw, atom, "property is not writable");
                        }
                        if let Some(v) = &desc.value
                            && !Value::same_value(v, cur_v)
                        {
                            return self.reject_define(throw, atom, "property is not writable");
                        }
                    }
                }
                (OwnPropertyKind::GetSet { getter, setter }, _, _) => {
                    if let Some(g) = &desc.getter {
                        let cur_g = getter.clone().unwrap_or(Value::Undefined);
                        if !Value::same_value(g, &cur_g) {
                            return self.reject_define(throw, atom, "property is not configurable");
                        }
                    }
                    if let Some(s) = &desc.setter {
                        let cur_s = setter.clone().unwrap_or(Value::Undefined);
                        if !Value::same_value(s, &cur_s) {
                            return self.reject_define(throw, atom, "property is not configurable");
                        }
                    }
                }
            }
        }

        // Apply. A flags change needs a privately mutable shape; a pure
        // value update leaves the (possibly shared) shape alone.
        let shape = obj.shape();
        let Some(idx) = shape.find(atom) else {
            // Property vanished during a trap: re-add.
            let (slot, flags) = self.slot_from_descriptor(desc, None);
            let slot = slot.unwrap_or(Property::Value(Value::Undefined));
            self.add_own_property(obj, atom, flags, slot);
            return Ok(true);
        };
        let (slot, flags) = self.slot_from_descriptor(desc, Some(&current));
        let flags = if shape.prop(idx).flags.has(PropFlags::LENGTH) {
            flags.with(PropFlags::LENGTH)
        } else {
            flags
        };
        if shape.prop(idx).flags != flags {
            self.prepare_shape_update(obj);
            let shape = obj.shape();
            let idx = shape.find(atom).expect("property present after prepare");
            shape.set_prop_flags(idx, flags);
            if let Some(slot) = slot {
                obj.set_prop(idx, slot);
            }
        } else if let Some(slot) = slot {
            obj.set_prop(idx, slot);
        }
        Ok(true)
    }

    /// Build the slot and flags a descriptor defines, merging with the
    /// current property for partial descriptors.
    fn slot_from_descriptor(
        &self,
        desc: &PropertyDescriptor,
        current: Option<&OwnProperty>,
    ) -> SlotAndFlags {
        let merged_attr = |bit: u16, explicit: Option<bool>| -> bool {
            match explicit {
                Some(b) => b,
                None => current.map(|c| c.flags.has(bit)).unwrap_or(false),
            }
        };
        let enumerable = merged_attr(PropFlags::ENUMERABLE, desc.enumerable);
        let configurable = merged_attr(PropFlags::CONFIGURABLE, desc.configurable);
        if desc.is_accessor_descriptor() {
            let value_to_obj = |v: &Option<Value>| -> Option<GcRef<JsObject>> {
                v.as_ref().and_then(|v| v.as_object().cloned())
            };
            let (cur_get, cur_set) = match current.map(|c| &c.kind) {
                Some(OwnPropertyKind::GetSet { getter, setter }) => {
                    (value_to_obj(&getter.clone()), value_to_obj(&setter.clone()))
                }
                _ => (None, None),
            };
            let getter = match &desc.getter {
                Some(v) => v.as_object().cloned(),
                None => cur_get,
            };
            let setter = match &desc.setter {
                Some(v) => v.as_object().cloned(),
                None => cur_set,
            };
            let mut flags = PropFlags::from_bits(PropFlags::GETSET);
            if enumerable {
                flags = flags.with(PropFlags::ENUMERABLE);
            }
            if configurable {
                flags = flags.with(PropFlags::CONFIGURABLE);
            }
            return (Some(Property::GetSet { getter, setter }), flags);
        }
        let writable = merged_attr(PropFlags::WRITABLE, desc.writable);
        let mut flags = PropFlags::NONE;
        if writable {
            flags = flags.with(PropFlags::WRITABLE);
        }
        if enumerable {
            flags = flags.with(PropFlags::ENUMERABLE);
        }
        if configurable {
            flags = flags.with(PropFlags::CONFIGURABLE);
        }
        let slot = match &desc.value {
            Some(v) => Some(Property::Value(v.clone())),
            None => match current.map(|c| &c.kind) {
                Some(OwnPropertyKind::GetSet { .. }) | None => {
                    Some(Property::Value(Value::Undefined))
                }
                Some(OwnPropertyKind::Value(_)) => None, // keep the slot
            },
        };
        (slot, flags)
    }

    fn reject_define(&self, throw: bool, atom: Atom, why: &str) -> JsResult<bool> {
        if throw {
            Err(self.throw_type_error(format!(
                "cannot define property '{}': {}",
                self.rt.atom_to_string(atom),
                why
            )))
        } else {
            Ok(false)
        }
    }

    // =====================================================================
    // delete / has
    // =====================================================================

    /// `[[Delete]]`.
    pub fn delete_property(&self, obj: &GcRef<JsObject>, atom: Atom) -> JsResult<bool> {
        if let Some(exotic) = self.exotic_of(obj)
            && let ExoticResult::Handled(ok) = exotic.delete_property(self, obj, atom)?
        {
            return Ok(ok);
        }
        if obj.is_fast_array()
            && let Some(idx) = atom.as_index()
        {
            let dense = crate::array::fast_len(obj);
            if (idx as usize) >= dense {
                return Ok(true);
            }
            if (idx as usize) == dense - 1 {
                // Dropping the last dense element; `length` is untouched
                // (delete never shrinks it).
                obj.with_data_mut(|data| {
                    if let ObjectData::Array(values) = data {
                        values.pop();
                    }
                });
                return Ok(true);
            }
            // Deleting an interior element leaves a hole: degrade.
            crate::array::convert_fast_array_to_array(self, obj);
        }
        let shape = obj.shape();
        let Some(idx) = shape.find(atom) else {
            return Ok(true);
        };
        if !shape.prop(idx).flags.has(PropFlags::CONFIGURABLE) {
            return Ok(false);
        }
        self.prepare_shape_update(obj);
        let shape = obj.shape();
        let idx = shape.find(atom).expect("property present after prepare");
        let released = shape.prop(idx).atom;
        shape.del_prop(idx);
        obj.set_prop(idx, Property::Deleted);
        self.rt.release_atom(released);
        if shape.needs_compact() {
            let mapping = shape.compact();
            let mut new_props = Vec::with_capacity(shape.prop_count());
            for (old, new) in mapping.iter().enumerate() {
                if new.is_some() {
                    new_props.push(obj.with_prop(old, |p| p.clone()));
                }
            }
            obj.replace_props(new_props);
        }
        Ok(true)
    }

    /// `[[HasProperty]]` along the chain.
    pub fn has_property(&self, obj: &GcRef<JsObject>, atom: Atom) -> JsResult<bool> {
        let mut cur = obj.clone();
        loop {
            if let Some(exotic) = self.exotic_of(&cur)
                && let ExoticResult::Handled(found) = exotic.has_property(self, &cur, atom)?
            {
                return Ok(found);
            }
            if cur.is_fast_array()
                && let Some(idx) = atom.as_index()
                && (idx as usize) < crate::array::fast_len(&cur)
            {
                return Ok(true);
            }
            let shape = cur.shape();
            if shape.find(atom).is_some() {
                return Ok(true);
            }
            match shape.proto() {
                Some(proto) => cur = proto,
                None => return Ok(false),
            }
        }
    }

    /// Own-property membership without the chain.
    pub fn has_own_property(&self, obj: &GcRef<JsObject>, atom: Atom) -> JsResult<bool> {
        Ok(self.get_own_property(obj, atom)?.is_some())
    }

    // =====================================================================
    // names
    // =====================================================================

    /// `[[OwnPropertyKeys]]` with filter flags. Array-index keys come
    /// first in ascending order, then string keys in insertion order,
    /// then symbols. Returned atoms carry one reference each; release
    /// them with [`Context::release_atoms`].
    pub fn get_own_property_names(
        &self,
        obj: &GcRef<JsObject>,
        flags: u32,
    ) -> JsResult<Vec<Atom>> {
        if let Some(exotic) = self.exotic_of(obj)
            && let ExoticResult::Handled(names) = exotic.own_property_names(self, obj)?
        {
            return Ok(self.filter_names(obj, names, flags)?);
        }
        let mut names: Vec<Atom> = Vec::new();
        if obj.is_fast_array() {
            for i in 0..crate::array::fast_len(obj) {
                names.push(Atom::from_index(i as u32));
            }
        }
        let shape = obj.shape();
        for i in 0..shape.prop_count() {
            let prop = shape.prop(i);
            if !prop.atom.is_null() {
                self.rt.dup_atom(prop.atom);
                names.push(prop.atom);
            }
        }
        self.filter_names(obj, names, flags)
    }

    fn filter_names(
        &self,
        obj: &GcRef<JsObject>,
        names: Vec<Atom>,
        flags: u32,
    ) -> JsResult<Vec<Atom>> {
        use crate::atom::AtomKind;
        let mut indices: Vec<Atom> = Vec::new();
        let mut strings: Vec<Atom> = Vec::new();
        let mut symbols: Vec<Atom> = Vec::new();
        for atom in names {
            let kind = self.rt.inner.atoms.borrow().kind(atom);
            let wanted = match kind {
                AtomKind::String => flags & gpn_flags::STRING != 0,
                AtomKind::Symbol | AtomKind::GlobalSymbol => flags & gpn_flags::SYMBOL != 0,
                AtomKind::Private => flags & gpn_flags::PRIVATE != 0,
            };
            if wanted && flags & gpn_flags::ENUM_ONLY != 0 {
                let enumerable = match self.get_own_property(obj, atom)? {
                    Some(p) => p.flags.has(PropFlags::ENUMERABLE),
                    None => false,
                };
                if !enumerable {
                    self.rt.release_atom(atom);
                    continue;
                }
            }
            if !wanted {
                self.rt.release_atom(atom);
                continue;
            }
            if atom.as_index().is_some() {
                indices.push(atom);
            } else if matches!(kind, AtomKind::String) {
                strings.push(atom);
            } else {
                symbols.push(atom);
            }
        }
        indices.sort_by_key(|a| a.as_index().unwrap_or(u32::MAX));
        indices.extend(strings);
        indices.extend(symbols);
        Ok(indices)
    }

    /// Release atoms returned by a name listing.
    pub fn release_atoms(&self, atoms: &[Atom]) {
        for a in atoms {
            self.rt.release_atom(*a);
        }
    }

    // =====================================================================
    // prototype
    // =====================================================================

    /// `[[GetPrototypeOf]]`.
    pub fn get_prototype(&self, obj: &GcRef<JsObject>) -> JsResult<Value> {
        if obj.class_id() == class_ids::PROXY {
            return crate::proxy::proxy_get_prototype(self, obj);
        }
        Ok(match obj.shape().proto() {
            Some(p) => Value::Object(p),
            None => Value::Null,
        })
    }

    /// `[[SetPrototypeOf]]` with cycle detection.
    pub fn set_prototype(&self, obj: &GcRef<JsObject>, proto: &Value, throw: bool) -> JsResult<bool> {
        if obj.class_id() == class_ids::PROXY {
            return crate::proxy::proxy_set_prototype(self, obj, proto, throw);
        }
        let new_proto: Option<GcRef<JsObject>> = match proto {
            Value::Object(p) => Some(p.clone()),
            Value::Null => None,
            _ => {
                return Err(self.throw_type_error("prototype must be an object or null"));
            }
        };
        let cur = obj.shape().proto();
        let same = match (&cur, &new_proto) {
            (None, None) => true,
            (Some(a), Some(b)) => GcRef::ptr_eq(a, b),
            _ => false,
        };
        if same {
            return Ok(true);
        }
        if !obj.is_extensible() {
            if throw {
                return Err(self.throw_type_error("object is not extensible"));
            }
            return Ok(false);
        }
        // Walk the proposed chain; finding `obj` would create a cycle.
        let mut walk = new_proto.clone();
        while let Some(p) = walk {
            if GcRef::ptr_eq(&p, obj) {
                if throw {
                    return Err(self.throw_type_error("circular prototype chain"));
                }
                return Ok(false);
            }
            if p.class_id() == class_ids::PROXY {
                break; // proxies answer their own getPrototypeOf
            }
            walk = p.shape().proto();
        }
        self.prepare_shape_update(obj);
        obj.shape().set_proto(new_proto);
        Ok(true)
    }

    /// `[[IsExtensible]]`.
    pub fn is_extensible(&self, obj: &GcRef<JsObject>) -> JsResult<bool> {
        if obj.class_id() == class_ids::PROXY {
            return crate::proxy::proxy_is_extensible(self, obj);
        }
        Ok(obj.is_extensible())
    }

    /// `[[PreventExtensions]]`.
    pub fn prevent_extensions(&self, obj: &GcRef<JsObject>) -> JsResult<bool> {
        if obj.class_id() == class_ids::PROXY {
            return crate::proxy::proxy_prevent_extensions(self, obj);
        }
        obj.set_flag(obj_flags::EXTENSIBLE, false);
        Ok(true)
    }

    // =====================================================================
    // for-in
    // =====================================================================

    /// Snapshot the enumerable string keys of `value`'s chain for a
    /// `for-in` loop.
    pub fn build_for_in_iterator(&self, value: &Value) -> JsResult<GcRef<JsObject>> {
        let mut keys: Vec<std::rc::Rc<crate::string::JsString>> = Vec::new();
        let mut seen: Vec<Atom> = Vec::new();
        let mut cur = value.as_object().cloned();
        while let Some(obj) = cur {
            let own = self.get_own_property_names(
                &obj,
                gpn_flags::STRING | gpn_flags::ENUM_ONLY,
            )?;
            for atom in own {
                if seen.contains(&atom) {
                    self.rt.release_atom(atom);
                } else {
                    keys.push(self.rt.atom_to_string(atom));
                    seen.push(atom);
                }
            }
            cur = obj.shape().proto();
        }
        self.release_atoms(&seen);
        let iter = self.new_object_full(
            class_ids::FOR_IN_ITERATOR,
            None,
            ObjectData::ForIn(Box::new(crate::object::ForInIterator {
                target: value.clone(),
                keys,
                pos: std::cell::Cell::new(0),
            })),
        );
        Ok(iter)
    }

    /// Advance a `for-in` iterator; skips keys deleted since the
    /// snapshot. Returns the key as a string value, or `None` when done.
    pub fn for_in_next(&self, iter: &GcRef<JsObject>) -> JsResult<Option<Value>> {
        loop {
            let next = iter.with_data(|data| match data {
                ObjectData::ForIn(it) => {
                    let pos = it.pos.get();
                    if pos >= it.keys.len() {
                        None
                    } else {
                        it.pos.set(pos + 1);
                        Some((it.target.clone(), it.keys[pos].clone()))
                    }
                }
                _ => None,
            });
            let Some((target, key)) = next else {
                return Ok(None);
            };
            let atom = self.rt.intern_string_atom(key.clone());
            let present = match target.as_object() {
                Some(obj) => self.has_property(obj, atom)?,
                None => false,
            };
            self.rt.release_atom(atom);
            if present {
                return Ok(Some(Value::String(key)));
            }
        }
    }
}

/// Fast-array store outcome.
enum FastSet {
    Done,
    NotCovered,
}

type SlotAndFlags = (Option<Property>, PropFlags);
