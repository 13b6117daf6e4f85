//! Array fast path and `length` semantics
//!
//! A fast array keeps its elements in a dense vector and only degrades to
//! ordinary properties when a hole, an accessor element, or a non-default
//! attribute shows up. The `length` property is always the first shape
//! entry and carries the `LENGTH` flag; every mutation of the dense
//! vector keeps its slot in sync.

use marten_vm_gc::GcRef;

use crate::atom::Atom;
use crate::context::Context;
use crate::error::JsResult;
use crate::object::{JsObject, ObjectData, Property, obj_flags};
use crate::shape::PropFlags;
use crate::value::Value;

/// Dense element count of a fast array.
pub(crate) fn fast_len(obj: &GcRef<JsObject>) -> usize {
    obj.with_data(|data| match data {
        ObjectData::Array(values) => values.len(),
        _ => 0,
    })
}

/// Grow the `length` slot after a dense append. Deletes never shrink it:
/// `delete a[last]` leaves `length` untouched.
pub(crate) fn sync_fast_length(ctx: &Context, obj: &GcRef<JsObject>) {
    let dense = fast_len(obj) as u32;
    let shape = obj.shape();
    if let Some(idx) = shape.find(ctx.rt().common_atoms().length) {
        let cur = obj.with_prop(idx, |p| match p {
            Property::Value(v) => v.as_number().unwrap_or(0.0) as u32,
            _ => 0,
        });
        if dense > cur {
            obj.set_prop(idx, Property::Value(Value::number(dense as f64)));
        }
    }
}

/// Current `length` of any array object (the `length` slot is
/// authoritative; the dense vector may be shorter).
pub fn array_length(ctx: &Context, obj: &GcRef<JsObject>) -> JsResult<u32> {
    let shape = obj.shape();
    if let Some(idx) = shape.find(ctx.rt().common_atoms().length) {
        let len = obj.with_prop(idx, |p| match p {
            Property::Value(v) => v.as_number(),
            _ => None,
        });
        if let Some(len) = len {
            return Ok(len as u32);
        }
    }
    let v = ctx.get_property_value(&Value::Object(obj.clone()), ctx.rt().common_atoms().length)?;
    Ok(v.as_number().unwrap_or(0.0) as u32)
}

/// Move dense elements into ordinary integer-keyed properties and leave
/// the fast path for good.
pub fn convert_fast_array_to_array(ctx: &Context, obj: &GcRef<JsObject>) {
    if !obj.is_fast_array() {
        return;
    }
    let values = obj.with_data_mut(|data| match data {
        ObjectData::Array(values) => std::mem::take(values),
        _ => Vec::new(),
    });
    obj.set_flag(obj_flags::FAST_ARRAY, false);
    obj.replace_data(ObjectData::Ordinary);
    for (i, v) in values.into_iter().enumerate() {
        ctx.add_own_property(
            obj,
            Atom::from_index(i as u32),
            PropFlags::cwe(),
            Property::Value(v),
        );
    }
}

/// `set length = value`. Truncation deletes elements in descending index
/// order and stops at the first non-configurable one, which becomes the
/// new effective length (reported as failure).
pub fn set_array_length(
    ctx: &Context,
    obj: &GcRef<JsObject>,
    value: Value,
    throw: bool,
) -> JsResult<bool> {
    let num = ctx.to_number(&value)?;
    let new_len = num as u32;
    if new_len as f64 != num {
        return Err(ctx.throw_range_error("invalid array length"));
    }
    let common = ctx.rt().common_atoms();
    let shape = obj.shape();
    let length_writable = shape
        .find(common.length)
        .map(|idx| shape.prop(idx).flags.has(PropFlags::WRITABLE))
        .unwrap_or(true);
    let old_len = array_length(ctx, obj)?;
    if !length_writable && new_len != old_len {
        if throw {
            return Err(ctx.throw_type_error("length is not writable"));
        }
        return Ok(false);
    }
    if obj.is_fast_array() {
        // Truncate the dense part; a length beyond it is a sparse tail
        // that reads as undefined without leaving the fast path.
        obj.with_data_mut(|data| {
            if let ObjectData::Array(values) = data
                && (new_len as usize) < values.len()
            {
                values.truncate(new_len as usize);
            }
        });
        write_length_slot(ctx, obj, new_len);
        return Ok(true);
    }
    if new_len >= old_len {
        write_length_slot(ctx, obj, new_len);
        return Ok(true);
    }
    // Collect own indices ≥ new_len and delete them high-to-low.
    let names = ctx.get_own_property_names(obj, crate::object_ops::gpn_flags::STRING)?;
    let mut doomed: Vec<u32> = names
        .iter()
        .filter_map(|a| a.as_index())
        .filter(|&i| i >= new_len)
        .collect();
    ctx.release_atoms(&names);
    doomed.sort_unstable_by(|a, b| b.cmp(a));
    let mut effective = new_len;
    let mut ok = true;
    for idx in doomed {
        if !ctx.delete_property(obj, Atom::from_index(idx))? {
            // Non-configurable element: the length stops just above it.
            effective = idx + 1;
            ok = false;
            break;
        }
    }
    write_length_slot(ctx, obj, effective);
    if !ok && throw {
        return Err(ctx.throw_type_error("cannot delete non-configurable element"));
    }
    Ok(ok)
}

pub(crate) fn write_length_slot(ctx: &Context, obj: &GcRef<JsObject>, len: u32) {
    let shape = obj.shape();
    if let Some(idx) = shape.find(ctx.rt().common_atoms().length) {
        obj.set_prop(idx, Property::Value(Value::number(len as f64)));
    }
}

impl Context {
    /// `array.push(...)` through the generic property path; fast arrays
    /// stay fast.
    pub fn array_push(&self, obj: &GcRef<JsObject>, values: &[Value]) -> JsResult<u32> {
        let this = Value::Object(obj.clone());
        let mut len = array_length(self, obj)?;
        for v in values {
            self.set_property(&this, Atom::from_index(len), v.clone(), &this, true)?;
            len += 1;
        }
        if !obj.is_fast_array() {
            write_length_slot(self, obj, len);
        }
        Ok(len)
    }

    /// `array.pop()`.
    pub fn array_pop(&self, obj: &GcRef<JsObject>) -> JsResult<Value> {
        let this = Value::Object(obj.clone());
        let len = array_length(self, obj)?;
        if len == 0 {
            return Ok(Value::Undefined);
        }
        let last = Atom::from_index(len - 1);
        let value = self.get_property_value(&this, last)?;
        self.delete_property(obj, last)?;
        set_array_length(self, obj, Value::number((len - 1) as f64), false)?;
        Ok(value)
    }

    /// `array.join(sep)`.
    pub fn array_join(&self, obj: &GcRef<JsObject>, sep: &str) -> JsResult<Value> {
        let this = Value::Object(obj.clone());
        let len = array_length(self, obj)?;
        let mut out = String::new();
        for i in 0..len {
            if i > 0 {
                out.push_str(sep);
            }
            let v = self.get_property_value(&this, Atom::from_index(i))?;
            if !v.is_nullish() {
                let s = self.to_string(&v)?;
                out.push_str(&s.to_rust_string());
            }
        }
        Ok(Value::string(&out))
    }
}
