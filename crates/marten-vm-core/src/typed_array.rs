//! Typed-array views
//!
//! A view is `(buffer, byte offset, element count, element kind)`. Reads
//! on a detached buffer answer `undefined`; writes coerce their value
//! first (the coercion may itself detach the buffer) and then drop
//! silently or throw per the call's throw flag. BigInt64/BigUint64 accept
//! BigInt values only; Uint8Clamped clamps and rounds.

use std::cell::Cell;

use marten_vm_gc::{GcAny, GcRef};
use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::atom::Atom;
use crate::class::{ExoticMethods, ExoticResult, OwnProperty, OwnPropertyKind, PropertyDescriptor};
use crate::context::Context;
use crate::error::JsResult;
use crate::object::{ClassId, JsObject, ObjectData, class_ids};
use crate::shape::PropFlags;
use crate::value::Value;

/// Element type of a typed array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypedArrayKind {
    Uint8Clamped,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    BigInt64,
    BigUint64,
    Float32,
    Float64,
}

impl TypedArrayKind {
    /// Bytes per element.
    pub fn element_size(self) -> usize {
        match self {
            TypedArrayKind::Uint8Clamped | TypedArrayKind::Int8 | TypedArrayKind::Uint8 => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 | TypedArrayKind::Float64 => 8,
        }
    }

    /// BigInt-element kinds accept only BigInt values.
    pub fn is_bigint(self) -> bool {
        matches!(self, TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64)
    }

    /// The class id this kind maps to.
    pub fn class_id(self) -> ClassId {
        match self {
            TypedArrayKind::Uint8Clamped => class_ids::UINT8C_ARRAY,
            TypedArrayKind::Int8 => class_ids::INT8_ARRAY,
            TypedArrayKind::Uint8 => class_ids::UINT8_ARRAY,
            TypedArrayKind::Int16 => class_ids::INT16_ARRAY,
            TypedArrayKind::Uint16 => class_ids::UINT16_ARRAY,
            TypedArrayKind::Int32 => class_ids::INT32_ARRAY,
            TypedArrayKind::Uint32 => class_ids::UINT32_ARRAY,
            TypedArrayKind::BigInt64 => class_ids::BIG_INT64_ARRAY,
            TypedArrayKind::BigUint64 => class_ids::BIG_UINT64_ARRAY,
            TypedArrayKind::Float32 => class_ids::FLOAT32_ARRAY,
            TypedArrayKind::Float64 => class_ids::FLOAT64_ARRAY,
        }
    }

    /// Inverse of [`TypedArrayKind::class_id`].
    pub fn from_class_id(id: ClassId) -> Option<TypedArrayKind> {
        Some(match id {
            class_ids::UINT8C_ARRAY => TypedArrayKind::Uint8Clamped,
            class_ids::INT8_ARRAY => TypedArrayKind::Int8,
            class_ids::UINT8_ARRAY => TypedArrayKind::Uint8,
            class_ids::INT16_ARRAY => TypedArrayKind::Int16,
            class_ids::UINT16_ARRAY => TypedArrayKind::Uint16,
            class_ids::INT32_ARRAY => TypedArrayKind::Int32,
            class_ids::UINT32_ARRAY => TypedArrayKind::Uint32,
            class_ids::BIG_INT64_ARRAY => TypedArrayKind::BigInt64,
            class_ids::BIG_UINT64_ARRAY => TypedArrayKind::BigUint64,
            class_ids::FLOAT32_ARRAY => TypedArrayKind::Float32,
            class_ids::FLOAT64_ARRAY => TypedArrayKind::Float64,
            _ => return None,
        })
    }
}

/// Typed-array payload.
pub struct TypedArrayData {
    /// Backing buffer object
    pub buffer: GcRef<JsObject>,
    /// Byte offset into the buffer
    pub offset: Cell<usize>,
    /// Element count (zeroed on detach)
    pub count: Cell<usize>,
    /// Element kind
    pub kind: TypedArrayKind,
}

impl TypedArrayData {
    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        mark(self.buffer.as_any());
    }

    /// Zero the view after its buffer detached.
    pub(crate) fn neuter(&self) {
        self.count.set(0);
        self.offset.set(0);
    }
}

fn with_typed_array<R>(
    ctx: &Context,
    obj: &GcRef<JsObject>,
    f: impl FnOnce(&TypedArrayData) -> R,
) -> JsResult<R> {
    obj.with_data(|d| match d {
        ObjectData::TypedArray(t) => Some(f(t)),
        _ => None,
    })
    .ok_or_else(|| ctx.throw_type_error("not a typed array"))
}

impl Context {
    /// `new Uint8Array(length)` and friends.
    pub fn new_typed_array(&self, kind: TypedArrayKind, length: usize) -> GcRef<JsObject> {
        let buffer = self.new_array_buffer(length * kind.element_size());
        self.new_typed_array_view(kind, &buffer, 0, Some(length))
            .expect("fresh buffer view")
    }

    /// `(buffer, offset, length)` view constructor.
    pub fn new_typed_array_view(
        &self,
        kind: TypedArrayKind,
        buffer: &GcRef<JsObject>,
        byte_offset: usize,
        length: Option<usize>,
    ) -> JsResult<GcRef<JsObject>> {
        let elem = kind.element_size();
        let byte_len = self.with_array_buffer(buffer, |b| b.byte_length())?;
        if byte_offset % elem != 0 || byte_offset > byte_len {
            return Err(self.throw_range_error("invalid typed array offset"));
        }
        let count = match length {
            Some(n) => {
                if byte_offset + n * elem > byte_len {
                    return Err(self.throw_range_error("typed array exceeds buffer"));
                }
                n
            }
            None => (byte_len - byte_offset) / elem,
        };
        let view = self.new_object_class(
            kind.class_id(),
            ObjectData::TypedArray(TypedArrayData {
                buffer: buffer.clone(),
                offset: Cell::new(byte_offset),
                count: Cell::new(count),
                kind,
            }),
        );
        self.register_buffer_view(buffer, &view)?;
        Ok(view)
    }

    /// `(typedArray)` copy constructor with element conversion.
    pub fn new_typed_array_copy(
        &self,
        kind: TypedArrayKind,
        source: &GcRef<JsObject>,
    ) -> JsResult<GcRef<JsObject>> {
        let len = self.typed_array_length(source)?;
        let dest = self.new_typed_array(kind, len);
        for i in 0..len {
            let v = self.typed_array_get(source, i)?;
            self.typed_array_set(&dest, i, &v, true)?;
        }
        Ok(dest)
    }

    /// `(object)` construction: iterate the source values.
    pub fn new_typed_array_from_values(
        &self,
        kind: TypedArrayKind,
        values: &[Value],
    ) -> JsResult<GcRef<JsObject>> {
        let dest = self.new_typed_array(kind, values.len());
        for (i, v) in values.iter().enumerate() {
            self.typed_array_set(&dest, i, v, true)?;
        }
        Ok(dest)
    }

    /// Element count (0 when detached).
    pub fn typed_array_length(&self, obj: &GcRef<JsObject>) -> JsResult<usize> {
        with_typed_array(self, obj, |t| t.count.get())
    }

    /// The backing buffer object.
    pub fn typed_array_buffer(&self, obj: &GcRef<JsObject>) -> JsResult<GcRef<JsObject>> {
        with_typed_array(self, obj, |t| t.buffer.clone())
    }

    /// Read element `i`; out-of-bounds or detached reads answer
    /// `undefined`.
    pub fn typed_array_get(&self, obj: &GcRef<JsObject>, i: usize) -> JsResult<Value> {
        let (buffer, offset, count, kind) = with_typed_array(self, obj, |t| {
            (t.buffer.clone(), t.offset.get(), t.count.get(), t.kind)
        })?;
        if i >= count {
            return Ok(Value::Undefined);
        }
        let elem = kind.element_size();
        let at = offset + i * elem;
        let read = self.with_array_buffer(&buffer, |b| {
            b.with_bytes(|bytes| read_element(&bytes[at..at + elem], kind))
        })?;
        Ok(read.unwrap_or(Value::Undefined))
    }

    /// Write element `i`. The value is coerced first (user `valueOf`
    /// code may detach the buffer mid-store), then an out-of-bounds or
    /// detached store throws or drops per `throw`.
    pub fn typed_array_set(
        &self,
        obj: &GcRef<JsObject>,
        i: usize,
        value: &Value,
        throw: bool,
    ) -> JsResult<bool> {
        let kind = with_typed_array(self, obj, |t| t.kind)?;
        let encoded = coerce_element(self, kind, value)?;
        let (buffer, offset, count) = with_typed_array(self, obj, |t| {
            (t.buffer.clone(), t.offset.get(), t.count.get())
        })?;
        if i >= count {
            if throw {
                return Err(self.throw_range_error("typed array index out of range"));
            }
            return Ok(false);
        }
        let elem = kind.element_size();
        let at = offset + i * elem;
        let wrote = self.with_array_buffer(&buffer, |b| {
            b.with_bytes_mut(|bytes| {
                bytes[at..at + elem].copy_from_slice(&encoded[..elem]);
            })
            .is_some()
        })?;
        if !wrote && throw {
            return Err(self.throw_type_error("typed array buffer is detached"));
        }
        Ok(wrote)
    }
}

/// Decode one element.
fn read_element(bytes: &[u8], kind: TypedArrayKind) -> Value {
    match kind {
        TypedArrayKind::Int8 => Value::Int(bytes[0] as i8 as i32),
        TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => Value::Int(bytes[0] as i32),
        TypedArrayKind::Int16 => {
            Value::Int(i16::from_le_bytes([bytes[0], bytes[1]]) as i32)
        }
        TypedArrayKind::Uint16 => {
            Value::Int(u16::from_le_bytes([bytes[0], bytes[1]]) as i32)
        }
        TypedArrayKind::Int32 => {
            Value::Int(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        TypedArrayKind::Uint32 => {
            let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Value::number(v as f64)
        }
        TypedArrayKind::BigInt64 => {
            let v = i64::from_le_bytes(bytes[..8].try_into().unwrap());
            Value::BigInt(std::rc::Rc::new(BigInt::from(v)))
        }
        TypedArrayKind::BigUint64 => {
            let v = u64::from_le_bytes(bytes[..8].try_into().unwrap());
            Value::BigInt(std::rc::Rc::new(BigInt::from(v)))
        }
        TypedArrayKind::Float32 => {
            let v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Value::number(v as f64)
        }
        TypedArrayKind::Float64 => {
            let v = f64::from_le_bytes(bytes[..8].try_into().unwrap());
            Value::number(v)
        }
    }
}

/// Coerce and encode one element into its little-endian byte form.
fn coerce_element(ctx: &Context, kind: TypedArrayKind, value: &Value) -> JsResult<[u8; 8]> {
    let mut out = [0u8; 8];
    if kind.is_bigint() {
        let Some(b) = value.as_bigint() else {
            return Err(ctx.throw_type_error("BigInt value required"));
        };
        let v: i64 = b.to_i64().unwrap_or_else(|| {
            // Modular wrap for out-of-range BigInts.
            let m = b.to_u64().unwrap_or(0);
            m as i64
        });
        out[..8].copy_from_slice(&v.to_le_bytes());
        return Ok(out);
    }
    if value.as_bigint().is_some() {
        return Err(ctx.throw_type_error("cannot store a BigInt in this array"));
    }
    let n = ctx.to_number(value)?;
    match kind {
        TypedArrayKind::Uint8Clamped => {
            let clamped = if n.is_nan() {
                0
            } else {
                n.round_ties_even().clamp(0.0, 255.0) as u8
            };
            out[0] = clamped;
        }
        TypedArrayKind::Int8 | TypedArrayKind::Uint8 => {
            out[0] = to_int_modular(n) as u8;
        }
        TypedArrayKind::Int16 | TypedArrayKind::Uint16 => {
            out[..2].copy_from_slice(&(to_int_modular(n) as u16).to_le_bytes());
        }
        TypedArrayKind::Int32 | TypedArrayKind::Uint32 => {
            out[..4].copy_from_slice(&(to_int_modular(n) as u32).to_le_bytes());
        }
        TypedArrayKind::Float32 => {
            out[..4].copy_from_slice(&(n as f32).to_le_bytes());
        }
        TypedArrayKind::Float64 => {
            out[..8].copy_from_slice(&n.to_le_bytes());
        }
        TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => unreachable!(),
    }
    Ok(out)
}

fn to_int_modular(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    n as i64 as u32
}

/// Exotic behavior: canonical numeric indices hit the element storage
/// and never the shape.
pub struct TypedArrayExotic;

impl ExoticMethods for TypedArrayExotic {
    fn get_own_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<Option<OwnProperty>>> {
        let Some(idx) = prop.as_index() else {
            return Ok(ExoticResult::Ordinary);
        };
        let v = ctx.typed_array_get(obj, idx as usize)?;
        if v.is_undefined() {
            return Ok(ExoticResult::Handled(None));
        }
        Ok(ExoticResult::Handled(Some(OwnProperty {
            kind: OwnPropertyKind::Value(v),
            flags: PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::ENUMERABLE),
        })))
    }

    fn get_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        _receiver: &Value,
    ) -> JsResult<ExoticResult<Value>> {
        if prop == ctx.rt().common_atoms().length {
            return Ok(ExoticResult::Handled(Value::number(
                ctx.typed_array_length(obj)? as f64,
            )));
        }
        let Some(idx) = prop.as_index() else {
            return Ok(ExoticResult::Ordinary);
        };
        Ok(ExoticResult::Handled(ctx.typed_array_get(obj, idx as usize)?))
    }

    fn set_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        value: Value,
        _receiver: &Value,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        let Some(idx) = prop.as_index() else {
            return Ok(ExoticResult::Ordinary);
        };
        Ok(ExoticResult::Handled(ctx.typed_array_set(
            obj,
            idx as usize,
            &value,
            throw,
        )?))
    }

    fn has_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<bool>> {
        let Some(idx) = prop.as_index() else {
            return Ok(ExoticResult::Ordinary);
        };
        Ok(ExoticResult::Handled(
            (idx as usize) < ctx.typed_array_length(obj)?,
        ))
    }

    fn define_own_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        desc: &PropertyDescriptor,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        let Some(idx) = prop.as_index() else {
            return Ok(ExoticResult::Ordinary);
        };
        if desc.is_accessor_descriptor()
            || desc.writable == Some(false)
            || desc.configurable == Some(true)
        {
            if throw {
                return Err(ctx.throw_type_error("cannot reconfigure a typed array element"));
            }
            return Ok(ExoticResult::Handled(false));
        }
        match &desc.value {
            Some(v) => Ok(ExoticResult::Handled(ctx.typed_array_set(
                obj,
                idx as usize,
                v,
                throw,
            )?)),
            None => Ok(ExoticResult::Handled(true)),
        }
    }

    fn own_property_names(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
    ) -> JsResult<ExoticResult<Vec<Atom>>> {
        let len = ctx.typed_array_length(obj)?;
        let mut names: Vec<Atom> = (0..len as u32).map(Atom::from_index).collect();
        let shape = obj.shape();
        for i in 0..shape.prop_count() {
            let p = shape.prop(i);
            if !p.atom.is_null() {
                ctx.rt().dup_atom(p.atom);
                names.push(p.atom);
            }
        }
        Ok(ExoticResult::Handled(names))
    }
}
