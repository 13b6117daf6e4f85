//! Object serialization: a bit-exact tagged stream
//!
//! Layout: one version byte (base version OR'd with the big-endian flag),
//! the atom string table collected during writing, then the tagged value
//! tree. Atom references in the payload are `(table_index << 1)`;
//! array-index atoms encode inline as `(value << 1) | 1`. Back-references
//! are only emitted under the `REFERENCE` flag; SharedArrayBuffers pass
//! by payload table under `SAB`.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexSet;
use marten_vm_gc::GcRef;
use rustc_hash::FxHashMap;

use crate::atom::Atom;
use crate::context::Context;
use crate::error::JsResult;
use crate::function::{ClosureVarDef, FunctionBytecode, FunctionFlags};
use crate::object::{JsObject, ObjectData, class_ids, obj_flags};
use crate::object_ops::gpn_flags;
use crate::string::{JsString, StrPayload};
use crate::typed_array::TypedArrayKind;
use crate::value::Value;

/// Stream base version; readers reject any other base.
pub const BASE_VERSION: u8 = 0x05;
/// Version-byte bit marking a big-endian stream.
pub const BE_FLAG: u8 = 0x40;

/// Writer flags.
pub mod write_flags {
    /// Allow function-bytecode and module records
    pub const BYTECODE: u32 = 1 << 0;
    /// Emit back-references for shared/cyclic objects
    pub const REFERENCE: u32 = 1 << 1;
    /// Allow SharedArrayBuffer (payload-table transfer)
    pub const SAB: u32 = 1 << 2;
    /// Write multi-byte scalars big-endian
    pub const BYTE_SWAP: u32 = 1 << 3;
}

/// Reader flags.
pub mod read_flags {
    /// Accept function-bytecode and module records
    pub const BYTECODE: u32 = 1 << 0;
    /// Accept back-references
    pub const REFERENCE: u32 = 1 << 1;
    /// Accept SharedArrayBuffer payload references
    pub const SAB: u32 = 1 << 2;
    /// The input buffer is read-only mapped data; no copies are taken
    /// beyond what value construction requires
    pub const ROM_DATA: u32 = 1 << 3;
}

mod tag {
    pub const NULL: u8 = 1;
    pub const UNDEFINED: u8 = 2;
    pub const FALSE: u8 = 3;
    pub const TRUE: u8 = 4;
    pub const INT32: u8 = 5;
    pub const FLOAT64: u8 = 6;
    pub const STRING: u8 = 7;
    pub const OBJECT: u8 = 8;
    pub const ARRAY: u8 = 9;
    pub const TYPED_ARRAY: u8 = 10;
    pub const ARRAY_BUFFER: u8 = 11;
    pub const SHARED_ARRAY_BUFFER: u8 = 12;
    pub const DATE: u8 = 13;
    pub const OBJECT_VALUE: u8 = 14;
    pub const TEMPLATE_OBJECT: u8 = 15;
    pub const BIG_INT: u8 = 16;
    pub const FUNCTION_BYTECODE: u8 = 17;
    pub const MODULE: u8 = 18;
    pub const OBJECT_REFERENCE: u8 = 19;
}

// ---- LEB128 ----------------------------------------------------------------

fn write_leb128(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_sleb128(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        let sign = byte & 0x40 != 0;
        if (v == 0 && !sign) || (v == -1 && sign) {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// The serialized form of a value graph.
pub struct WriteResult {
    /// The stream
    pub bytes: Vec<u8>,
    /// SharedArrayBuffer payloads, indexed by the stream's SAB references
    pub sab_payloads: Vec<Rc<RefCell<Vec<u8>>>>,
}

struct Writer<'a> {
    ctx: &'a Context,
    flags: u32,
    payload: Vec<u8>,
    atom_table: IndexSet<u32>,
    /// addr → id under `REFERENCE`
    object_ids: FxHashMap<usize, u32>,
    /// addr set for cycle detection without `REFERENCE`
    active: Vec<usize>,
    sab_payloads: Vec<Rc<RefCell<Vec<u8>>>>,
}

impl Context {
    /// Serialize a value graph.
    pub fn write_object(&self, value: &Value, flags: u32) -> JsResult<WriteResult> {
        let mut w = Writer {
            ctx: self,
            flags,
            payload: Vec::new(),
            atom_table: IndexSet::new(),
            object_ids: FxHashMap::default(),
            active: Vec::new(),
            sab_payloads: Vec::new(),
        };
        w.write_value(value)?;

        let mut bytes = Vec::with_capacity(w.payload.len() + 64);
        let mut version = BASE_VERSION;
        if flags & write_flags::BYTE_SWAP != 0 {
            version |= BE_FLAG;
        }
        bytes.push(version);
        write_leb128(&mut bytes, w.atom_table.len() as u64);
        let swapped = flags & write_flags::BYTE_SWAP != 0;
        for raw in &w.atom_table {
            let s = self.rt.atom_to_string(Atom(*raw));
            write_string(&mut bytes, &s, swapped);
        }
        bytes.extend_from_slice(&w.payload);
        Ok(WriteResult {
            bytes,
            sab_payloads: w.sab_payloads,
        })
    }
}

fn write_string(out: &mut Vec<u8>, s: &JsString, swapped: bool) {
    let wide = s.is_wide();
    write_leb128(out, ((s.len() as u64) << 1) | wide as u64);
    match s.payload() {
        StrPayload::Narrow(b) => out.extend_from_slice(b),
        StrPayload::Wide(w) => {
            for unit in w.iter() {
                let b = if swapped {
                    unit.to_be_bytes()
                } else {
                    unit.to_le_bytes()
                };
                out.extend_from_slice(&b);
            }
        }
    }
}

impl Writer<'_> {
    fn swapped(&self) -> bool {
        self.flags & write_flags::BYTE_SWAP != 0
    }

    fn write_f64(&mut self, v: f64) {
        let b = if self.swapped() {
            v.to_bits().to_be_bytes()
        } else {
            v.to_bits().to_le_bytes()
        };
        self.payload.extend_from_slice(&b);
    }

    fn write_atom(&mut self, atom: Atom) {
        if let Some(idx) = atom.as_index() {
            write_leb128(&mut self.payload, ((idx as u64) << 1) | 1);
            return;
        }
        let (pos, _) = self.atom_table.insert_full(atom.0);
        write_leb128(&mut self.payload, (pos as u64) << 1);
    }

    fn write_value(&mut self, value: &Value) -> JsResult<()> {
        match value {
            Value::Undefined => self.payload.push(tag::UNDEFINED),
            Value::Null => self.payload.push(tag::NULL),
            Value::Bool(false) => self.payload.push(tag::FALSE),
            Value::Bool(true) => self.payload.push(tag::TRUE),
            Value::Int(i) => {
                self.payload.push(tag::INT32);
                write_sleb128(&mut self.payload, *i as i64);
            }
            Value::Float(f) => {
                self.payload.push(tag::FLOAT64);
                self.write_f64(*f);
            }
            Value::String(s) => {
                self.payload.push(tag::STRING);
                let swapped = self.swapped();
                write_string(&mut self.payload, s, swapped);
            }
            Value::BigInt(b) => {
                self.payload.push(tag::BIG_INT);
                let bytes = b.to_signed_bytes_le();
                write_leb128(&mut self.payload, bytes.len() as u64);
                self.payload.extend_from_slice(&bytes);
            }
            Value::Symbol(_) => {
                return Err(self.ctx.throw_type_error("symbols cannot be serialized"));
            }
            Value::Uninitialized => {
                return Err(self.ctx.throw_type_error("invalid value in serialization"));
            }
            Value::Object(obj) => self.write_object_value(obj)?,
            Value::FunctionBytecode(f) => self.write_function_bytecode(f)?,
            Value::Module(m) => self.write_module(m)?,
        }
        Ok(())
    }

    fn enter_object(&mut self, obj: &GcRef<JsObject>) -> JsResult<Option<u32>> {
        if self.flags & write_flags::REFERENCE != 0 {
            if let Some(id) = self.object_ids.get(&obj.addr()) {
                return Ok(Some(*id));
            }
            let id = self.object_ids.len() as u32;
            self.object_ids.insert(obj.addr(), id);
            return Ok(None);
        }
        if self.active.contains(&obj.addr()) {
            return Err(self
                .ctx
                .throw_type_error("circular reference in serialization"));
        }
        self.active.push(obj.addr());
        Ok(None)
    }

    fn leave_object(&mut self, obj: &GcRef<JsObject>) {
        if self.flags & write_flags::REFERENCE == 0 {
            self.active.retain(|a| *a != obj.addr());
        }
    }

    fn write_object_value(&mut self, obj: &GcRef<JsObject>) -> JsResult<()> {
        if let Some(id) = self.enter_object(obj)? {
            self.payload.push(tag::OBJECT_REFERENCE);
            write_leb128(&mut self.payload, id as u64);
            return Ok(());
        }
        let result = self.write_object_body(obj);
        self.leave_object(obj);
        result
    }

    fn write_object_body(&mut self, obj: &GcRef<JsObject>) -> JsResult<()> {
        let ctx = self.ctx;
        match obj.class_id() {
            class_ids::ARRAY => {
                let template = !obj.is_extensible();
                self.payload.push(if template {
                    tag::TEMPLATE_OBJECT
                } else {
                    tag::ARRAY
                });
                let len = crate::array::array_length(ctx, obj)?;
                write_leb128(&mut self.payload, len as u64);
                let this = Value::Object(obj.clone());
                for i in 0..len {
                    let v = ctx.get_property_value(&this, Atom::from_index(i))?;
                    self.write_value(&v)?;
                }
            }
            class_ids::ARRAY_BUFFER => {
                self.payload.push(tag::ARRAY_BUFFER);
                let bytes = ctx.with_array_buffer(obj, |b| {
                    b.with_bytes(|bytes| bytes.to_vec())
                })?;
                let Some(bytes) = bytes else {
                    return Err(ctx.throw_type_error("cannot serialize a detached buffer"));
                };
                write_leb128(&mut self.payload, bytes.len() as u64);
                self.payload.extend_from_slice(&bytes);
            }
            class_ids::SHARED_ARRAY_BUFFER => {
                if self.flags & write_flags::SAB == 0 {
                    return Err(ctx.throw_type_error("SharedArrayBuffer is not allowed here"));
                }
                self.payload.push(tag::SHARED_ARRAY_BUFFER);
                let payload = ctx
                    .with_array_buffer(obj, |b| b.shared_payload())?
                    .ok_or_else(|| ctx.throw_type_error("not a shared buffer"))?;
                let idx = match self
                    .sab_payloads
                    .iter()
                    .position(|p| Rc::ptr_eq(p, &payload))
                {
                    Some(i) => i,
                    None => {
                        self.sab_payloads.push(payload.clone());
                        self.sab_payloads.len() - 1
                    }
                };
                write_leb128(&mut self.payload, idx as u64);
            }
            id if class_ids::is_typed_array(id) => {
                self.payload.push(tag::TYPED_ARRAY);
                let kind = TypedArrayKind::from_class_id(id).expect("typed array class");
                self.payload.push(kind.class_id() as u8);
                let (buffer, offset, count) = obj.with_data(|d| match d {
                    ObjectData::TypedArray(t) => {
                        (t.buffer.clone(), t.offset.get(), t.count.get())
                    }
                    _ => unreachable!("typed array class without view data"),
                });
                write_leb128(&mut self.payload, count as u64);
                write_leb128(&mut self.payload, offset as u64);
                self.write_object_value(&buffer)?;
            }
            class_ids::DATE => {
                self.payload.push(tag::DATE);
                let time = obj.with_data(|d| match d {
                    ObjectData::Boxed(v) => v.as_number().unwrap_or(f64::NAN),
                    _ => f64::NAN,
                });
                self.write_f64(time);
            }
            class_ids::NUMBER | class_ids::STRING | class_ids::BOOLEAN => {
                self.payload.push(tag::OBJECT_VALUE);
                let inner = obj.with_data(|d| match d {
                    ObjectData::Boxed(v) => v.clone(),
                    _ => Value::Undefined,
                });
                self.write_value(&inner)?;
            }
            class_ids::OBJECT => {
                self.payload.push(tag::OBJECT);
                let names = ctx.get_own_property_names(
                    obj,
                    gpn_flags::STRING | gpn_flags::ENUM_ONLY,
                )?;
                write_leb128(&mut self.payload, names.len() as u64);
                let this = Value::Object(obj.clone());
                for atom in &names {
                    self.write_atom(*atom);
                    let v = match ctx.get_property_value(&this, *atom) {
                        Ok(v) => v,
                        Err(e) => {
                            ctx.release_atoms(&names);
                            return Err(e);
                        }
                    };
                    if let Err(e) = self.write_value(&v) {
                        ctx.release_atoms(&names);
                        return Err(e);
                    }
                }
                ctx.release_atoms(&names);
            }
            _ => {
                return Err(ctx.throw_type_error("object cannot be serialized"));
            }
        }
        Ok(())
    }

    fn write_function_bytecode(&mut self, func: &GcRef<FunctionBytecode>) -> JsResult<()> {
        if self.flags & write_flags::BYTECODE == 0 {
            return Err(self
                .ctx
                .throw_type_error("function bytecode is not allowed here"));
        }
        self.payload.push(tag::FUNCTION_BYTECODE);
        self.write_atom(func.name.get());
        let mut bits = 0u8;
        if func.flags.strict {
            bits |= 1;
        }
        if func.flags.is_async {
            bits |= 2;
        }
        if func.flags.is_generator {
            bits |= 4;
        }
        self.payload.push(bits);
        write_leb128(&mut self.payload, func.arg_count as u64);
        write_leb128(&mut self.payload, func.var_count as u64);
        write_leb128(&mut self.payload, func.closure_vars.len() as u64);
        for cv in &func.closure_vars {
            self.write_atom(cv.name);
            self.payload.push(cv.is_local as u8);
            write_leb128(&mut self.payload, cv.idx as u64);
        }
        let cpool = func.cpool.borrow().clone();
        write_leb128(&mut self.payload, cpool.len() as u64);
        for v in &cpool {
            self.write_value(v)?;
        }
        Ok(())
    }

    fn write_module(&mut self, module: &GcRef<crate::module::ModuleRecord>) -> JsResult<()> {
        if self.flags & write_flags::BYTECODE == 0 {
            return Err(self.ctx.throw_type_error("modules are not allowed here"));
        }
        self.payload.push(tag::MODULE);
        self.write_atom(module.name());
        let req_names: Vec<Atom> = module
            .req_modules
            .borrow()
            .iter()
            .map(|r| r.name)
            .collect();
        write_leb128(&mut self.payload, req_names.len() as u64);
        for name in req_names {
            self.write_atom(name);
        }
        let func = module.func_bytecode.borrow().clone();
        match func {
            Some(f) => {
                self.payload.push(1);
                self.write_function_bytecode(&f)?;
            }
            None => self.payload.push(0),
        }
        Ok(())
    }
}

// ============================================================================
// reader
// ============================================================================

struct Reader<'a> {
    ctx: &'a Context,
    flags: u32,
    data: &'a [u8],
    pos: usize,
    swapped: bool,
    /// Interned atoms from the stream table (owned references)
    atoms: Vec<Atom>,
    /// Objects already materialized, for back-references
    objects: Vec<Value>,
    sab_payloads: &'a [Rc<RefCell<Vec<u8>>>],
}

impl Context {
    /// Deserialize a stream produced by [`Context::write_object`].
    pub fn read_object(&self, bytes: &[u8], flags: u32) -> JsResult<Value> {
        self.read_object_sab(bytes, flags, &[])
    }

    /// Deserialize with a SharedArrayBuffer payload table.
    pub fn read_object_sab(
        &self,
        bytes: &[u8],
        flags: u32,
        sab_payloads: &[Rc<RefCell<Vec<u8>>>],
    ) -> JsResult<Value> {
        let mut r = Reader {
            ctx: self,
            flags,
            data: bytes,
            pos: 0,
            swapped: false,
            atoms: Vec::new(),
            objects: Vec::new(),
            sab_payloads,
        };
        let result = r.read_stream();
        let atoms = std::mem::take(&mut r.atoms);
        for atom in atoms {
            self.rt.release_atom(atom);
        }
        result
    }
}

impl Reader<'_> {
    fn read_stream(&mut self) -> JsResult<Value> {
        let version = self.read_u8()?;
        if version & !BE_FLAG != BASE_VERSION {
            return Err(self
                .ctx
                .throw_syntax_error("unsupported serialization version"));
        }
        self.swapped = version & BE_FLAG != 0;
        let atom_count = self.read_leb128()? as usize;
        for _ in 0..atom_count {
            let s = self.read_string()?;
            self.atoms.push(self.ctx.rt().intern_string_atom(s));
        }
        self.read_value()
    }

    fn read_u8(&mut self) -> JsResult<u8> {
        let Some(b) = self.data.get(self.pos) else {
            return Err(self.ctx.throw_syntax_error("truncated serialization"));
        };
        self.pos += 1;
        Ok(*b)
    }

    fn read_bytes(&mut self, n: usize) -> JsResult<&[u8]> {
        if self.pos + n > self.data.len() {
            return Err(self.ctx.throw_syntax_error("truncated serialization"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_leb128(&mut self) -> JsResult<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(self.ctx.throw_syntax_error("overlong LEB128"));
            }
        }
    }

    fn read_sleb128(&mut self) -> JsResult<i64> {
        let mut result = 0i64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
            if shift >= 64 {
                return Err(self.ctx.throw_syntax_error("overlong SLEB128"));
            }
        }
    }

    fn read_f64(&mut self) -> JsResult<f64> {
        let swapped = self.swapped;
        let bytes: [u8; 8] = self.read_bytes(8)?.try_into().unwrap();
        let bits = if swapped {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        };
        Ok(f64::from_bits(bits))
    }

    fn read_string(&mut self) -> JsResult<Rc<JsString>> {
        let head = self.read_leb128()?;
        let wide = head & 1 != 0;
        let len = (head >> 1) as usize;
        if wide {
            let swapped = self.swapped;
            let raw = self.read_bytes(len * 2)?;
            let mut units = Vec::with_capacity(len);
            for chunk in raw.chunks_exact(2) {
                let u = if swapped {
                    u16::from_be_bytes([chunk[0], chunk[1]])
                } else {
                    u16::from_le_bytes([chunk[0], chunk[1]])
                };
                units.push(u);
            }
            Ok(JsString::from_utf16(&units))
        } else {
            let raw = self.read_bytes(len)?;
            Ok(JsString::from_latin1(raw))
        }
    }

    fn read_atom(&mut self) -> JsResult<Atom> {
        let raw = self.read_leb128()?;
        if raw & 1 != 0 {
            let idx = (raw >> 1) as u32;
            return Ok(Atom::from_index(idx));
        }
        let table_idx = (raw >> 1) as usize;
        self.atoms
            .get(table_idx)
            .copied()
            .ok_or_else(|| self.ctx.throw_syntax_error("atom reference out of range"))
    }

    fn remember(&mut self, v: Value) -> Value {
        if self.flags & read_flags::REFERENCE != 0 {
            self.objects.push(v.clone());
        }
        v
    }

    fn read_value(&mut self) -> JsResult<Value> {
        let ctx = self.ctx;
        let tag_byte = self.read_u8()?;
        Ok(match tag_byte {
            tag::NULL => Value::Null,
            tag::UNDEFINED => Value::Undefined,
            tag::FALSE => Value::Bool(false),
            tag::TRUE => Value::Bool(true),
            tag::INT32 => Value::Int(self.read_sleb128()? as i32),
            tag::FLOAT64 => Value::number(self.read_f64()?),
            tag::STRING => Value::String(self.read_string()?),
            tag::BIG_INT => {
                let len = self.read_leb128()? as usize;
                let bytes = self.read_bytes(len)?.to_vec();
                Value::BigInt(Rc::new(num_bigint::BigInt::from_signed_bytes_le(&bytes)))
            }
            tag::ARRAY | tag::TEMPLATE_OBJECT => {
                let len = self.read_leb128()? as usize;
                let arr = ctx.new_array();
                let v = self.remember(Value::Object(arr.clone()));
                for i in 0..len {
                    let elem = self.read_value()?;
                    ctx.set_property(&v, Atom::from_index(i as u32), elem, &v, true)?;
                }
                if tag_byte == tag::TEMPLATE_OBJECT {
                    arr.set_flag(obj_flags::EXTENSIBLE, false);
                }
                v
            }
            tag::OBJECT => {
                let count = self.read_leb128()? as usize;
                let obj = ctx.new_plain_object();
                let v = self.remember(Value::Object(obj));
                for _ in 0..count {
                    let atom = self.read_atom()?;
                    let value = self.read_value()?;
                    ctx.set_property(&v, atom, value, &v, true)?;
                }
                v
            }
            tag::ARRAY_BUFFER => {
                let len = self.read_leb128()? as usize;
                let bytes = self.read_bytes(len)?.to_vec();
                self.remember(Value::Object(ctx.new_array_buffer_from(&bytes)))
            }
            tag::SHARED_ARRAY_BUFFER => {
                if self.flags & read_flags::SAB == 0 {
                    return Err(ctx.throw_type_error("SharedArrayBuffer is not allowed here"));
                }
                let idx = self.read_leb128()? as usize;
                let payload = self
                    .sab_payloads
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| ctx.throw_syntax_error("SAB reference out of range"))?;
                self.remember(Value::Object(ctx.new_shared_array_buffer_from(payload)))
            }
            tag::TYPED_ARRAY => {
                let class_id = self.read_u8()? as u16;
                let kind = TypedArrayKind::from_class_id(class_id)
                    .ok_or_else(|| ctx.throw_syntax_error("invalid typed array class"))?;
                let count = self.read_leb128()? as usize;
                let offset = self.read_leb128()? as usize;
                let buffer = self.read_value()?;
                let Some(buffer) = buffer.as_object() else {
                    return Err(ctx.throw_syntax_error("typed array without buffer"));
                };
                let view = ctx.new_typed_array_view(kind, buffer, offset, Some(count))?;
                self.remember(Value::Object(view))
            }
            tag::DATE => {
                let time = self.read_f64()?;
                let obj = ctx.new_object_class(
                    class_ids::DATE,
                    ObjectData::Boxed(Value::number(time)),
                );
                self.remember(Value::Object(obj))
            }
            tag::OBJECT_VALUE => {
                let inner = self.read_value()?;
                let obj = ctx.to_object(&inner)?;
                self.remember(Value::Object(obj))
            }
            tag::OBJECT_REFERENCE => {
                if self.flags & read_flags::REFERENCE == 0 {
                    return Err(ctx.throw_syntax_error("unexpected object reference"));
                }
                let id = self.read_leb128()? as usize;
                self.objects
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ctx.throw_syntax_error("object reference out of range"))?
            }
            tag::FUNCTION_BYTECODE => Value::FunctionBytecode(self.read_function_bytecode()?),
            tag::MODULE => {
                if self.flags & read_flags::BYTECODE == 0 {
                    return Err(ctx.throw_type_error("modules are not allowed here"));
                }
                let name_atom = self.read_atom()?;
                let name = ctx.rt().atom_to_string(name_atom).to_rust_string();
                let module = ctx.new_module(&name);
                let req_count = self.read_leb128()? as usize;
                for _ in 0..req_count {
                    let req = self.read_atom()?;
                    let req_name = ctx.rt().atom_to_string(req).to_rust_string();
                    ctx.module_add_require(&module, &req_name);
                }
                if self.read_u8()? != 0 {
                    let func = self.read_function_bytecode()?;
                    ctx.module_set_function(&module, func);
                }
                Value::Module(module)
            }
            _ => return Err(ctx.throw_syntax_error("unknown serialization tag")),
        })
    }

    fn read_function_bytecode(&mut self) -> JsResult<GcRef<FunctionBytecode>> {
        let ctx = self.ctx;
        if self.flags & read_flags::BYTECODE == 0 {
            return Err(ctx.throw_type_error("function bytecode is not allowed here"));
        }
        let name_atom = self.read_atom()?;
        ctx.rt().dup_atom(name_atom);
        let bits = self.read_u8()?;
        let flags = FunctionFlags {
            strict: bits & 1 != 0,
            is_async: bits & 2 != 0,
            is_generator: bits & 4 != 0,
        };
        let arg_count = self.read_leb128()? as u16;
        let var_count = self.read_leb128()? as u16;
        let cv_count = self.read_leb128()? as usize;
        let mut closure_vars = Vec::with_capacity(cv_count);
        for _ in 0..cv_count {
            let name = self.read_atom()?;
            ctx.rt().dup_atom(name);
            let is_local = self.read_u8()? != 0;
            let idx = self.read_leb128()? as u32;
            closure_vars.push(ClosureVarDef {
                name,
                is_local,
                idx,
            });
        }
        let cpool_count = self.read_leb128()? as usize;
        let mut cpool = Vec::with_capacity(cpool_count);
        for _ in 0..cpool_count {
            cpool.push(self.read_value()?);
        }
        // The body stays unlinked: the compiler collaborator re-attaches
        // executable behavior after reading.
        let func = FunctionBytecode::new(name_atom, flags, arg_count, var_count, closure_vars, None);
        *func.cpool.borrow_mut() = cpool;
        Ok(ctx.rt().heap().alloc(marten_vm_gc::GcKind::FunctionBytecode, func))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leb128_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX >> 1] {
            let mut out = Vec::new();
            write_leb128(&mut out, v);
            let ctx_free_read = {
                let mut pos = 0;
                let mut result = 0u64;
                let mut shift = 0;
                loop {
                    let byte = out[pos];
                    pos += 1;
                    result |= ((byte & 0x7f) as u64) << shift;
                    if byte & 0x80 == 0 {
                        break result;
                    }
                    shift += 7;
                }
            };
            assert_eq!(ctx_free_read, v);
        }
    }

    #[test]
    fn test_sleb128_negative() {
        let mut out = Vec::new();
        write_sleb128(&mut out, -1);
        assert_eq!(out, vec![0x7f]);
        let mut out = Vec::new();
        write_sleb128(&mut out, -128);
        assert_eq!(out, vec![0x80, 0x7f]);
    }
}
