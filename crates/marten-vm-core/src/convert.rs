//! Abstract conversions
//!
//! `ToBoolean`/`ToNumber`/`ToString`/`ToPrimitive`/`ToObject`/
//! `ToPropertyKey` and the integer clamps. Number-to-string uses `itoa`
//! for exact integers and `ryu` shortest form otherwise.

use std::rc::Rc;

use marten_vm_gc::GcRef;
use num_traits::ToPrimitive;

use crate::atom::Atom;
use crate::context::Context;
use crate::error::JsResult;
use crate::object::{JsObject, ObjectData, class_ids, obj_flags};
use crate::string::JsString;
use crate::value::Value;

/// `ToPrimitive` hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveHint {
    /// No preference (`"default"`)
    Default,
    /// Prefer `valueOf`
    Number,
    /// Prefer `toString`
    String,
}

/// JavaScript rendering of a number.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n == n.trunc() && n.abs() < 1e21 {
        if (i64::MIN as f64..=i64::MAX as f64).contains(&n) {
            let mut buf = itoa::Buffer::new();
            return buf.format(n as i64).to_string();
        }
        return format!("{n:.0}");
    }
    let mut buf = ryu::Buffer::new();
    let s = buf.format(n);
    // ryu writes `1e30`/`1.5e-7`; JavaScript writes `1e+30`/`1.5e-7`.
    match s.find('e') {
        Some(pos) if !s[pos + 1..].starts_with('-') => {
            format!("{}e+{}", &s[..pos], &s[pos + 1..])
        }
        _ => s.to_string(),
    }
}

/// JavaScript string-to-number (the `Number("…")` rules).
pub fn string_to_number(s: &JsString) -> f64 {
    let text = s.to_rust_string();
    let trimmed = text.trim_matches(|c: char| {
        c.is_whitespace() || c == '\u{FEFF}' || c == '\u{00A0}'
    });
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let radix_parse = |body: &str, radix: u32| -> f64 {
        match u64::from_str_radix(body, radix) {
            Ok(v) => v as f64,
            Err(_) => f64::NAN,
        }
    };
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return radix_parse(hex, 16);
    }
    if let Some(oct) = trimmed.strip_prefix("0o").or_else(|| trimmed.strip_prefix("0O")) {
        return radix_parse(oct, 8);
    }
    if let Some(bin) = trimmed.strip_prefix("0b").or_else(|| trimmed.strip_prefix("0B")) {
        return radix_parse(bin, 2);
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

impl Context {
    /// `ToBoolean` (total).
    pub fn to_boolean(&self, v: &Value) -> bool {
        match v {
            Value::Undefined | Value::Null | Value::Uninitialized => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::BigInt(b) => b.to_f64() != Some(0.0),
            Value::Object(o) => !o.has_flag(obj_flags::HTMLDDA),
            _ => true,
        }
    }

    /// `ToNumber`.
    pub fn to_number(&self, v: &Value) -> JsResult<f64> {
        match v {
            Value::Undefined => Ok(f64::NAN),
            Value::Null => Ok(0.0),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::String(s) => Ok(string_to_number(s)),
            Value::Symbol(_) => Err(self.throw_type_error("cannot convert a symbol to a number")),
            Value::BigInt(_) => Err(self.throw_type_error("cannot convert a BigInt to a number")),
            Value::Object(_) => {
                let prim = self.to_primitive(v, PrimitiveHint::Number)?;
                self.to_number(&prim)
            }
            _ => Ok(f64::NAN),
        }
    }

    /// `ToInt32`.
    pub fn to_int32(&self, v: &Value) -> JsResult<i32> {
        if let Value::Int(i) = v {
            return Ok(*i);
        }
        let n = self.to_number(v)?;
        if !n.is_finite() {
            return Ok(0);
        }
        Ok(n as i64 as u32 as i32)
    }

    /// `ToUint32`.
    pub fn to_uint32(&self, v: &Value) -> JsResult<u32> {
        Ok(self.to_int32(v)? as u32)
    }

    /// `ToString`.
    pub fn to_string(&self, v: &Value) -> JsResult<Rc<JsString>> {
        match v {
            Value::Undefined => Ok(JsString::from_str("undefined")),
            Value::Null => Ok(JsString::from_str("null")),
            Value::Bool(b) => Ok(JsString::from_str(if *b { "true" } else { "false" })),
            Value::Int(i) => {
                let mut buf = itoa::Buffer::new();
                Ok(JsString::from_str(buf.format(*i)))
            }
            Value::Float(f) => Ok(JsString::from_str(&number_to_string(*f))),
            Value::String(s) => Ok(s.clone()),
            Value::Symbol(_) => Err(self.throw_type_error("cannot convert a symbol to a string")),
            Value::BigInt(b) => Ok(JsString::from_str(&b.to_string())),
            Value::Object(_) => {
                let prim = self.to_primitive(v, PrimitiveHint::String)?;
                self.to_string(&prim)
            }
            Value::FunctionBytecode(_) => Ok(JsString::from_str("function")),
            Value::Module(_) => Ok(JsString::from_str("[object Module]")),
            Value::Uninitialized => Ok(JsString::from_str("undefined")),
        }
    }

    /// `ToPrimitive` with `@@toPrimitive` dispatch.
    pub fn to_primitive(&self, v: &Value, hint: PrimitiveHint) -> JsResult<Value> {
        let Value::Object(_) = v else {
            return Ok(v.clone());
        };
        let symbols = self.realm.symbols();
        let to_prim_atom = self.rt.intern_symbol_atom(&symbols.to_primitive);
        let method = self.get_property_value(v, to_prim_atom);
        self.rt.release_atom(to_prim_atom);
        let method = method?;
        if self.is_callable(&method) {
            let hint_str = match hint {
                PrimitiveHint::Default => "default",
                PrimitiveHint::Number => "number",
                PrimitiveHint::String => "string",
            };
            let result = self.call(&method, v, &[Value::string(hint_str)])?;
            if !result.is_object() {
                return Ok(result);
            }
            return Err(self.throw_type_error("@@toPrimitive returned an object"));
        }
        let common = self.rt.common_atoms();
        let order = if hint == PrimitiveHint::String {
            [common.to_string, common.value_of]
        } else {
            [common.value_of, common.to_string]
        };
        for atom in order {
            let f = self.get_property_value(v, atom)?;
            if self.is_callable(&f) {
                let r = self.call(&f, v, &[])?;
                if !r.is_object() {
                    return Ok(r);
                }
            }
        }
        Err(self.throw_type_error("cannot convert object to primitive value"))
    }

    /// `ToObject`: wrap primitives in their wrapper classes.
    pub fn to_object(&self, v: &Value) -> JsResult<GcRef<JsObject>> {
        match v {
            Value::Object(o) => Ok(o.clone()),
            Value::Undefined | Value::Null => {
                Err(self.throw_type_error("cannot convert undefined or null to object"))
            }
            Value::Int(_) | Value::Float(_) => {
                Ok(self.new_object_class(class_ids::NUMBER, ObjectData::Boxed(v.clone())))
            }
            Value::String(_) => {
                let obj = self.new_object_class(class_ids::STRING, ObjectData::Boxed(v.clone()));
                Ok(obj)
            }
            Value::Bool(_) => {
                Ok(self.new_object_class(class_ids::BOOLEAN, ObjectData::Boxed(v.clone())))
            }
            Value::Symbol(_) => {
                Ok(self.new_object_class(class_ids::SYMBOL, ObjectData::Boxed(v.clone())))
            }
            _ => Err(self.throw_type_error("cannot convert value to object")),
        }
    }

    /// `ToPropertyKey`: returns an owned atom reference (release it).
    pub fn to_property_key(&self, v: &Value) -> JsResult<Atom> {
        match v {
            Value::String(s) => Ok(self.rt.intern_string_atom(s.clone())),
            Value::Symbol(sym) => Ok(self.rt.intern_symbol_atom(sym)),
            Value::Int(i) if *i >= 0 => Ok(Atom::from_index(*i as u32)),
            _ => {
                let prim = self.to_primitive(v, PrimitiveHint::String)?;
                if let Value::Symbol(sym) = &prim {
                    return Ok(self.rt.intern_symbol_atom(sym));
                }
                let s = self.to_string(&prim)?;
                Ok(self.rt.intern_string_atom(s))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_to_string_integers() {
        assert_eq!(number_to_string(0.0), "0");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(42.0), "42");
        assert_eq!(number_to_string(-7.0), "-7");
    }

    #[test]
    fn test_number_to_string_specials() {
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(number_to_string(0.5), "0.5");
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number(&JsString::from_str("  42 ")), 42.0);
        assert_eq!(string_to_number(&JsString::from_str("")), 0.0);
        assert_eq!(string_to_number(&JsString::from_str("0x10")), 16.0);
        assert_eq!(string_to_number(&JsString::from_str("0b101")), 5.0);
        assert!(string_to_number(&JsString::from_str("12px")).is_nan());
        assert_eq!(
            string_to_number(&JsString::from_str("-Infinity")),
            f64::NEG_INFINITY
        );
    }
}
