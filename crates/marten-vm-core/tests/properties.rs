//! Invariant-style checks across the value, atom, shape and
//! serialization subsystems.

use std::rc::Rc;

use marten_vm_core::{
    Atom, Context, PropFlags, PropertyDescriptor, Runtime, Value, read_flags, write_flags,
};

fn new_engine() -> (Runtime, Context) {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    (rt, ctx)
}

fn set(ctx: &Context, obj: &Value, key: &str, v: Value) {
    let atom = ctx.rt().intern_atom(key);
    ctx.set_property(obj, atom, v, obj, true).unwrap();
    ctx.rt().release_atom(atom);
}

fn get(ctx: &Context, obj: &Value, key: &str) -> Value {
    let atom = ctx.rt().intern_atom(key);
    let v = ctx.get_property_value(obj, atom).unwrap();
    ctx.rt().release_atom(atom);
    v
}

#[test]
fn test_to_boolean_is_idempotent_and_total() {
    let (_rt, ctx) = new_engine();
    let samples = vec![
        Value::Undefined,
        Value::Null,
        Value::Bool(true),
        Value::Bool(false),
        Value::Int(0),
        Value::Int(7),
        Value::Float(f64::NAN),
        Value::Float(-0.0),
        Value::string(""),
        Value::string("x"),
        Value::Object(ctx.new_plain_object()),
    ];
    for v in samples {
        let once = ctx.to_boolean(&v);
        let twice = ctx.to_boolean(&Value::Bool(once));
        assert_eq!(once, twice);
    }
}

#[test]
fn test_string_bytes_roundtrip() {
    use marten_vm_core::JsString;
    for s in ["", "ascii", "caf\u{e9}", "日本語", "a😀b"] {
        let original = JsString::from_str(s);
        let units: Vec<u16> = original.code_units().collect();
        let back = JsString::from_utf16(&units);
        assert_eq!(*original, *back);
        assert_eq!(original.is_wide(), back.is_wide());
    }
}

#[test]
fn test_define_then_get_own_reports_effective_flags() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let key = ctx.rt().intern_atom("k");
    for (w, e, c) in [
        (true, true, true),
        (true, false, true),
        (false, true, false),
        (false, false, false),
    ] {
        ctx.define_property(
            &obj,
            key,
            &PropertyDescriptor::data(Value::Int(1), w, e, c),
            true,
        )
        .unwrap();
        let own = ctx.get_own_property(&obj, key).unwrap().unwrap();
        assert_eq!(own.flags.has(PropFlags::WRITABLE), w);
        assert_eq!(own.flags.has(PropFlags::ENUMERABLE), e);
        assert_eq!(own.flags.has(PropFlags::CONFIGURABLE), c);
        if !c {
            break; // further transitions are restricted from here
        }
    }
    ctx.rt().release_atom(key);
}

#[test]
fn test_non_configurable_transitions_are_refused() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let key = ctx.rt().intern_atom("k");
    ctx.define_property(
        &obj,
        key,
        &PropertyDescriptor::data(Value::Int(1), false, false, false),
        true,
    )
    .unwrap();
    // configurable: false → true is refused.
    let err = ctx.define_property(
        &obj,
        key,
        &PropertyDescriptor {
            configurable: Some(true),
            ..Default::default()
        },
        true,
    );
    assert!(err.is_err());
    let _ = ctx.get_exception();
    // value change through a non-writable property is refused.
    let err = ctx.define_property(
        &obj,
        key,
        &PropertyDescriptor {
            value: Some(Value::Int(2)),
            ..Default::default()
        },
        true,
    );
    assert!(err.is_err());
    let _ = ctx.get_exception();
    // data → accessor on non-configurable is refused.
    let err = ctx.define_property(
        &obj,
        key,
        &PropertyDescriptor::accessor(None, None, false, false),
        true,
    );
    assert!(err.is_err());
    let _ = ctx.get_exception();
    ctx.rt().release_atom(key);
}

#[test]
fn test_shape_prop_count_matches_storage() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let ov = Value::Object(obj.clone());
    for i in 0..12 {
        set(&ctx, &ov, &format!("p{i}"), Value::Int(i));
    }
    let shape = obj.shape();
    // The property-values array always matches the shape entry count.
    assert_eq!(shape.prop_count(), obj.prop_len());
    let live = (0..shape.prop_count())
        .filter(|i| !shape.prop(*i).atom.is_null())
        .count();
    assert_eq!(live + shape.deleted_count() as usize, shape.prop_count());
    // Delete a few and recheck the partition.
    for i in 0..5 {
        let atom = ctx.rt().intern_atom(&format!("p{i}"));
        ctx.delete_property(&obj, atom).unwrap();
        ctx.rt().release_atom(atom);
    }
    let shape = obj.shape();
    assert_eq!(shape.prop_count(), obj.prop_len());
    let live = (0..shape.prop_count())
        .filter(|i| !shape.prop(*i).atom.is_null())
        .count();
    assert_eq!(live + shape.deleted_count() as usize, shape.prop_count());
}

#[test]
fn test_atom_interning_idempotent_through_runtime() {
    let (rt, _ctx) = new_engine();
    let a = rt.intern_atom("payload");
    let b = rt.intern_atom("payload");
    assert_eq!(a, b);
    rt.release_atom(a);
    // Still alive through b.
    assert!(rt.atom_to_string(b).eq_str("payload"));
    rt.release_atom(b);
}

#[test]
fn test_gc_survivors_have_positive_refcounts() {
    let (rt, ctx) = new_engine();
    let keep = ctx.new_plain_object();
    let kv = Value::Object(keep.clone());
    set(&ctx, &kv, "self", kv.clone());
    rt.run_gc();
    // The self-cycle survives through the external handle.
    assert!(keep.ref_count() >= 1);
    assert_eq!(get(&ctx, &kv, "self").as_object().map(|o| o.addr()), Some(keep.addr()));
}

#[test]
fn test_serialize_roundtrip_structural() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let ov = Value::Object(obj.clone());
    set(&ctx, &ov, "int", Value::Int(-42));
    set(&ctx, &ov, "float", Value::Float(1.5));
    set(&ctx, &ov, "neg_zero", Value::Float(-0.0));
    set(&ctx, &ov, "nan", Value::Float(f64::NAN));
    set(&ctx, &ov, "text", Value::string("caf\u{e9} ≤"));
    set(&ctx, &ov, "flag", Value::Bool(true));
    set(&ctx, &ov, "nothing", Value::Null);
    let arr = ctx.new_array_from(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    set(&ctx, &ov, "list", Value::Object(arr));
    set(
        &ctx,
        &ov,
        "big",
        Value::BigInt(Rc::new(num_bigint::BigInt::parse_bytes(b"-123456789012345678901234567890", 10).unwrap())),
    );

    let written = ctx.write_object(&ov, 0).unwrap();
    let back = ctx.read_object(&written.bytes, 0).unwrap();

    assert_eq!(get(&ctx, &back, "int").as_int(), Some(-42));
    assert_eq!(get(&ctx, &back, "float").as_number(), Some(1.5));
    // SameValueZero on numbers: -0 may come back as +0.
    assert!(Value::same_value_zero(
        &get(&ctx, &back, "neg_zero"),
        &Value::Float(-0.0)
    ));
    assert!(get(&ctx, &back, "nan").as_number().unwrap().is_nan());
    assert_eq!(
        get(&ctx, &back, "text").as_string().unwrap().to_rust_string(),
        "caf\u{e9} ≤"
    );
    assert_eq!(get(&ctx, &back, "flag").as_bool(), Some(true));
    assert!(get(&ctx, &back, "nothing").is_null());
    let list = get(&ctx, &back, "list");
    assert_eq!(get(&ctx, &list, "length").as_number(), Some(3.0));
    assert_eq!(
        ctx.get_property_value(&list, Atom::from_index(2)).unwrap().as_int(),
        Some(3)
    );
    assert_eq!(
        get(&ctx, &back, "big").as_bigint().unwrap().to_string(),
        "-123456789012345678901234567890"
    );
}

#[test]
fn test_serialize_rejects_cycles_without_reference_flag() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let ov = Value::Object(obj.clone());
    set(&ctx, &ov, "me", ov.clone());
    assert!(ctx.write_object(&ov, 0).is_err());
    let _ = ctx.get_exception();
}

#[test]
fn test_serialize_cycles_with_reference_flag() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let ov = Value::Object(obj.clone());
    set(&ctx, &ov, "me", ov.clone());
    set(&ctx, &ov, "n", Value::Int(5));
    let written = ctx
        .write_object(&ov, write_flags::REFERENCE)
        .unwrap();
    let back = ctx
        .read_object(&written.bytes, read_flags::REFERENCE)
        .unwrap();
    let me = get(&ctx, &back, "me");
    assert!(Value::strict_eq(&me, &back), "identity restored");
    assert_eq!(get(&ctx, &back, "n").as_int(), Some(5));
}

#[test]
fn test_serialize_typed_array_and_buffer() {
    let (_rt, ctx) = new_engine();
    let view = ctx.new_typed_array(marten_vm_core::TypedArrayKind::Uint16, 3);
    ctx.typed_array_set(&view, 0, &Value::Int(1), true).unwrap();
    ctx.typed_array_set(&view, 1, &Value::Int(513), true).unwrap();
    ctx.typed_array_set(&view, 2, &Value::Int(65535), true).unwrap();
    let written = ctx.write_object(&Value::Object(view), 0).unwrap();
    let back = ctx.read_object(&written.bytes, 0).unwrap();
    let view2 = back.as_object().unwrap();
    assert_eq!(ctx.typed_array_length(view2).unwrap(), 3);
    assert_eq!(ctx.typed_array_get(view2, 1).unwrap().as_int(), Some(513));
    assert_eq!(ctx.typed_array_get(view2, 2).unwrap().as_int(), Some(65535));
}

#[test]
fn test_serialize_shared_buffer_by_payload() {
    let (_rt, ctx) = new_engine();
    let sab = ctx.new_shared_array_buffer(4);
    ctx.with_array_buffer(&sab, |b| {
        b.with_bytes_mut(|bytes| bytes[0] = 7);
    })
    .unwrap();
    let written = ctx
        .write_object(&Value::Object(sab.clone()), write_flags::SAB)
        .unwrap();
    assert_eq!(written.sab_payloads.len(), 1);
    let back = ctx
        .read_object_sab(&written.bytes, read_flags::SAB, &written.sab_payloads)
        .unwrap();
    let sab2 = back.as_object().unwrap();
    // Same payload: a write through one side is visible on the other.
    ctx.with_array_buffer(sab2, |b| {
        b.with_bytes_mut(|bytes| bytes[1] = 9);
    })
    .unwrap();
    let seen = ctx
        .with_array_buffer(&sab, |b| b.with_bytes(|bytes| (bytes[0], bytes[1])))
        .unwrap()
        .unwrap();
    assert_eq!(seen, (7, 9));
}

#[test]
fn test_serialize_version_check_and_unknown_tag() {
    let (_rt, ctx) = new_engine();
    let written = ctx.write_object(&Value::Int(1), 0).unwrap();
    // Corrupt the version byte.
    let mut bad = written.bytes.clone();
    bad[0] = 0x01;
    assert!(ctx.read_object(&bad, 0).is_err());
    let _ = ctx.get_exception();
    // Corrupt the tag.
    let mut bad = written.bytes.clone();
    let last = bad.len() - 2;
    bad[last] = 0xEE;
    assert!(ctx.read_object(&bad, 0).is_err());
    let _ = ctx.get_exception();
}

#[test]
fn test_serialize_byte_swapped_stream() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let ov = Value::Object(obj);
    set(&ctx, &ov, "pi", Value::Float(3.25));
    set(&ctx, &ov, "wide", Value::string("日本"));
    let written = ctx
        .write_object(&ov, write_flags::BYTE_SWAP)
        .unwrap();
    assert_eq!(written.bytes[0] & 0x40, 0x40, "big-endian bit set");
    let back = ctx.read_object(&written.bytes, 0).unwrap();
    assert_eq!(get(&ctx, &back, "pi").as_number(), Some(3.25));
    assert_eq!(
        get(&ctx, &back, "wide").as_string().unwrap().to_rust_string(),
        "日本"
    );
}

#[test]
fn test_array_length_view_after_truncation() {
    let (_rt, ctx) = new_engine();
    let arr = ctx.new_array_from((0..10).map(Value::Int).collect());
    let av = Value::Object(arr.clone());
    set(&ctx, &av, "length", Value::Int(4));
    for i in 4..10 {
        assert!(
            ctx.get_property_value(&av, Atom::from_index(i))
                .unwrap()
                .is_undefined()
        );
    }
    assert_eq!(get(&ctx, &av, "length").as_number(), Some(4.0));
    assert_eq!(
        ctx.get_property_value(&av, Atom::from_index(3)).unwrap().as_int(),
        Some(3)
    );
}

#[test]
fn test_weak_ref_clears_when_target_dies() {
    let (_rt, ctx) = new_engine();
    let target = ctx.new_plain_object();
    let weak = ctx.new_weak_ref(&Value::Object(target.clone())).unwrap();
    assert!(ctx.weak_ref_deref(&weak).unwrap().is_object());
    drop(target);
    assert!(ctx.weak_ref_deref(&weak).unwrap().is_undefined());
}

#[test]
fn test_exception_channel_single_slot() {
    let (rt, ctx) = new_engine();
    assert!(!rt.has_exception());
    let _ = ctx.throw_type_error("first");
    assert!(rt.has_exception());
    let exc = ctx.get_exception();
    assert!(!rt.has_exception());
    assert_eq!(ctx.error_to_string(&exc), "TypeError: first");
    // The error carries a stack property (possibly empty outside calls).
    let stack = get(&ctx, &exc, "stack");
    assert!(stack.is_string());
}

#[test]
fn test_uncatchable_flag() {
    let (rt, ctx) = new_engine();
    let _ = ctx.throw_out_of_memory();
    assert!(rt.is_uncatchable());
    let _ = ctx.get_exception();
    assert!(!rt.is_uncatchable());
}

#[test]
fn test_primitive_get_on_string_values() {
    let (_rt, ctx) = new_engine();
    let s = Value::string("hello");
    assert_eq!(get(&ctx, &s, "length").as_number(), Some(5.0));
    assert_eq!(
        ctx.get_property_value(&s, Atom::from_index(1))
            .unwrap()
            .as_string()
            .unwrap()
            .to_rust_string(),
        "e"
    );
}
