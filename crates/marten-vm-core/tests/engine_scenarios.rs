//! End-to-end scenarios exercising the core subsystems together.

use std::cell::RefCell;
use std::rc::Rc;

use marten_vm_core::{Atom, Context, GcRef, PropertyDescriptor, Runtime, Value, class_ids};

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
fn test_cycle_collection_frees_the_pair() {
    let (rt, ctx) = new_engine();
    rt.run_gc();
    let before = rt.heap().live_count();
    {
        let a = ctx.new_plain_object();
        let b = ctx.new_plain_object();
        let av = Value::Object(a.clone());
        let bv = Value::Object(b.clone());
        set(&ctx, &av, "b", bv.clone());
        set(&ctx, &bv, "a", av.clone());
        // Both survive their handles: the cycle holds a refcount each.
        drop(a);
        drop(b);
        drop(av);
        drop(bv);
    }
    assert!(rt.heap().live_count() > before);
    let stats = rt.run_gc();
    assert!(stats.freed_objects >= 2);
    assert_eq!(rt.heap().live_count(), before);
}

#[test]
fn test_shape_sharing_and_divergence() {
    let (_rt, ctx) = new_engine();
    let o1 = ctx.new_plain_object();
    let o2 = ctx.new_plain_object();
    let v1 = Value::Object(o1.clone());
    let v2 = Value::Object(o2.clone());
    set(&ctx, &v1, "x", Value::Int(1));
    set(&ctx, &v1, "y", Value::Int(2));
    set(&ctx, &v2, "x", Value::Int(3));
    set(&ctx, &v2, "y", Value::Int(4));
    // Same property sequence, same prototype: one interned shape.
    assert!(GcRef::ptr_eq(&o1.shape(), &o2.shape()));

    let shared = o2.shape();
    set(&ctx, &v1, "z", Value::Int(5));
    assert!(!GcRef::ptr_eq(&o1.shape(), &o2.shape()));
    assert!(GcRef::ptr_eq(&o2.shape(), &shared));
    assert_eq!(get(&ctx, &v2, "x").as_int(), Some(3));
    assert_eq!(get(&ctx, &v1, "z").as_int(), Some(5));
}

#[test]
fn test_promise_reaction_ordering() {
    let (rt, ctx) = new_engine();
    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let make_logger = |prefix: &'static str| {
        let log = log.clone();
        Value::Object(ctx.new_native_function(
            "",
            1,
            Rc::new(move |ctx, _this, args, _data, _magic| {
                let v = args.first().cloned().unwrap_or(Value::Undefined);
                let n = ctx.to_string(&v).unwrap().to_rust_string();
                log.borrow_mut().push(format!("{prefix}{n}"));
                Ok(Value::Undefined)
            }),
        ))
    };

    let p1 = ctx.promise_resolve(&Value::Int(1)).unwrap();
    let p2 = ctx.promise_resolve(&Value::Int(2)).unwrap();
    ctx.promise_then(&p1, Some(make_logger("a")), None).unwrap();
    ctx.promise_then(&p2, Some(make_logger("b")), None).unwrap();
    assert!(log.borrow().is_empty(), "reactions never run inline");

    while rt.execute_pending_job().unwrap().is_some() {}
    assert_eq!(&*log.borrow(), &["a1".to_string(), "b2".to_string()]);
}

#[test]
fn test_promise_settled_before_then_still_defers() {
    let (rt, ctx) = new_engine();
    let log: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let p = ctx.promise_resolve(&Value::Int(7)).unwrap();
    // Settle first, subscribe afterwards: the value is buffered.
    let log2 = log.clone();
    let f = Value::Object(ctx.new_native_function(
        "",
        1,
        Rc::new(move |_ctx, _this, args, _data, _magic| {
            log2.borrow_mut()
                .push(args.first().and_then(|v| v.as_int()).unwrap_or(-1));
            Ok(Value::Undefined)
        }),
    ));
    ctx.promise_then(&p, Some(f), None).unwrap();
    assert!(log.borrow().is_empty());
    while rt.execute_pending_job().unwrap().is_some() {}
    assert_eq!(&*log.borrow(), &[7]);
}

#[test]
fn test_proxy_frozen_target_invariant() {
    let (_rt, ctx) = new_engine();
    let target = ctx.new_plain_object();
    let a = ctx.rt().intern_atom("a");
    ctx.define_property(
        &target,
        a,
        &PropertyDescriptor::data(Value::Int(1), false, true, false),
        true,
    )
    .unwrap();
    ctx.prevent_extensions(&target).unwrap();

    let handler = ctx.new_plain_object();
    let hv = Value::Object(handler.clone());
    let get_trap = Value::Object(ctx.new_native_function(
        "",
        3,
        Rc::new(|_ctx, _this, _args, _data, _magic| Ok(Value::Int(2))),
    ));
    set(&ctx, &hv, "get", get_trap);

    let proxy = ctx
        .new_proxy(&Value::Object(target), &Value::Object(handler))
        .unwrap();
    let result = ctx.get_property_value(&Value::Object(proxy), a);
    assert!(result.is_err(), "invariant violation must throw");
    let exc = ctx.get_exception();
    assert!(ctx.error_to_string(&exc).starts_with("TypeError"));
    ctx.rt().release_atom(a);
}

#[test]
fn test_proxy_without_trap_forwards() {
    let (_rt, ctx) = new_engine();
    let target = ctx.new_plain_object();
    let tv = Value::Object(target.clone());
    set(&ctx, &tv, "k", Value::Int(9));
    let handler = ctx.new_plain_object();
    let proxy = ctx
        .new_proxy(&tv, &Value::Object(handler))
        .unwrap();
    let pv = Value::Object(proxy.clone());
    assert_eq!(get(&ctx, &pv, "k").as_int(), Some(9));
    // Revocation turns every operation into a TypeError.
    ctx.revoke_proxy(&proxy);
    let atom = ctx.rt().intern_atom("k");
    assert!(ctx.get_property_value(&pv, atom).is_err());
    let _ = ctx.get_exception();
    ctx.rt().release_atom(atom);
}

#[test]
fn test_fast_array_degrades_on_accessor_element() {
    let (_rt, ctx) = new_engine();
    let arr = ctx.new_array_from(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert!(arr.is_fast_array());

    let getter = Value::Object(ctx.new_native_function(
        "",
        0,
        Rc::new(|_ctx, _this, _args, _data, _magic| Ok(Value::Int(9))),
    ));
    let one = Atom::from_index(1);
    ctx.define_property(
        &arr,
        one,
        &PropertyDescriptor::accessor(Some(getter), None, true, true),
        true,
    )
    .unwrap();

    assert!(!arr.is_fast_array());
    let av = Value::Object(arr.clone());
    assert_eq!(ctx.get_property_value(&av, one).unwrap().as_int(), Some(9));
    assert_eq!(get(&ctx, &av, "length").as_number(), Some(3.0));
    // The array still takes new elements and grows its length.
    ctx.set_property(&av, Atom::from_index(3), Value::Int(4), &av, true)
        .unwrap();
    assert_eq!(get(&ctx, &av, "length").as_number(), Some(4.0));
    assert_eq!(
        ctx.get_property_value(&av, Atom::from_index(3))
            .unwrap()
            .as_int(),
        Some(4)
    );
}

#[test]
fn test_fast_array_interior_delete_degrades() {
    let (_rt, ctx) = new_engine();
    let arr = ctx.new_array_from(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    // Popping the last element keeps the fast path.
    ctx.delete_property(&arr, Atom::from_index(2)).unwrap();
    assert!(arr.is_fast_array());
    // Deleting an interior element leaves a hole and degrades.
    ctx.delete_property(&arr, Atom::from_index(0)).unwrap();
    assert!(!arr.is_fast_array());
    let av = Value::Object(arr.clone());
    assert!(
        ctx.get_property_value(&av, Atom::from_index(0))
            .unwrap()
            .is_undefined()
    );
    assert_eq!(
        ctx.get_property_value(&av, Atom::from_index(1))
            .unwrap()
            .as_int(),
        Some(2)
    );
}

#[test]
fn test_set_array_length_truncates_and_stops() {
    let (_rt, ctx) = new_engine();
    let arr = ctx.new_array_from((0..6).map(Value::Int).collect());
    let av = Value::Object(arr.clone());
    // Fast truncation.
    set(&ctx, &av, "length", Value::Int(3));
    assert_eq!(get(&ctx, &av, "length").as_number(), Some(3.0));
    assert!(
        ctx.get_property_value(&av, Atom::from_index(4))
            .unwrap()
            .is_undefined()
    );

    // Pin index 1 non-configurable, then shrink to 0: truncation stops
    // just above the pinned element.
    ctx.define_property(
        &arr,
        Atom::from_index(1),
        &PropertyDescriptor::data(Value::Int(1), true, true, false),
        true,
    )
    .unwrap();
    assert!(!arr.is_fast_array());
    let atom = ctx.rt().intern_atom("length");
    let ok = ctx
        .set_property(&av, atom, Value::Int(0), &av, false)
        .unwrap();
    ctx.rt().release_atom(atom);
    assert!(!ok);
    assert_eq!(get(&ctx, &av, "length").as_number(), Some(2.0));
}

#[test]
fn test_weak_map_entry_dies_with_key() {
    let (_rt, ctx) = new_engine();
    let map = ctx.new_map_like(class_ids::WEAK_MAP);
    let key = ctx.new_plain_object();
    ctx.map_set(&map, &Value::Object(key.clone()), Value::Int(1))
        .unwrap();
    assert_eq!(ctx.map_size(&map).unwrap(), 1);
    assert!(ctx.map_has(&map, &Value::Object(key.clone())).unwrap());
    // Dropping the last strong reference evicts the entry eagerly.
    drop(key);
    assert_eq!(ctx.map_size(&map).unwrap(), 0);
}

#[test]
fn test_map_same_value_zero_keys() {
    let (_rt, ctx) = new_engine();
    let map = ctx.new_map_like(class_ids::MAP);
    ctx.map_set(&map, &Value::Float(-0.0), Value::string("zero"))
        .unwrap();
    assert_eq!(
        ctx.map_get(&map, &Value::Int(0))
            .unwrap()
            .as_string()
            .unwrap()
            .to_rust_string(),
        "zero"
    );
    ctx.map_set(&map, &Value::Float(f64::NAN), Value::string("nan"))
        .unwrap();
    assert!(ctx.map_has(&map, &Value::Float(f64::NAN)).unwrap());
    assert_eq!(ctx.map_size(&map).unwrap(), 2);
}

#[test]
fn test_typed_array_detach_semantics() {
    let (_rt, ctx) = new_engine();
    let buffer = ctx.new_array_buffer(8);
    let view = ctx
        .new_typed_array_view(
            marten_vm_core::TypedArrayKind::Int32,
            &buffer,
            0,
            Some(2),
        )
        .unwrap();
    ctx.typed_array_set(&view, 0, &Value::Int(42), true).unwrap();
    assert_eq!(ctx.typed_array_get(&view, 0).unwrap().as_int(), Some(42));

    ctx.detach_array_buffer(&buffer).unwrap();
    assert_eq!(ctx.typed_array_length(&view).unwrap(), 0);
    assert!(ctx.typed_array_get(&view, 0).unwrap().is_undefined());
    // Writes after detach coerce, then drop silently without throw.
    assert!(!ctx.typed_array_set(&view, 0, &Value::Int(1), false).unwrap());
}

#[test]
fn test_uint8_clamped_and_bigint_elements() {
    let (_rt, ctx) = new_engine();
    let clamped = ctx.new_typed_array(marten_vm_core::TypedArrayKind::Uint8Clamped, 2);
    ctx.typed_array_set(&clamped, 0, &Value::Int(300), true).unwrap();
    ctx.typed_array_set(&clamped, 1, &Value::Int(-5), true).unwrap();
    assert_eq!(ctx.typed_array_get(&clamped, 0).unwrap().as_int(), Some(255));
    assert_eq!(ctx.typed_array_get(&clamped, 1).unwrap().as_int(), Some(0));

    let big = ctx.new_typed_array(marten_vm_core::TypedArrayKind::BigInt64, 1);
    assert!(ctx.typed_array_set(&big, 0, &Value::Int(1), true).is_err());
    let _ = ctx.get_exception();
    let bv = Value::BigInt(Rc::new(num_bigint::BigInt::from(-7i64)));
    ctx.typed_array_set(&big, 0, &bv, true).unwrap();
    let back = ctx.typed_array_get(&big, 0).unwrap();
    assert_eq!(back.as_bigint().map(|b| b.to_string()), Some("-7".into()));
}

#[test]
fn test_for_in_snapshot_skips_deleted() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let ov = Value::Object(obj.clone());
    set(&ctx, &ov, "a", Value::Int(1));
    set(&ctx, &ov, "b", Value::Int(2));
    set(&ctx, &ov, "c", Value::Int(3));
    let iter = ctx.build_for_in_iterator(&ov).unwrap();
    // Delete "b" mid-iteration: the snapshot contains it, next() skips it.
    let b = ctx.rt().intern_atom("b");
    ctx.delete_property(&obj, b).unwrap();
    ctx.rt().release_atom(b);
    let mut seen = Vec::new();
    while let Some(key) = ctx.for_in_next(&iter).unwrap() {
        seen.push(key.as_string().unwrap().to_rust_string());
    }
    assert_eq!(seen, vec!["a".to_string(), "c".to_string()]);
}

#[test]
fn test_bound_function_and_call_helpers() {
    let (_rt, ctx) = new_engine();
    let add = Value::Object(ctx.new_native_function(
        "add",
        2,
        Rc::new(|ctx, this, args, _data, _magic| {
            let base = ctx.to_number(this).unwrap_or(0.0);
            let a = args.first().map(|v| v.as_number().unwrap_or(0.0)).unwrap_or(0.0);
            let b = args.get(1).map(|v| v.as_number().unwrap_or(0.0)).unwrap_or(0.0);
            Ok(Value::number(base + a + b))
        }),
    ));
    let bound = ctx
        .new_bound_function(&add, &Value::Int(100), &[Value::Int(10)])
        .unwrap();
    let result = ctx
        .call(&Value::Object(bound.clone()), &Value::Undefined, &[Value::Int(1)])
        .unwrap();
    assert_eq!(result.as_number(), Some(111.0));
    let bv = Value::Object(bound);
    assert_eq!(
        get(&ctx, &bv, "name").as_string().unwrap().to_rust_string(),
        "bound add"
    );
    assert_eq!(get(&ctx, &bv, "length").as_number(), Some(1.0));
}

#[test]
fn test_interrupt_handler_aborts_calls() {
    let (rt, ctx) = new_engine();
    let noop = Value::Object(ctx.new_native_function(
        "",
        0,
        Rc::new(|_ctx, _this, _args, _data, _magic| Ok(Value::Undefined)),
    ));
    rt.set_interrupt_handler(Some(Box::new(|| true)));
    assert!(ctx.call(&noop, &Value::Undefined, &[]).is_err());
    let exc = ctx.get_exception();
    assert!(ctx.error_to_string(&exc).starts_with("InternalError"));
    rt.set_interrupt_handler(None);
    assert!(ctx.call(&noop, &Value::Undefined, &[]).is_ok());
}

#[test]
fn test_stack_overflow_guard() {
    let (rt, ctx) = new_engine();
    rt.update_stack_top();
    rt.set_max_stack_size(16 * 1024);
    // A native function that keeps calling itself through `this`.
    let recurse = Value::Object(ctx.new_native_function(
        "recurse",
        0,
        Rc::new(|ctx, this, _args, _data, _magic| ctx.call(this, this, &[])),
    ));
    let result = ctx.call(&recurse, &recurse, &[]);
    assert!(result.is_err());
    let exc = ctx.get_exception();
    let rendered = ctx.error_to_string(&exc);
    assert!(rendered.contains("stack overflow"), "got: {rendered}");
    rt.set_max_stack_size(256 * 1024);
}

#[test]
fn test_unhandled_rejection_tracker_fires() {
    let (rt, ctx) = new_engine();
    let hits: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));
    let hits2 = hits.clone();
    rt.set_host_promise_rejection_tracker(Some(Box::new(
        move |_ctx: &Context, _promise: &Value, _reason: &Value, handled: bool| {
            hits2.borrow_mut().push(handled);
        },
    )));
    let p = ctx.new_promise();
    ctx.reject_promise(&p, Value::string("boom"));
    assert_eq!(&*hits.borrow(), &[false]);
    // Attaching a handler afterwards reports the rejection as handled.
    ctx.promise_then(&Value::Object(p), None, Some(Value::Undefined))
        .unwrap();
    assert_eq!(&*hits.borrow(), &[false, true]);
}

#[test]
fn test_global_object_and_object_proto_methods() {
    let (_rt, ctx) = new_engine();
    let global = ctx.global();
    let gt = get(&ctx, &global, "globalThis");
    assert!(Value::strict_eq(&gt, &global));
    let obj = Value::Object(ctx.new_plain_object());
    let s = ctx.to_string(&obj).unwrap();
    assert_eq!(s.to_rust_string(), "[object Object]");
}

#[test]
fn test_own_property_name_ordering() {
    let (_rt, ctx) = new_engine();
    let obj = ctx.new_plain_object();
    let ov = Value::Object(obj.clone());
    set(&ctx, &ov, "beta", Value::Int(1));
    ctx.set_property(&ov, Atom::from_index(10), Value::Int(2), &ov, true)
        .unwrap();
    set(&ctx, &ov, "alpha", Value::Int(3));
    ctx.set_property(&ov, Atom::from_index(2), Value::Int(4), &ov, true)
        .unwrap();
    let names = ctx
        .get_own_property_names(&obj, marten_vm_core::gpn_flags::STRING)
        .unwrap();
    let rendered: Vec<String> = names
        .iter()
        .map(|a| ctx.rt().atom_to_string(*a).to_rust_string())
        .collect();
    // Indices ascending first, then strings in insertion order.
    assert_eq!(rendered, vec!["2", "10", "beta", "alpha"]);
    ctx.release_atoms(&names);
}
