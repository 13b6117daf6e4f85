//! Module linking/evaluation and suspendable-function scenarios.

use std::cell::RefCell;
use std::rc::Rc;

use marten_vm_core::coroutine::{Completion, FuncRet};
use marten_vm_core::module::get_module_namespace;
use marten_vm_core::{
    ClosureVarDef, Context, FunctionBytecode, FunctionFlags, GcKind, GcRef, ModuleRecord,
    ObjectData, ResolvedExport, Runtime, Value, body_fn, resumable_body_fn,
};

fn new_engine() -> (Runtime, Context) {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    (rt, ctx)
}

fn get(ctx: &Context, obj: &Value, key: &str) -> Value {
    let atom = ctx.rt().intern_atom(key);
    let v = ctx.get_property_value(obj, atom).unwrap();
    ctx.rt().release_atom(atom);
    v
}

/// `m1: export const x = 1; export const y = 2;` as a native module.
fn make_m1(ctx: &Context) -> GcRef<ModuleRecord> {
    let m = ctx.new_module("m1");
    ctx.module_add_local_export(&m, "x", 0);
    ctx.module_add_local_export(&m, "y", 1);
    ctx.module_set_init(
        &m,
        Rc::new(|ctx, module| {
            ctx.module_export_cell(module, "x")
                .unwrap()
                .set_closed_value(Value::Int(1));
            ctx.module_export_cell(module, "y")
                .unwrap()
                .set_closed_value(Value::Int(2));
            Ok(())
        }),
    );
    ctx.register_module(&m);
    m
}

/// `m2: export * from "m1"; export const x = 99;`
fn make_m2(ctx: &Context) -> GcRef<ModuleRecord> {
    let m = ctx.new_module("m2");
    let req = ctx.module_add_require(&m, "m1");
    ctx.module_add_star_export(&m, req);
    ctx.module_add_local_export(&m, "x", 0);
    ctx.module_set_init(
        &m,
        Rc::new(|ctx, module| {
            ctx.module_export_cell(module, "x")
                .unwrap()
                .set_closed_value(Value::Int(99));
            Ok(())
        }),
    );
    ctx.register_module(&m);
    m
}

#[test]
fn test_star_export_does_not_shadow_direct() {
    let (_rt, ctx) = new_engine();
    make_m1(&ctx);
    let m2 = make_m2(&ctx);
    ctx.evaluate_module(&m2).unwrap();

    let x = ctx.rt().intern_atom("x");
    let y = ctx.rt().intern_atom("y");
    // x resolves to m2's own export, not the star re-export.
    match ctx.resolve_export(&m2, x).unwrap() {
        ResolvedExport::Found { module, .. } => {
            assert!(GcRef::ptr_eq(&module, &m2));
        }
        _ => panic!("x must resolve"),
    }
    let ns = get_module_namespace(&ctx, &m2).unwrap();
    let nsv = Value::Object(ns);
    assert_eq!(ctx.get_property_value(&nsv, x).unwrap().as_int(), Some(99));
    assert_eq!(ctx.get_property_value(&nsv, y).unwrap().as_int(), Some(2));
    ctx.rt().release_atom(x);
    ctx.rt().release_atom(y);
}

#[test]
fn test_import_through_module_function() {
    let (_rt, ctx) = new_engine();
    make_m1(&ctx);
    make_m2(&ctx);

    // m3: import { x, y } from "m2"; body records what it sees.
    let m3 = ctx.new_module("m3");
    let req = ctx.module_add_require(&m3, "m2");
    ctx.module_add_import(&m3, req, "x", 0, false);
    ctx.module_add_import(&m3, req, "y", 1, false);

    let seen: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let body = body_fn(move |ctx, frame| {
        let func = ctx.frame_func(frame);
        let cells = func
            .as_object()
            .unwrap()
            .with_data(|d| match d {
                ObjectData::Closure(c) => c.var_refs.clone(),
                _ => Vec::new(),
            });
        for cell in &cells {
            let v = ctx.var_ref_value(cell)?;
            seen2.borrow_mut().push(v.as_int().unwrap_or(-1));
        }
        Ok(Value::Undefined)
    });
    let func = ctx.rt().heap().alloc(
        GcKind::FunctionBytecode,
        FunctionBytecode::new(
            ctx.rt().intern_atom("m3"),
            FunctionFlags::default(),
            0,
            0,
            vec![
                ClosureVarDef {
                    name: ctx.rt().intern_atom("x"),
                    is_local: false,
                    idx: 0,
                },
                ClosureVarDef {
                    name: ctx.rt().intern_atom("y"),
                    is_local: false,
                    idx: 1,
                },
            ],
            Some(body),
        ),
    );
    ctx.module_set_function(&m3, func);
    ctx.evaluate_module(&m3).unwrap();
    assert_eq!(&*seen.borrow(), &[99, 2]);
}

#[test]
fn test_ambiguous_star_export_throws_on_resolution() {
    let (_rt, ctx) = new_engine();
    // Two modules both export z; a third star-exports both.
    for (name, value) in [("za", 10), ("zb", 20)] {
        let m = ctx.new_module(name);
        ctx.module_add_local_export(&m, "z", 0);
        ctx.module_set_init(
            &m,
            Rc::new(move |ctx, module| {
                ctx.module_export_cell(module, "z")
                    .unwrap()
                    .set_closed_value(Value::Int(value));
                Ok(())
            }),
        );
        ctx.register_module(&m);
    }
    let m = ctx.new_module("zc");
    let ra = ctx.module_add_require(&m, "za");
    let rb = ctx.module_add_require(&m, "zb");
    ctx.module_add_star_export(&m, ra);
    ctx.module_add_star_export(&m, rb);
    ctx.register_module(&m);
    ctx.instantiate_module(&m).unwrap();

    let z = ctx.rt().intern_atom("z");
    assert!(matches!(
        ctx.resolve_export(&m, z).unwrap(),
        ResolvedExport::Ambiguous
    ));
    // The namespace omits the ambiguous name.
    let ns = get_module_namespace(&ctx, &m).unwrap();
    assert!(!ctx.has_own_property(&ns, z).unwrap());
    ctx.rt().release_atom(z);

    // A module importing the ambiguous name fails to link.
    let importer = ctx.new_module("importer");
    let req = ctx.module_add_require(&importer, "zc");
    ctx.module_add_import(&importer, req, "z", 0, false);
    let body = body_fn(|_ctx, _frame| Ok(Value::Undefined));
    let func = ctx.rt().heap().alloc(
        GcKind::FunctionBytecode,
        FunctionBytecode::new(
            ctx.rt().intern_atom("importer"),
            FunctionFlags::default(),
            0,
            0,
            vec![ClosureVarDef {
                name: ctx.rt().intern_atom("z"),
                is_local: false,
                idx: 0,
            }],
            Some(body),
        ),
    );
    ctx.module_set_function(&importer, func);
    let result = ctx.instantiate_module(&importer);
    assert!(result.is_err());
    let exc = ctx.get_exception();
    assert!(ctx.error_to_string(&exc).starts_with("SyntaxError"));
}

#[test]
fn test_module_cycle_and_eval_once() {
    let (_rt, ctx) = new_engine();
    let runs: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    // a imports b; b imports a. Both are native-init modules.
    let ma = ctx.new_module("a");
    let mb = ctx.new_module("b");
    ctx.module_add_require(&ma, "b");
    ctx.module_add_require(&mb, "a");
    let runs_a = runs.clone();
    ctx.module_set_init(
        &ma,
        Rc::new(move |_ctx, _m| {
            runs_a.borrow_mut().push("a");
            Ok(())
        }),
    );
    let runs_b = runs.clone();
    ctx.module_set_init(
        &mb,
        Rc::new(move |_ctx, _m| {
            runs_b.borrow_mut().push("b");
            Ok(())
        }),
    );
    ctx.register_module(&ma);
    ctx.register_module(&mb);

    ctx.evaluate_module(&ma).unwrap();
    // Dependencies evaluate first, each exactly once, despite the cycle.
    assert_eq!(&*runs.borrow(), &["b", "a"]);
    ctx.evaluate_module(&ma).unwrap();
    assert_eq!(&*runs.borrow(), &["b", "a"]);
}

#[test]
fn test_module_eval_exception_is_sticky() {
    let (_rt, ctx) = new_engine();
    let m = ctx.new_module("boom");
    ctx.module_set_init(
        &m,
        Rc::new(|ctx, _m| Err(ctx.throw_type_error("kaboom"))),
    );
    ctx.register_module(&m);
    assert!(ctx.evaluate_module(&m).is_err());
    let first = ctx.get_exception();
    assert!(ctx.error_to_string(&first).contains("kaboom"));
    // A second evaluation rethrows the recorded exception.
    assert!(ctx.evaluate_module(&m).is_err());
    let second = ctx.get_exception();
    assert!(Value::strict_eq(&first, &second));
}

#[test]
fn test_dynamic_import_resolves_namespace() {
    let (rt, ctx) = new_engine();
    make_m1(&ctx);
    let promise = ctx.dynamic_import("main", "m1").unwrap();

    let captured: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
    let captured2 = captured.clone();
    let on_ok = Value::Object(ctx.new_native_function(
        "",
        1,
        Rc::new(move |_ctx, _this, args, _data, _magic| {
            *captured2.borrow_mut() = args.first().cloned();
            Ok(Value::Undefined)
        }),
    ));
    ctx.promise_then(&promise, Some(on_ok), None).unwrap();
    while rt.execute_pending_job().unwrap().is_some() {}

    let ns = captured.borrow().clone().expect("namespace delivered");
    assert_eq!(get(&ctx, &ns, "x").as_int(), Some(1));
    assert_eq!(get(&ctx, &ns, "y").as_int(), Some(2));
}

#[test]
fn test_module_namespace_is_immutable() {
    let (_rt, ctx) = new_engine();
    let m1 = make_m1(&ctx);
    ctx.evaluate_module(&m1).unwrap();
    let ns = get_module_namespace(&ctx, &m1).unwrap();
    let nsv = Value::Object(ns.clone());
    let x = ctx.rt().intern_atom("x");
    // Writes are refused quietly (or throw in throw-mode).
    assert!(!ctx.set_property(&nsv, x, Value::Int(5), &nsv, false).unwrap());
    assert!(ctx.set_property(&nsv, x, Value::Int(5), &nsv, true).is_err());
    let _ = ctx.get_exception();
    assert_eq!(ctx.get_property_value(&nsv, x).unwrap().as_int(), Some(1));
    // Existing bindings cannot be deleted.
    assert!(!ctx.delete_property(&ns, x).unwrap());
    ctx.rt().release_atom(x);
}

// ---------------------------------------------------------------------------
// generators & async functions
// ---------------------------------------------------------------------------

fn make_closure(
    ctx: &Context,
    flags: FunctionFlags,
    body: Rc<dyn marten_vm_core::FunctionBody>,
) -> Value {
    let func = ctx.rt().heap().alloc(
        GcKind::FunctionBytecode,
        FunctionBytecode::new(ctx.rt().intern_atom("test_fn"), flags, 0, 0, Vec::new(), Some(body)),
    );
    Value::Object(ctx.new_closure(&func, None, Some(&[])).unwrap())
}

#[test]
fn test_generator_state_machine() {
    let (_rt, ctx) = new_engine();
    let body = resumable_body_fn(|_ctx, co, input| {
        let point = co.resume_point;
        co.resume_point += 1;
        match point {
            0 => Ok(FuncRet::Yield(Value::Int(1))),
            1 => {
                // The value sent by next() feeds back in.
                let sent = match input {
                    Completion::Normal(v) => v,
                    _ => Value::Undefined,
                };
                co.locals.push(sent);
                Ok(FuncRet::Yield(Value::Int(2)))
            }
            _ => Ok(FuncRet::Return(Value::Int(3))),
        }
    });
    let gen_fn = make_closure(
        &ctx,
        FunctionFlags {
            is_generator: true,
            ..Default::default()
        },
        body,
    );
    let gen_val = ctx.call(&gen_fn, &Value::Undefined, &[]).unwrap();
    let generator = gen_val.as_object().unwrap().clone();

    let r1 = ctx.generator_next(&generator, Value::Undefined).unwrap();
    assert_eq!(get(&ctx, &r1, "value").as_int(), Some(1));
    assert_eq!(get(&ctx, &r1, "done").as_bool(), Some(false));

    let r2 = ctx.generator_next(&generator, Value::Int(42)).unwrap();
    assert_eq!(get(&ctx, &r2, "value").as_int(), Some(2));

    let r3 = ctx.generator_next(&generator, Value::Undefined).unwrap();
    assert_eq!(get(&ctx, &r3, "value").as_int(), Some(3));
    assert_eq!(get(&ctx, &r3, "done").as_bool(), Some(true));

    // Completed generators stay completed.
    let r4 = ctx.generator_next(&generator, Value::Undefined).unwrap();
    assert!(get(&ctx, &r4, "value").is_undefined());
    assert_eq!(get(&ctx, &r4, "done").as_bool(), Some(true));
}

#[test]
fn test_generator_return_before_start() {
    let (_rt, ctx) = new_engine();
    let body = resumable_body_fn(|_ctx, _co, _input| Ok(FuncRet::Yield(Value::Int(1))));
    let gen_fn = make_closure(
        &ctx,
        FunctionFlags {
            is_generator: true,
            ..Default::default()
        },
        body,
    );
    let gen_val = ctx.call(&gen_fn, &Value::Undefined, &[]).unwrap();
    let generator = gen_val.as_object().unwrap().clone();
    let r = ctx.generator_return(&generator, Value::Int(5)).unwrap();
    assert_eq!(get(&ctx, &r, "value").as_int(), Some(5));
    assert_eq!(get(&ctx, &r, "done").as_bool(), Some(true));
}

#[test]
fn test_async_function_awaits_through_job_queue() {
    let (rt, ctx) = new_engine();
    // async fn: let v = await 41; return v + 1;
    let body = resumable_body_fn(|_ctx, co, input| {
        let point = co.resume_point;
        co.resume_point += 1;
        match point {
            0 => Ok(FuncRet::Await(Value::Int(41))),
            _ => {
                let v = match input {
                    Completion::Normal(v) => v.as_int().unwrap_or(0),
                    _ => 0,
                };
                Ok(FuncRet::Return(Value::Int(v + 1)))
            }
        }
    });
    let async_fn = make_closure(
        &ctx,
        FunctionFlags {
            is_async: true,
            ..Default::default()
        },
        body,
    );
    let promise = ctx.call(&async_fn, &Value::Undefined, &[]).unwrap();

    let captured: Rc<RefCell<Option<i32>>> = Rc::new(RefCell::new(None));
    let captured2 = captured.clone();
    let on_ok = Value::Object(ctx.new_native_function(
        "",
        1,
        Rc::new(move |_ctx, _this, args, _data, _magic| {
            *captured2.borrow_mut() = args.first().and_then(|v| v.as_int());
            Ok(Value::Undefined)
        }),
    ));
    ctx.promise_then(&promise, Some(on_ok), None).unwrap();
    // Nothing settles synchronously.
    assert!(captured.borrow().is_none());
    while rt.execute_pending_job().unwrap().is_some() {}
    assert_eq!(*captured.borrow(), Some(42));
}

#[test]
fn test_async_function_rejects_on_throw() {
    let (rt, ctx) = new_engine();
    let body = resumable_body_fn(|ctx, co, _input| {
        let point = co.resume_point;
        co.resume_point += 1;
        match point {
            0 => Ok(FuncRet::Await(Value::Int(0))),
            _ => Err(ctx.throw_type_error("async boom")),
        }
    });
    let async_fn = make_closure(
        &ctx,
        FunctionFlags {
            is_async: true,
            ..Default::default()
        },
        body,
    );
    let promise = ctx.call(&async_fn, &Value::Undefined, &[]).unwrap();
    let captured: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let captured2 = captured.clone();
    let on_err = Value::Object(ctx.new_native_function(
        "",
        1,
        Rc::new(move |ctx, _this, args, _data, _magic| {
            let reason = args.first().cloned().unwrap_or(Value::Undefined);
            *captured2.borrow_mut() = Some(ctx.error_to_string(&reason));
            Ok(Value::Undefined)
        }),
    ));
    ctx.promise_then(&promise, None, Some(on_err)).unwrap();
    while rt.execute_pending_job().unwrap().is_some() {}
    assert_eq!(
        captured.borrow().as_deref(),
        Some("TypeError: async boom")
    );
}

#[test]
fn test_closure_cell_closes_on_unwind() {
    let (_rt, ctx) = new_engine();
    // inner() reads captured cell 0; outer() sets local 0 and returns inner.
    let inner_body = body_fn(|ctx, frame| {
        let func = ctx.frame_func(frame);
        let cell = func
            .as_object()
            .unwrap()
            .with_data(|d| match d {
                ObjectData::Closure(c) => c.var_refs[0].clone(),
                _ => panic!("closure expected"),
            });
        ctx.var_ref_value(&cell)
    });
    let inner_func = ctx.rt().heap().alloc(
        GcKind::FunctionBytecode,
        FunctionBytecode::new(
            ctx.rt().intern_atom("inner"),
            FunctionFlags::default(),
            0,
            0,
            vec![ClosureVarDef {
                name: ctx.rt().intern_atom("captured"),
                is_local: true,
                idx: 0,
            }],
            Some(inner_body),
        ),
    );

    let inner_func2 = inner_func.clone();
    let outer_body = body_fn(move |ctx, frame| {
        ctx.frame_set_local(frame, 0, Value::Int(42));
        let closure = ctx.new_closure(&inner_func2, Some(frame), None)?;
        // The cell is open while the frame lives.
        let cell = ctx.capture_var_ref(frame, 0);
        assert!(cell.is_open());
        Ok(Value::Object(closure))
    });
    let outer_func = ctx.rt().heap().alloc(
        GcKind::FunctionBytecode,
        FunctionBytecode::new(
            ctx.rt().intern_atom("outer"),
            FunctionFlags::default(),
            0,
            1,
            Vec::new(),
            Some(outer_body),
        ),
    );
    let outer = Value::Object(ctx.new_closure(&outer_func, None, Some(&[])).unwrap());
    let inner = ctx.call(&outer, &Value::Undefined, &[]).unwrap();
    // The frame has unwound: the captured cell is closed over 42.
    let result = ctx.call(&inner, &Value::Undefined, &[]).unwrap();
    assert_eq!(result.as_int(), Some(42));
}

#[test]
fn test_module_namespace_atom_resolution_matches_export() {
    let (_rt, ctx) = new_engine();
    make_m1(&ctx);
    let m2 = make_m2(&ctx);
    ctx.evaluate_module(&m2).unwrap();
    let y = ctx.rt().intern_atom("y");
    match ctx.resolve_export(&m2, y).unwrap() {
        ResolvedExport::Found { module, .. } => {
            let name = ctx.rt().atom_to_string(module.name()).to_rust_string();
            assert_eq!(name, "m1");
        }
        _ => panic!("y resolves through the star chain"),
    }
    ctx.rt().release_atom(y);
}
