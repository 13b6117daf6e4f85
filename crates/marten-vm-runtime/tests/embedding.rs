//! Host-side embedding flow: builder, module provider, job pump.

use std::cell::RefCell;
use std::rc::Rc;

use marten_vm_core::{Context, Value};
use marten_vm_runtime::{MemoryModuleProvider, RuntimeBuilder, run_jobs};

fn get(ctx: &Context, obj: &Value, key: &str) -> Value {
    let atom = ctx.rt().intern_atom(key);
    let v = ctx.get_property_value(obj, atom).unwrap();
    ctx.rt().release_atom(atom);
    v
}

#[test]
fn test_builder_applies_limits() {
    let (rt, ctx) = RuntimeBuilder::new()
        .gc_threshold(1024 * 1024)
        .max_stack_size(128 * 1024)
        .build();
    assert_eq!(rt.heap().gc_threshold(), 1024 * 1024);
    assert!(ctx.global().is_object());
}

#[test]
fn test_provider_serves_relative_imports() {
    let provider = MemoryModuleProvider::new();
    provider.register(
        "lib/answer",
        Rc::new(|ctx: &Context| {
            let m = ctx.new_module("lib/answer");
            ctx.module_add_local_export(&m, "answer", 0);
            ctx.module_set_init(
                &m,
                Rc::new(|ctx, module| {
                    ctx.module_export_cell(module, "answer")
                        .unwrap()
                        .set_closed_value(Value::Int(42));
                    Ok(())
                }),
            );
            Ok(m)
        }),
    );
    provider.register(
        "lib/main",
        Rc::new(|ctx: &Context| {
            let m = ctx.new_module("lib/main");
            let req = ctx.module_add_require(&m, "./answer");
            ctx.module_add_star_export(&m, req);
            Ok(m)
        }),
    );
    let (_rt, ctx) = RuntimeBuilder::new().module_loader(provider).build();
    let main = ctx.run_module("", "lib/main").unwrap();
    let Value::Module(module) = main else {
        panic!("run_module returns the module value");
    };
    let ns = marten_vm_core::module::get_module_namespace(&ctx, &module).unwrap();
    let answer = get(&ctx, &Value::Object(ns), "answer");
    assert_eq!(answer.as_int(), Some(42));
}

#[test]
fn test_run_jobs_drains_in_order() {
    let (rt, ctx) = RuntimeBuilder::new().build();
    let log: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    for i in 0..3 {
        let log = log.clone();
        let p = ctx.promise_resolve(&Value::Int(i)).unwrap();
        let f = Value::Object(ctx.new_native_function(
            "",
            1,
            Rc::new(move |_ctx, _this, args, _data, _magic| {
                log.borrow_mut()
                    .push(args.first().and_then(|v| v.as_int()).unwrap_or(-1));
                Ok(Value::Undefined)
            }),
        ));
        ctx.promise_then(&p, Some(f), None).unwrap();
    }
    let ran = run_jobs(&rt).unwrap();
    assert!(ran >= 3);
    assert_eq!(&*log.borrow(), &[0, 1, 2]);
}

#[test]
fn test_job_exception_surfaces_with_context() {
    let (rt, ctx) = RuntimeBuilder::new().build();
    let p = ctx.promise_resolve(&Value::Int(1)).unwrap();
    let boom = Value::Object(ctx.new_native_function(
        "",
        1,
        Rc::new(|ctx, _this, _args, _data, _magic| Err(ctx.throw_type_error("job boom"))),
    ));
    // No capability chain: an internal reaction failure reaches the pump.
    let pobj = p.as_object().unwrap();
    ctx.perform_promise_then(pobj, Some(boom), None, None).unwrap();
    let err = run_jobs(&rt);
    let (ectx, exc) = err.expect_err("job failure propagates");
    assert_eq!(ectx.error_to_string(&exc), "TypeError: job boom");
}
