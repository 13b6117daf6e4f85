//! Per-realm intrinsics
//!
//! Builds the prototype graph a fresh realm needs to exercise the core:
//! `Object`/`Function`/`Array` prototypes, the eight error prototypes,
//! the boxed-primitive prototypes, generator methods, and the `Promise`
//! constructor with its combinators. The full standard library belongs to
//! an outer layer; only what the core itself reaches for lives here.

use std::rc::Rc;

use marten_vm_gc::GcRef;

use crate::atom::Atom;
use crate::class::{ExoticMethods, ExoticResult, OwnProperty, OwnPropertyKind};
use crate::context::{Context, WellKnownSymbols};
use crate::error::ERROR_KINDS;
use crate::function::NativeFn;
use crate::object::{JsObject, ObjectData, Property, class_ids, obj_flags};
use crate::shape::PropFlags;
use crate::string::JsString;
use crate::value::Value;

fn method(ctx: &Context, obj: &GcRef<JsObject>, name: &str, length: u16, f: NativeFn) {
    let func = ctx.new_native_function(name, length, f);
    let atom = ctx.rt().intern_atom(name);
    ctx.define_own_property_raw(
        obj,
        atom,
        Property::Value(Value::Object(func)),
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
    );
    ctx.rt().release_atom(atom);
}

fn data_prop(ctx: &Context, obj: &GcRef<JsObject>, name: &str, value: Value, flags: PropFlags) {
    let atom = ctx.rt().intern_atom(name);
    ctx.define_own_property_raw(obj, atom, Property::Value(value), flags);
    ctx.rt().release_atom(atom);
}

/// Build the intrinsics of a fresh realm.
pub(crate) fn init_realm(ctx: &Context) {
    let realm = ctx.realm().clone();

    // Object.prototype is the root of almost everything.
    let object_proto = ctx.new_object_full(class_ids::OBJECT, None, ObjectData::Ordinary);
    realm.set_class_proto(class_ids::OBJECT, Value::Object(object_proto.clone()));

    let rt = ctx.rt();
    realm.set_symbols(WellKnownSymbols {
        iterator: rt.new_symbol(Some(JsString::from_str("Symbol.iterator"))),
        species: rt.new_symbol(Some(JsString::from_str("Symbol.species"))),
        to_primitive: rt.new_symbol(Some(JsString::from_str("Symbol.toPrimitive"))),
        to_string_tag: rt.new_symbol(Some(JsString::from_str("Symbol.toStringTag"))),
        has_instance: rt.new_symbol(Some(JsString::from_str("Symbol.hasInstance"))),
    });

    // Function.prototype: a callable that ignores everything.
    let func_proto = ctx.new_object_full(
        class_ids::C_FUNCTION,
        Some(object_proto.clone()),
        ObjectData::Native(Box::new(crate::function::NativeFunctionData {
            realm: realm.clone(),
            func: Rc::new(|_ctx, _this, _args, _data, _magic| Ok(Value::Undefined)),
            magic: 0,
            data: Vec::new(),
        })),
    );
    for id in [
        class_ids::C_FUNCTION,
        class_ids::BYTECODE_FUNCTION,
        class_ids::BOUND_FUNCTION,
    ] {
        realm.set_class_proto(id, Value::Object(func_proto.clone()));
    }

    init_object_proto(ctx, &object_proto);
    init_function_proto(ctx, &func_proto);

    // Array.prototype is itself an array.
    let array_proto = ctx.new_object_full(
        class_ids::ARRAY,
        Some(object_proto.clone()),
        ObjectData::Array(Vec::new()),
    );
    array_proto.set_flag(obj_flags::FAST_ARRAY, true);
    let common = ctx.rt().common_atoms();
    ctx.define_own_property_raw(
        &array_proto,
        common.length,
        Property::Value(Value::Int(0)),
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::LENGTH),
    );
    realm.set_class_proto(class_ids::ARRAY, Value::Object(array_proto.clone()));
    init_array_proto(ctx, &array_proto);

    init_error_protos(ctx, &object_proto);

    // Plain prototypes for the remaining built-in classes.
    for id in [
        class_ids::GENERATOR,
        class_ids::PROMISE,
        class_ids::ARRAY_BUFFER,
        class_ids::SHARED_ARRAY_BUFFER,
        class_ids::MAP,
        class_ids::SET,
        class_ids::WEAK_MAP,
        class_ids::WEAK_SET,
        class_ids::WEAK_REF,
        class_ids::NUMBER,
        class_ids::STRING,
        class_ids::BOOLEAN,
        class_ids::SYMBOL,
        class_ids::DATE,
        class_ids::UINT8C_ARRAY,
        class_ids::INT8_ARRAY,
        class_ids::UINT8_ARRAY,
        class_ids::INT16_ARRAY,
        class_ids::UINT16_ARRAY,
        class_ids::INT32_ARRAY,
        class_ids::UINT32_ARRAY,
        class_ids::BIG_INT64_ARRAY,
        class_ids::BIG_UINT64_ARRAY,
        class_ids::FLOAT32_ARRAY,
        class_ids::FLOAT64_ARRAY,
    ] {
        let proto = ctx.new_object_full(
            class_ids::OBJECT,
            Some(object_proto.clone()),
            ObjectData::Ordinary,
        );
        realm.set_class_proto(id, Value::Object(proto));
    }

    init_generator_proto(ctx);
    init_promise(ctx);

    // The global object.
    let global = ctx.new_object_full(
        class_ids::OBJECT,
        Some(object_proto.clone()),
        ObjectData::Ordinary,
    );
    realm.set_global(Value::Object(global.clone()));
    ctx.define_own_property_raw(
        &global,
        common.global_this,
        Property::Value(Value::Object(global.clone())),
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
    );
    data_prop(
        ctx,
        &global,
        "Promise",
        realm.promise_ctor(),
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
    );
}

fn init_object_proto(ctx: &Context, proto: &GcRef<JsObject>) {
    method(
        ctx,
        proto,
        "toString",
        0,
        Rc::new(|ctx, _this, _args, _data, _magic| {
            Ok(Value::String(
                ctx.rt()
                    .atom_to_string(ctx.rt().common_atoms().object_str),
            ))
        }),
    );
    method(
        ctx,
        proto,
        "valueOf",
        0,
        Rc::new(|_ctx, this, _args, _data, _magic| Ok(this.clone())),
    );
    method(
        ctx,
        proto,
        "hasOwnProperty",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let key = args.first().cloned().unwrap_or(Value::Undefined);
            let atom = ctx.to_property_key(&key)?;
            let obj = ctx.to_object(this)?;
            let result = ctx.has_own_property(&obj, atom);
            ctx.rt().release_atom(atom);
            Ok(Value::Bool(result?))
        }),
    );
}

fn init_function_proto(ctx: &Context, proto: &GcRef<JsObject>) {
    method(
        ctx,
        proto,
        "call",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let call_this = args.first().cloned().unwrap_or(Value::Undefined);
            let rest = args.get(1..).unwrap_or(&[]);
            ctx.call(this, &call_this, rest)
        }),
    );
    method(
        ctx,
        proto,
        "apply",
        2,
        Rc::new(|ctx, this, args, _data, _magic| {
            let call_this = args.first().cloned().unwrap_or(Value::Undefined);
            let arg_list = args.get(1).cloned().unwrap_or(Value::Undefined);
            let spread = if arg_list.is_nullish() {
                Vec::new()
            } else {
                ctx.iterable_to_values(&arg_list)?
            };
            ctx.call(this, &call_this, &spread)
        }),
    );
    method(
        ctx,
        proto,
        "bind",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let bound_this = args.first().cloned().unwrap_or(Value::Undefined);
            let rest = args.get(1..).unwrap_or(&[]);
            Ok(Value::Object(ctx.new_bound_function(this, &bound_this, rest)?))
        }),
    );
}

fn init_array_proto(ctx: &Context, proto: &GcRef<JsObject>) {
    method(
        ctx,
        proto,
        "push",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let obj = ctx.to_object(this)?;
            let len = ctx.array_push(&obj, args)?;
            Ok(Value::number(len as f64))
        }),
    );
    method(
        ctx,
        proto,
        "pop",
        0,
        Rc::new(|ctx, this, _args, _data, _magic| {
            let obj = ctx.to_object(this)?;
            ctx.array_pop(&obj)
        }),
    );
    method(
        ctx,
        proto,
        "join",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let obj = ctx.to_object(this)?;
            let sep = match args.first() {
                Some(v) if !v.is_nullish() => ctx.to_string(v)?.to_rust_string(),
                _ => ",".to_string(),
            };
            ctx.array_join(&obj, &sep)
        }),
    );
}

fn init_error_protos(ctx: &Context, object_proto: &GcRef<JsObject>) {
    let realm = ctx.realm().clone();
    let base = ctx.new_object_full(
        class_ids::OBJECT,
        Some(object_proto.clone()),
        ObjectData::Ordinary,
    );
    data_prop(
        ctx,
        &base,
        "name",
        Value::string("Error"),
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
    );
    data_prop(
        ctx,
        &base,
        "message",
        Value::string(""),
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
    );
    method(
        ctx,
        &base,
        "toString",
        0,
        Rc::new(|ctx, this, _args, _data, _magic| {
            Ok(Value::string(&ctx.error_to_string(this)))
        }),
    );
    realm.set_class_proto(class_ids::ERROR, Value::Object(base.clone()));
    for kind in ERROR_KINDS {
        let proto = ctx.new_object_full(
            class_ids::OBJECT,
            Some(base.clone()),
            ObjectData::Ordinary,
        );
        data_prop(
            ctx,
            &proto,
            "name",
            Value::string(kind.name()),
            PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
        );
        realm.set_error_proto(kind, Value::Object(proto));
    }
}

fn init_generator_proto(ctx: &Context) {
    let proto_val = ctx.realm().class_proto(class_ids::GENERATOR);
    let Some(proto) = proto_val.as_object() else {
        return;
    };
    method(
        ctx,
        proto,
        "next",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let Some(generator) = this.as_object() else {
                return Err(ctx.throw_type_error("not a generator"));
            };
            ctx.generator_next(generator, args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
    method(
        ctx,
        proto,
        "return",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let Some(generator) = this.as_object() else {
                return Err(ctx.throw_type_error("not a generator"));
            };
            ctx.generator_return(generator, args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
    method(
        ctx,
        proto,
        "throw",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let Some(generator) = this.as_object() else {
                return Err(ctx.throw_type_error("not a generator"));
            };
            ctx.generator_throw(generator, args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
}

fn init_promise(ctx: &Context) {
    let realm = ctx.realm().clone();
    let proto_val = realm.class_proto(class_ids::PROMISE);
    let proto = proto_val.as_object().cloned().expect("promise prototype");

    method(
        ctx,
        &proto,
        "then",
        2,
        Rc::new(|ctx, this, args, _data, _magic| {
            ctx.promise_then(this, args.first().cloned(), args.get(1).cloned())
        }),
    );
    method(
        ctx,
        &proto,
        "catch",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            ctx.promise_then(this, None, args.first().cloned())
        }),
    );
    method(
        ctx,
        &proto,
        "finally",
        1,
        Rc::new(|ctx, this, args, _data, _magic| {
            let on_finally = args.first().cloned().unwrap_or(Value::Undefined);
            if !ctx.is_callable(&on_finally) {
                return ctx.promise_then(this, Some(on_finally.clone()), Some(on_finally));
            }
            let pass = ctx.new_native_function_data(
                "",
                1,
                0,
                vec![on_finally.clone()],
                Rc::new(|ctx, _this, args, data, _magic| {
                    ctx.call(&data[0], &Value::Undefined, &[])?;
                    Ok(args.first().cloned().unwrap_or(Value::Undefined))
                }),
            );
            let rethrow = ctx.new_native_function_data(
                "",
                1,
                0,
                vec![on_finally],
                Rc::new(|ctx, _this, args, data, _magic| {
                    ctx.call(&data[0], &Value::Undefined, &[])?;
                    Err(ctx.throw(args.first().cloned().unwrap_or(Value::Undefined)))
                }),
            );
            ctx.promise_then(
                this,
                Some(Value::Object(pass)),
                Some(Value::Object(rethrow)),
            )
        }),
    );

    // The constructor itself.
    let ctor = ctx.new_native_function(
        "Promise",
        1,
        Rc::new(|ctx, _this, args, _data, _magic| {
            let executor = args.first().cloned().unwrap_or(Value::Undefined);
            if !ctx.is_callable(&executor) {
                return Err(ctx.throw_type_error("Promise executor is not a function"));
            }
            let promise = ctx.new_promise();
            let (resolve, reject) = ctx.create_resolving_functions(&promise);
            if ctx
                .call(&executor, &Value::Undefined, &[resolve, reject.clone()])
                .is_err()
            {
                let reason = ctx.get_exception();
                ctx.call(&reject, &Value::Undefined, &[reason])?;
            }
            Ok(Value::Object(promise))
        }),
    );
    ctor.set_flag(obj_flags::CONSTRUCTOR, true);
    let common = ctx.rt().common_atoms();
    ctx.define_own_property_raw(
        &ctor,
        common.prototype,
        Property::Value(Value::Object(proto.clone())),
        PropFlags::NONE,
    );
    ctx.define_own_property_raw(
        &proto,
        common.constructor,
        Property::Value(Value::Object(ctor.clone())),
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
    );

    method(
        ctx,
        &ctor,
        "resolve",
        1,
        Rc::new(|ctx, _this, args, _data, _magic| {
            ctx.promise_resolve(&args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
    method(
        ctx,
        &ctor,
        "reject",
        1,
        Rc::new(|ctx, _this, args, _data, _magic| {
            ctx.promise_reject(&args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
    method(
        ctx,
        &ctor,
        "all",
        1,
        Rc::new(|ctx, _this, args, _data, _magic| {
            ctx.promise_all(&args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
    method(
        ctx,
        &ctor,
        "allSettled",
        1,
        Rc::new(|ctx, _this, args, _data, _magic| {
            ctx.promise_all_settled(&args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
    method(
        ctx,
        &ctor,
        "any",
        1,
        Rc::new(|ctx, _this, args, _data, _magic| {
            ctx.promise_any(&args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );
    method(
        ctx,
        &ctor,
        "race",
        1,
        Rc::new(|ctx, _this, args, _data, _magic| {
            ctx.promise_race(&args.first().cloned().unwrap_or(Value::Undefined))
        }),
    );

    realm.set_promise_ctor(Value::Object(ctor));
}

/// Boxed-string exotic behavior: `length` and indexed characters come
/// from the wrapped string, not the shape.
pub struct StringWrapperExotic;

impl StringWrapperExotic {
    fn boxed_string(obj: &GcRef<JsObject>) -> Option<std::rc::Rc<JsString>> {
        obj.with_data(|d| match d {
            ObjectData::Boxed(Value::String(s)) => Some(s.clone()),
            _ => None,
        })
    }
}

impl ExoticMethods for StringWrapperExotic {
    fn get_own_property(
        &self,
        _ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResultOwn {
        let Some(s) = Self::boxed_string(obj) else {
            return Ok(ExoticResult::Ordinary);
        };
        if let Some(idx) = prop.as_index() {
            return Ok(match s.code_unit_at(idx as usize) {
                Some(unit) => ExoticResult::Handled(Some(OwnProperty {
                    kind: OwnPropertyKind::Value(Value::String(JsString::from_utf16(&[unit]))),
                    flags: PropFlags::from_bits(PropFlags::ENUMERABLE),
                })),
                None => ExoticResult::Handled(None),
            });
        }
        Ok(ExoticResult::Ordinary)
    }

    fn get_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        _receiver: &Value,
    ) -> crate::error::JsResult<ExoticResult<Value>> {
        let Some(s) = Self::boxed_string(obj) else {
            return Ok(ExoticResult::Ordinary);
        };
        if prop == ctx.rt().common_atoms().length {
            return Ok(ExoticResult::Handled(Value::number(s.len() as f64)));
        }
        if let Some(idx) = prop.as_index() {
            if let Some(unit) = s.code_unit_at(idx as usize) {
                return Ok(ExoticResult::Handled(Value::String(JsString::from_utf16(
                    &[unit],
                ))));
            }
        }
        Ok(ExoticResult::Ordinary)
    }

    fn has_property(
        &self,
        _ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> crate::error::JsResult<ExoticResult<bool>> {
        let Some(s) = Self::boxed_string(obj) else {
            return Ok(ExoticResult::Ordinary);
        };
        if let Some(idx) = prop.as_index() {
            if (idx as usize) < s.len() {
                return Ok(ExoticResult::Handled(true));
            }
        }
        Ok(ExoticResult::Ordinary)
    }
}

type JsResultOwn = crate::error::JsResult<ExoticResult<Option<OwnProperty>>>;
