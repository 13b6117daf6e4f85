//! Suspendable activations: generators and async functions
//!
//! The interpreter compiles `await`/`yield` into suspension points; the
//! core only sees [`FuncRet`] from each resume step. Generator state
//! lives in a [`Coroutine`] owned by the generator object or async
//! record, never on the native stack, so re-entry from host callbacks and
//! job-queue turns is plain data flow.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcKind, GcRef, Trace};

use crate::context::{Context, Realm};
use crate::error::JsResult;
use crate::function::FunctionBody;
use crate::object::{JsObject, ObjectData, OpaqueData, class_ids};
use crate::value::Value;

/// What a resume step delivers into the suspended body.
#[derive(Clone, Debug)]
pub enum Completion {
    /// `next(v)` / initial start / await fulfillment
    Normal(Value),
    /// `throw(e)` / await rejection
    Throw(Value),
    /// `return(v)`
    Return(Value),
}

/// What the body hands back at a suspension point or completion.
#[derive(Clone, Debug)]
pub enum FuncRet {
    /// `yield v`
    Yield(Value),
    /// `yield* v`
    YieldStar(Value),
    /// `await v`
    Await(Value),
    /// Function completed with a return value
    Return(Value),
}

/// Generator lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created, body not entered
    SuspendedStart,
    /// Currently on the native stack
    Executing,
    /// Parked at a `yield`
    SuspendedYield,
    /// Finished (returned, threw, or was closed)
    Completed,
}

/// A parked activation: everything a body needs across suspensions.
pub struct Coroutine {
    /// The function object
    pub func: Value,
    /// `this` binding
    pub this: Value,
    /// Call arguments
    pub args: Vec<Value>,
    /// Persistent local slots
    pub locals: Vec<Value>,
    /// Body-defined resume label
    pub resume_point: u32,
    /// Executable behavior
    pub body: Rc<dyn FunctionBody>,
    /// Realm the function was created in
    pub realm: GcRef<Realm>,
}

impl Coroutine {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        self.func.trace(mark);
        self.this.trace(mark);
        for v in &self.args {
            v.trace(mark);
        }
        for v in &self.locals {
            v.trace(mark);
        }
        mark(self.realm.as_any());
    }
}

/// Generator object payload.
pub struct GeneratorData {
    /// Lifecycle state
    pub state: Cell<GeneratorState>,
    coroutine: RefCell<Option<Box<Coroutine>>>,
}

impl GeneratorData {
    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        if let Some(co) = self.coroutine.borrow().as_ref() {
            co.trace(mark);
        }
    }
}

/// Suspended async-function state (GC kind `AsyncFunction`).
pub struct AsyncFunctionRecord {
    coroutine: RefCell<Option<Box<Coroutine>>>,
    resolve: RefCell<Value>,
    reject: RefCell<Value>,
    promise: RefCell<Value>,
}

impl Trace for AsyncFunctionRecord {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        if let Some(co) = self.coroutine.borrow().as_ref() {
            co.trace(mark);
        }
        self.resolve.borrow().trace(mark);
        self.reject.borrow().trace(mark);
        self.promise.borrow().trace(mark);
    }
}

/// GC-visible wrapper so async driver closures can carry the record
/// through a traced native-function data slot.
struct AsyncRecordHolder(GcRef<AsyncFunctionRecord>);

impl OpaqueData for AsyncRecordHolder {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        mark(self.0.as_any());
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn coroutine_from_closure(
    ctx: &Context,
    func_obj: &GcRef<JsObject>,
    this: &Value,
    args: &[Value],
) -> JsResult<Box<Coroutine>> {
    let (func_rec, realm) = func_obj.with_data(|d| match d {
        ObjectData::Closure(c) => (c.func.clone(), c.realm.clone()),
        _ => unreachable!("coroutine from non-closure"),
    });
    let body = func_rec.body_or_throw(ctx)?;
    Ok(Box::new(Coroutine {
        func: Value::Object(func_obj.clone()),
        this: this.clone(),
        args: args.to_vec(),
        locals: vec![Value::Undefined; func_rec.var_count as usize],
        resume_point: 0,
        body,
        realm,
    }))
}

/// Entry point from call dispatch: a generator call makes a generator
/// object; an async call starts driving and answers a promise.
pub(crate) fn start_coroutine(
    ctx: &Context,
    func_obj: &GcRef<JsObject>,
    this: &Value,
    args: &[Value],
) -> JsResult<Value> {
    let is_async = func_obj.with_data(|d| match d {
        ObjectData::Closure(c) => c.func.flags.is_async,
        _ => false,
    });
    let coroutine = coroutine_from_closure(ctx, func_obj, this, args)?;
    if !is_async {
        let generator = ctx.new_object_class(
            class_ids::GENERATOR,
            ObjectData::Generator(Box::new(GeneratorData {
                state: Cell::new(GeneratorState::SuspendedStart),
                coroutine: RefCell::new(Some(coroutine)),
            })),
        );
        return Ok(Value::Object(generator));
    }
    let promise = ctx.new_promise();
    let (resolve, reject) = ctx.create_resolving_functions(&promise);
    let record = ctx.rt().heap().alloc(
        GcKind::AsyncFunction,
        AsyncFunctionRecord {
            coroutine: RefCell::new(Some(coroutine)),
            resolve: RefCell::new(resolve),
            reject: RefCell::new(reject),
            promise: RefCell::new(Value::Object(promise.clone())),
        },
    );
    async_function_resume(ctx, &record, Completion::Normal(Value::Undefined))?;
    Ok(Value::Object(promise))
}

impl Context {
    /// `generator.next(value)`.
    pub fn generator_next(&self, generator: &GcRef<JsObject>, value: Value) -> JsResult<Value> {
        self.generator_resume(generator, Completion::Normal(value))
    }

    /// `generator.return(value)`.
    pub fn generator_return(&self, generator: &GcRef<JsObject>, value: Value) -> JsResult<Value> {
        self.generator_resume(generator, Completion::Return(value))
    }

    /// `generator.throw(error)`.
    pub fn generator_throw(&self, generator: &GcRef<JsObject>, error: Value) -> JsResult<Value> {
        self.generator_resume(generator, Completion::Throw(error))
    }

    /// `{value, done}` result object.
    pub fn new_iter_result(&self, value: Value, done: bool) -> Value {
        let obj = self.new_plain_object();
        let this = Value::Object(obj);
        let common = self.rt.common_atoms();
        let _ = self.set_property_value(&this, common.value, value);
        let _ = self.set_property_value(&this, common.done, Value::Bool(done));
        this
    }

    fn generator_resume(&self, generator: &GcRef<JsObject>, completion: Completion) -> JsResult<Value> {
        let state = generator.with_data(|d| match d {
            ObjectData::Generator(g) => Some(g.state.get()),
            _ => None,
        });
        let Some(state) = state else {
            return Err(self.throw_type_error("not a generator object"));
        };
        match state {
            GeneratorState::Executing => {
                Err(self.throw_type_error("generator is already running"))
            }
            GeneratorState::Completed => match completion {
                Completion::Normal(_) => Ok(self.new_iter_result(Value::Undefined, true)),
                Completion::Return(v) => Ok(self.new_iter_result(v, true)),
                Completion::Throw(e) => Err(self.throw(e)),
            },
            GeneratorState::SuspendedStart | GeneratorState::SuspendedYield => {
                // Closing an unstarted generator never enters the body.
                if state == GeneratorState::SuspendedStart
                    && let Completion::Return(v) = completion
                {
                    set_generator_state(generator, GeneratorState::Completed, None);
                    return Ok(self.new_iter_result(v, true));
                }
                if state == GeneratorState::SuspendedStart
                    && let Completion::Throw(e) = completion
                {
                    set_generator_state(generator, GeneratorState::Completed, None);
                    return Err(self.throw(e));
                }
                let mut coroutine = generator
                    .with_data(|d| match d {
                        ObjectData::Generator(g) => g.coroutine.borrow_mut().take(),
                        _ => None,
                    })
                    .ok_or_else(|| self.throw_type_error("generator state lost"))?;
                set_generator_state(generator, GeneratorState::Executing, None);
                let body = coroutine.body.clone();
                let result = body.resume(self, &mut coroutine, completion);
                match result {
                    Ok(FuncRet::Yield(v)) | Ok(FuncRet::YieldStar(v)) => {
                        set_generator_state(generator, GeneratorState::SuspendedYield, Some(coroutine));
                        Ok(self.new_iter_result(v, false))
                    }
                    Ok(FuncRet::Return(v)) => {
                        set_generator_state(generator, GeneratorState::Completed, None);
                        Ok(self.new_iter_result(v, true))
                    }
                    Ok(FuncRet::Await(_)) => {
                        set_generator_state(generator, GeneratorState::Completed, None);
                        Err(self.throw_internal_error("generator cannot await"))
                    }
                    Err(e) => {
                        set_generator_state(generator, GeneratorState::Completed, None);
                        Err(e)
                    }
                }
            }
        }
    }
}

fn set_generator_state(
    generator: &GcRef<JsObject>,
    state: GeneratorState,
    coroutine: Option<Box<Coroutine>>,
) {
    generator.with_data(|d| {
        if let ObjectData::Generator(g) = d {
            g.state.set(state);
            *g.coroutine.borrow_mut() = coroutine;
        }
    });
}

/// Drive an async function by one step and wire the next `await` into the
/// job queue.
pub(crate) fn async_function_resume(
    ctx: &Context,
    record: &GcRef<AsyncFunctionRecord>,
    completion: Completion,
) -> JsResult<()> {
    let Some(mut coroutine) = record.coroutine.borrow_mut().take() else {
        return Ok(()); // already completed
    };
    let body = coroutine.body.clone();
    let result = body.resume(ctx, &mut coroutine, completion);
    match result {
        Ok(FuncRet::Await(v)) => {
            *record.coroutine.borrow_mut() = Some(coroutine);
            let awaited = ctx.promise_resolve(&v)?;
            let Some(awaited_obj) = awaited.as_object().cloned() else {
                return Err(ctx.throw_type_error("await target is not a promise"));
            };
            let holder = ctx.new_object_full(
                class_ids::OBJECT,
                None,
                ObjectData::Opaque(Box::new(AsyncRecordHolder(record.clone()))),
            );
            let on_fulfilled = ctx.new_native_function_data(
                "",
                1,
                0,
                vec![Value::Object(holder.clone())],
                Rc::new(move |ctx, _this, args, data, _magic| {
                    let record = holder_record(&data[0]);
                    let v = args.first().cloned().unwrap_or(Value::Undefined);
                    async_function_resume(ctx, &record, Completion::Normal(v))?;
                    Ok(Value::Undefined)
                }),
            );
            let on_rejected = ctx.new_native_function_data(
                "",
                1,
                0,
                vec![Value::Object(holder)],
                Rc::new(move |ctx, _this, args, data, _magic| {
                    let record = holder_record(&data[0]);
                    let e = args.first().cloned().unwrap_or(Value::Undefined);
                    async_function_resume(ctx, &record, Completion::Throw(e))?;
                    Ok(Value::Undefined)
                }),
            );
            ctx.perform_promise_then(
                &awaited_obj,
                Some(Value::Object(on_fulfilled)),
                Some(Value::Object(on_rejected)),
                None,
            )?;
            Ok(())
        }
        Ok(FuncRet::Return(v)) => {
            let resolve = record.resolve.borrow().clone();
            ctx.call(&resolve, &Value::Undefined, &[v])?;
            Ok(())
        }
        Ok(FuncRet::Yield(_)) | Ok(FuncRet::YieldStar(_)) => {
            let err = ctx.new_error(
                crate::error::ErrorKind::Internal,
                "async function cannot yield",
            );
            let reject = record.reject.borrow().clone();
            ctx.call(&reject, &Value::Undefined, &[err])?;
            Ok(())
        }
        Err(_) => {
            let reason = ctx.get_exception();
            let reject = record.reject.borrow().clone();
            ctx.call(&reject, &Value::Undefined, &[reason])?;
            Ok(())
        }
    }
}

fn holder_record(holder: &Value) -> GcRef<AsyncFunctionRecord> {
    holder
        .as_object()
        .expect("holder object")
        .with_data(|d| match d {
            ObjectData::Opaque(o) => o
                .as_any()
                .downcast_ref::<AsyncRecordHolder>()
                .map(|h| h.0.clone()),
            _ => None,
        })
        .expect("async record holder")
}
