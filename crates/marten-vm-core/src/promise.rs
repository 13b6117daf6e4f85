//! Promises and the reaction machinery
//!
//! The state machine follows the language spec: `resolve` and `reject`
//! share an `already_resolved` flag and the first call wins;
//! self-resolution is a `TypeError`; resolving with a thenable defers a
//! `ResolveThenableJob`; settled promises drain their reaction list in
//! FIFO order through `PromiseReactionJob`s on the runtime job queue.
//! Nothing ever runs a reaction inline from `then`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcRef};

use crate::context::Context;
use crate::error::{ErrorKind, JsResult};
use crate::object::{JsObject, ObjectData, Property, class_ids, obj_flags};
use crate::runtime::JobFn;
use crate::shape::PropFlags;
use crate::value::Value;

/// Promise lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Not settled
    Pending,
    /// Settled with a value
    Fulfilled,
    /// Settled with a reason
    Rejected,
}

/// `(on_settled, resolving functions of the derived promise)`.
pub struct Reaction {
    /// Handler (`None` = identity on fulfill, rethrow on reject)
    pub handler: Option<Value>,
    /// Derived-promise capability, when one exists
    pub capability: Option<PromiseCapability>,
}

impl Reaction {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        if let Some(h) = &self.handler {
            h.trace(mark);
        }
        if let Some(c) = &self.capability {
            c.promise.trace(mark);
            c.resolve.trace(mark);
            c.reject.trace(mark);
        }
    }
}

/// A promise plus its resolving functions.
#[derive(Clone)]
pub struct PromiseCapability {
    /// The derived promise
    pub promise: Value,
    /// Its resolve function
    pub resolve: Value,
    /// Its reject function
    pub reject: Value,
}

/// Promise payload.
pub struct PromiseData {
    state: Cell<PromiseState>,
    result: RefCell<Value>,
    fulfill_reactions: RefCell<Vec<Reaction>>,
    reject_reactions: RefCell<Vec<Reaction>>,
    is_handled: Cell<bool>,
}

impl PromiseData {
    pub(crate) fn new() -> PromiseData {
        PromiseData {
            state: Cell::new(PromiseState::Pending),
            result: RefCell::new(Value::Undefined),
            fulfill_reactions: RefCell::new(Vec::new()),
            reject_reactions: RefCell::new(Vec::new()),
            is_handled: Cell::new(false),
        }
    }

    /// Current state.
    pub fn state(&self) -> PromiseState {
        self.state.get()
    }

    /// Settled value or reason.
    pub fn result(&self) -> Value {
        self.result.borrow().clone()
    }

    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        self.result.borrow().trace(mark);
        for r in self.fulfill_reactions.borrow().iter() {
            r.trace(mark);
        }
        for r in self.reject_reactions.borrow().iter() {
            r.trace(mark);
        }
    }
}

fn with_promise_data<R>(obj: &GcRef<JsObject>, f: impl FnOnce(&PromiseData) -> R) -> Option<R> {
    obj.with_data(|d| match d {
        ObjectData::Promise(p) => Some(f(p)),
        _ => None,
    })
}

impl Context {
    /// A fresh pending promise.
    pub fn new_promise(&self) -> GcRef<JsObject> {
        self.new_object_class(
            class_ids::PROMISE,
            ObjectData::Promise(Box::new(PromiseData::new())),
        )
    }

    /// State of a promise object.
    pub fn promise_state(&self, promise: &GcRef<JsObject>) -> Option<PromiseState> {
        with_promise_data(promise, |p| p.state())
    }

    /// Settled result of a promise object.
    pub fn promise_result(&self, promise: &GcRef<JsObject>) -> Option<Value> {
        with_promise_data(promise, |p| p.result())
    }

    /// The `resolve`/`reject` pair for `promise`, sharing an
    /// `already_resolved` flag; the first call wins.
    pub fn create_resolving_functions(&self, promise: &GcRef<JsObject>) -> (Value, Value) {
        let already = Rc::new(Cell::new(false));
        let already2 = already.clone();
        let resolve = self.new_native_function_data(
            "resolve",
            1,
            0,
            vec![Value::Object(promise.clone())],
            Rc::new(move |ctx, _this, args, data, _magic| {
                if already.replace(true) {
                    return Ok(Value::Undefined);
                }
                let promise = data[0].as_object().cloned().expect("promise in data");
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                ctx.resolve_promise(&promise, value)?;
                Ok(Value::Undefined)
            }),
        );
        let reject = self.new_native_function_data(
            "reject",
            1,
            0,
            vec![Value::Object(promise.clone())],
            Rc::new(move |ctx, _this, args, data, _magic| {
                if already2.replace(true) {
                    return Ok(Value::Undefined);
                }
                let promise = data[0].as_object().cloned().expect("promise in data");
                let reason = args.first().cloned().unwrap_or(Value::Undefined);
                ctx.reject_promise(&promise, reason);
                Ok(Value::Undefined)
            }),
        );
        (Value::Object(resolve), Value::Object(reject))
    }

    /// The `resolve(v)` algorithm: self-resolution throws, thenables
    /// defer, anything else fulfills.
    pub fn resolve_promise(&self, promise: &GcRef<JsObject>, value: Value) -> JsResult<()> {
        if let Some(vobj) = value.as_object()
            && GcRef::ptr_eq(vobj, promise)
        {
            let err = self.new_error(ErrorKind::Type, "a promise cannot resolve itself");
            self.reject_promise(promise, err);
            return Ok(());
        }
        if value.is_object() {
            let then = self.get_property_value(&value, self.rt.common_atoms().then);
            let then = match then {
                Ok(t) => t,
                Err(e) => {
                    let reason = self.get_exception();
                    self.reject_promise(promise, reason);
                    let _ = e;
                    return Ok(());
                }
            };
            if self.is_callable(&then) {
                // Still pending: the thenable drives the outcome from a
                // job-queue turn.
                let func: JobFn = Rc::new(resolve_thenable_job);
                self.rt.enqueue_job(
                    self.realm.clone(),
                    func,
                    vec![Value::Object(promise.clone()), value, then],
                );
                return Ok(());
            }
        }
        self.fulfill_promise(promise, value);
        Ok(())
    }

    /// Transition to fulfilled and schedule the fulfill reactions.
    pub fn fulfill_promise(&self, promise: &GcRef<JsObject>, value: Value) {
        let reactions = with_promise_data(promise, |p| {
            if p.state() != PromiseState::Pending {
                return Vec::new();
            }
            p.state.set(PromiseState::Fulfilled);
            *p.result.borrow_mut() = value.clone();
            p.reject_reactions.borrow_mut().clear();
            std::mem::take(&mut *p.fulfill_reactions.borrow_mut())
        })
        .unwrap_or_default();
        for reaction in reactions {
            self.enqueue_reaction_job(reaction, value.clone(), false);
        }
    }

    /// Transition to rejected, schedule the reject reactions, and report
    /// an unhandled rejection to the host tracker.
    pub fn reject_promise(&self, promise: &GcRef<JsObject>, reason: Value) {
        let (reactions, was_handled) = with_promise_data(promise, |p| {
            if p.state() != PromiseState::Pending {
                return (Vec::new(), true);
            }
            p.state.set(PromiseState::Rejected);
            *p.result.borrow_mut() = reason.clone();
            p.fulfill_reactions.borrow_mut().clear();
            (
                std::mem::take(&mut *p.reject_reactions.borrow_mut()),
                p.is_handled.get(),
            )
        })
        .unwrap_or((Vec::new(), true));
        if !was_handled {
            self.call_rejection_tracker(promise, &reason, false);
        }
        for reaction in reactions {
            self.enqueue_reaction_job(reaction, reason.clone(), true);
        }
    }

    fn call_rejection_tracker(&self, promise: &GcRef<JsObject>, reason: &Value, handled: bool) {
        let tracker = self.rt.inner.rejection_tracker.borrow();
        if let Some(t) = tracker.as_ref() {
            t(self, &Value::Object(promise.clone()), reason, handled);
        }
    }

    fn enqueue_reaction_job(&self, reaction: Reaction, arg: Value, is_reject: bool) {
        let handler = reaction.handler.unwrap_or(Value::Undefined);
        let (cap_promise, cap_resolve, cap_reject) = match reaction.capability {
            Some(c) => (c.promise, c.resolve, c.reject),
            None => (Value::Undefined, Value::Undefined, Value::Undefined),
        };
        let func: JobFn = Rc::new(promise_reaction_job);
        self.rt.enqueue_job(
            self.realm.clone(),
            func,
            vec![
                handler,
                arg,
                Value::Bool(is_reject),
                cap_promise,
                cap_resolve,
                cap_reject,
            ],
        );
    }

    /// `PerformPromiseThen`.
    pub fn perform_promise_then(
        &self,
        promise: &GcRef<JsObject>,
        on_fulfilled: Option<Value>,
        on_rejected: Option<Value>,
        capability: Option<PromiseCapability>,
    ) -> JsResult<()> {
        let on_fulfilled = on_fulfilled.filter(|f| self.is_callable(f));
        let on_rejected = on_rejected.filter(|f| self.is_callable(f));
        let state = with_promise_data(promise, |p| p.state())
            .ok_or_else(|| self.throw_type_error("not a promise"))?;
        match state {
            PromiseState::Pending => {
                with_promise_data(promise, |p| {
                    p.fulfill_reactions.borrow_mut().push(Reaction {
                        handler: on_fulfilled.clone(),
                        capability: capability.clone(),
                    });
                    p.reject_reactions.borrow_mut().push(Reaction {
                        handler: on_rejected.clone(),
                        capability: capability.clone(),
                    });
                });
            }
            PromiseState::Fulfilled => {
                let value = with_promise_data(promise, |p| p.result()).unwrap();
                self.enqueue_reaction_job(
                    Reaction {
                        handler: on_fulfilled,
                        capability,
                    },
                    value,
                    false,
                );
            }
            PromiseState::Rejected => {
                let reason = with_promise_data(promise, |p| p.result()).unwrap();
                let was_handled =
                    with_promise_data(promise, |p| p.is_handled.get()).unwrap_or(true);
                if !was_handled {
                    self.call_rejection_tracker(promise, &reason, true);
                }
                self.enqueue_reaction_job(
                    Reaction {
                        handler: on_rejected,
                        capability,
                    },
                    reason,
                    true,
                );
            }
        }
        with_promise_data(promise, |p| p.is_handled.set(true));
        Ok(())
    }

    /// `promise.then(onFulfilled, onRejected)` with a species-derived
    /// result promise.
    pub fn promise_then(
        &self,
        promise: &Value,
        on_fulfilled: Option<Value>,
        on_rejected: Option<Value>,
    ) -> JsResult<Value> {
        let Some(pobj) = promise.as_object().filter(|o| {
            o.class_id() == class_ids::PROMISE
        }) else {
            return Err(self.throw_type_error("then called on a non-promise"));
        };
        let ctor = self.species_constructor(promise, &self.realm.promise_ctor())?;
        let capability = self.new_promise_capability(&ctor)?;
        self.perform_promise_then(
            pobj,
            on_fulfilled,
            on_rejected,
            Some(capability.clone()),
        )?;
        Ok(capability.promise)
    }

    /// `SpeciesConstructor(obj, default)`: a non-constructor `@@species`
    /// is a `TypeError`.
    pub fn species_constructor(&self, obj: &Value, default_ctor: &Value) -> JsResult<Value> {
        let ctor = self.get_property_value(obj, self.rt.common_atoms().constructor)?;
        if ctor.is_undefined() {
            return Ok(default_ctor.clone());
        }
        if !ctor.is_object() {
            return Err(self.throw_type_error("constructor is not an object"));
        }
        let symbols = self.realm.symbols();
        let species_atom = self.rt.intern_symbol_atom(&symbols.species);
        let species = self.get_property_value(&ctor, species_atom);
        self.rt.release_atom(species_atom);
        let species = species?;
        if species.is_nullish() {
            return Ok(default_ctor.clone());
        }
        let is_ctor = species
            .as_object()
            .map(|o| o.has_flag(obj_flags::CONSTRUCTOR))
            .unwrap_or(false);
        if !is_ctor {
            return Err(self.throw_type_error("@@species is not a constructor"));
        }
        Ok(species)
    }

    /// `NewPromiseCapability(C)`.
    pub fn new_promise_capability(&self, ctor: &Value) -> JsResult<PromiseCapability> {
        let intrinsic = self.realm.promise_ctor();
        if Value::strict_eq(ctor, &intrinsic) || ctor.is_undefined() {
            let promise = self.new_promise();
            let (resolve, reject) = self.create_resolving_functions(&promise);
            return Ok(PromiseCapability {
                promise: Value::Object(promise),
                resolve,
                reject,
            });
        }
        // Foreign constructor: hand it an executor that exfiltrates the
        // resolving functions.
        let captured: Rc<RefCell<(Value, Value)>> =
            Rc::new(RefCell::new((Value::Undefined, Value::Undefined)));
        let captured2 = captured.clone();
        let executor = self.new_native_function(
            "",
            2,
            Rc::new(move |_ctx, _this, args, _data, _magic| {
                *captured2.borrow_mut() = (
                    args.first().cloned().unwrap_or(Value::Undefined),
                    args.get(1).cloned().unwrap_or(Value::Undefined),
                );
                Ok(Value::Undefined)
            }),
        );
        let promise = self.call_constructor(ctor, &[Value::Object(executor)])?;
        let (resolve, reject) = captured.borrow().clone();
        if !self.is_callable(&resolve) || !self.is_callable(&reject) {
            return Err(self.throw_type_error("executor did not produce resolving functions"));
        }
        Ok(PromiseCapability {
            promise,
            resolve,
            reject,
        })
    }

    /// `Promise.resolve(value)` against an arbitrary constructor.
    pub fn promise_resolve_with(&self, ctor: &Value, value: &Value) -> JsResult<Value> {
        if let Some(obj) = value.as_object()
            && obj.class_id() == class_ids::PROMISE
        {
            let vctor =
                self.get_property_value(value, self.rt.common_atoms().constructor)?;
            if Value::strict_eq(&vctor, ctor) {
                return Ok(value.clone());
            }
        }
        let cap = self.new_promise_capability(ctor)?;
        self.call(&cap.resolve, &Value::Undefined, &[value.clone()])?;
        Ok(cap.promise)
    }

    /// `Promise.resolve(value)` with the intrinsic constructor.
    pub fn promise_resolve(&self, value: &Value) -> JsResult<Value> {
        self.promise_resolve_with(&self.realm.promise_ctor(), value)
    }

    /// `Promise.reject(reason)` with the intrinsic constructor.
    pub fn promise_reject(&self, reason: &Value) -> JsResult<Value> {
        let promise = self.new_promise();
        self.reject_promise(&promise, reason.clone());
        Ok(Value::Object(promise))
    }

    /// Collect the values of an iterable: the iterator protocol when
    /// `@@iterator` is installed, the index/length walk for arrays.
    pub fn iterable_to_values(&self, iterable: &Value) -> JsResult<Vec<Value>> {
        if let Some(obj) = iterable.as_object() {
            let symbols = self.realm.symbols();
            let iter_atom = self.rt.intern_symbol_atom(&symbols.iterator);
            let method = self.get_property_value(iterable, iter_atom);
            self.rt.release_atom(iter_atom);
            let method = method?;
            if self.is_callable(&method) {
                let iter = self.call(&method, iterable, &[])?;
                let common = self.rt.common_atoms();
                let next_fn = self.get_property_value(&iter, common.next)?;
                let mut out = Vec::new();
                loop {
                    let step = self.call(&next_fn, &iter, &[])?;
                    let done = self.get_property_value(&step, common.done)?;
                    if self.to_boolean(&done) {
                        return Ok(out);
                    }
                    out.push(self.get_property_value(&step, common.value)?);
                }
            }
            if obj.class_id() == class_ids::ARRAY {
                let len = crate::array::array_length(self, obj)?;
                let mut out = Vec::with_capacity(len as usize);
                for i in 0..len {
                    out.push(
                        self.get_property_value(iterable, crate::atom::Atom::from_index(i))?,
                    );
                }
                return Ok(out);
            }
        }
        Err(self.throw_type_error("value is not iterable"))
    }
}

/// One queued reaction: args are
/// `[handler, arg, is_reject, cap_promise, cap_resolve, cap_reject]`.
fn promise_reaction_job(ctx: &Context, args: &[Value]) -> JsResult<Value> {
    let handler = &args[0];
    let arg = &args[1];
    let is_reject = args[2].as_bool().unwrap_or(false);
    let cap_promise = &args[3];
    let cap_resolve = &args[4];
    let cap_reject = &args[5];
    let has_capability = !cap_promise.is_undefined();

    let outcome = if handler.is_undefined() {
        if is_reject {
            Err(ctx.throw(arg.clone()))
        } else {
            Ok(arg.clone())
        }
    } else {
        ctx.call(handler, &Value::Undefined, &[arg.clone()])
    };
    if !has_capability {
        // Internal reaction (await driver): let a failure surface to the
        // job executor instead of leaving the slot armed.
        return outcome;
    }
    match outcome {
        Ok(v) => ctx.call(cap_resolve, &Value::Undefined, &[v]),
        Err(_) => {
            let reason = ctx.get_exception();
            ctx.call(cap_reject, &Value::Undefined, &[reason])
        }
    }
}

/// `ResolveThenableJob`: args are `[promise, thenable, then]`.
fn resolve_thenable_job(ctx: &Context, args: &[Value]) -> JsResult<Value> {
    let promise = args[0].as_object().cloned().expect("promise argument");
    let thenable = &args[1];
    let then = &args[2];
    let (resolve, reject) = ctx.create_resolving_functions(&promise);
    match ctx.call(then, thenable, &[resolve, reject.clone()]) {
        Ok(v) => Ok(v),
        Err(_) => {
            let reason = ctx.get_exception();
            ctx.call(&reject, &Value::Undefined, &[reason])
        }
    }
}

// ============================================================================
// combinators
// ============================================================================

/// Which aggregate a combinator builds.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AggregateKind {
    All,
    AllSettled,
    Any,
}

impl Context {
    /// `Promise.all`.
    pub fn promise_all(&self, iterable: &Value) -> JsResult<Value> {
        self.promise_aggregate(AggregateKind::All, iterable)
    }

    /// `Promise.allSettled`.
    pub fn promise_all_settled(&self, iterable: &Value) -> JsResult<Value> {
        self.promise_aggregate(AggregateKind::AllSettled, iterable)
    }

    /// `Promise.any`.
    pub fn promise_any(&self, iterable: &Value) -> JsResult<Value> {
        self.promise_aggregate(AggregateKind::Any, iterable)
    }

    /// `Promise.race`.
    pub fn promise_race(&self, iterable: &Value) -> JsResult<Value> {
        let ctor = self.realm.promise_ctor();
        let cap = self.new_promise_capability(&ctor)?;
        let values = self.iterable_to_values(iterable)?;
        for v in values {
            let p = self.promise_resolve_with(&ctor, &v)?;
            let then = self.get_property_value(&p, self.rt.common_atoms().then)?;
            self.call(&then, &p, &[cap.resolve.clone(), cap.reject.clone()])?;
        }
        Ok(cap.promise)
    }

    fn promise_aggregate(&self, kind: AggregateKind, iterable: &Value) -> JsResult<Value> {
        let ctor = self.realm.promise_ctor();
        let cap = self.new_promise_capability(&ctor)?;
        let values = self.iterable_to_values(iterable)?;
        let count = values.len();
        let results = self.new_array_from(vec![Value::Undefined; count]);
        let remaining = Rc::new(Cell::new(count));
        if count == 0 {
            match kind {
                AggregateKind::Any => {
                    let err = self.new_aggregate_error(&[], "all promises were rejected")?;
                    self.call(&cap.reject, &Value::Undefined, &[err])?;
                }
                _ => {
                    self.call(
                        &cap.resolve,
                        &Value::Undefined,
                        &[Value::Object(results)],
                    )?;
                }
            }
            return Ok(cap.promise);
        }
        for (i, v) in values.into_iter().enumerate() {
            let p = self.promise_resolve_with(&ctor, &v)?;
            let (on_fulfilled, on_rejected) =
                self.aggregate_element_handlers(kind, i as i32, &results, &cap, &remaining);
            let then = self.get_property_value(&p, self.rt.common_atoms().then)?;
            self.call(&then, &p, &[on_fulfilled, on_rejected])?;
        }
        Ok(cap.promise)
    }

    fn aggregate_element_handlers(
        &self,
        kind: AggregateKind,
        index: i32,
        results: &GcRef<JsObject>,
        cap: &PromiseCapability,
        remaining: &Rc<Cell<usize>>,
    ) -> (Value, Value) {
        match kind {
            AggregateKind::All => {
                let remaining_f = remaining.clone();
                let on_fulfilled = self.new_native_function_data(
                    "",
                    1,
                    index,
                    vec![Value::Object(results.clone()), cap.resolve.clone()],
                    Rc::new(move |ctx, _this, args, data, magic| {
                        let v = args.first().cloned().unwrap_or(Value::Undefined);
                        aggregate_settle(ctx, data, magic, v, &remaining_f)
                    }),
                );
                (Value::Object(on_fulfilled), cap.reject.clone())
            }
            AggregateKind::AllSettled => {
                let make = |fulfilled: bool| -> Value {
                    let remaining_c = remaining.clone();
                    let f = self.new_native_function_data(
                        "",
                        1,
                        index,
                        vec![Value::Object(results.clone()), cap.resolve.clone()],
                        Rc::new(move |ctx, _this, args, data, magic| {
                            let v = args.first().cloned().unwrap_or(Value::Undefined);
                            let record = ctx.new_plain_object();
                            let this = Value::Object(record);
                            let status_atom = ctx.rt().intern_atom("status");
                            let r = if fulfilled {
                                let _ = ctx.set_property_value(
                                    &this,
                                    status_atom,
                                    Value::string("fulfilled"),
                                );
                                let value_atom = ctx.rt().common_atoms().value;
                                ctx.set_property_value(&this, value_atom, v)
                            } else {
                                let _ = ctx.set_property_value(
                                    &this,
                                    status_atom,
                                    Value::string("rejected"),
                                );
                                let reason_atom = ctx.rt().intern_atom("reason");
                                let r = ctx.set_property_value(&this, reason_atom, v);
                                ctx.rt().release_atom(reason_atom);
                                r
                            };
                            ctx.rt().release_atom(status_atom);
                            r?;
                            aggregate_settle(ctx, data, magic, this, &remaining_c)
                        }),
                    );
                    Value::Object(f)
                };
                (make(true), make(false))
            }
            AggregateKind::Any => {
                let remaining_r = remaining.clone();
                let on_rejected = self.new_native_function_data(
                    "",
                    1,
                    index,
                    vec![Value::Object(results.clone()), cap.reject.clone()],
                    Rc::new(move |ctx, _this, args, data, magic| {
                        let v = args.first().cloned().unwrap_or(Value::Undefined);
                        let results = data[0].as_object().cloned().expect("errors array");
                        let reject_fn = &data[1];
                        ctx.set_property_value(
                            &Value::Object(results.clone()),
                            crate::atom::Atom::from_index(magic as u32),
                            v,
                        )?;
                        let left = remaining_r.get() - 1;
                        remaining_r.set(left);
                        if left == 0 {
                            let len = crate::array::array_length(ctx, &results)?;
                            let mut errors = Vec::with_capacity(len as usize);
                            for i in 0..len {
                                errors.push(ctx.get_property_value(
                                    &Value::Object(results.clone()),
                                    crate::atom::Atom::from_index(i),
                                )?);
                            }
                            let err = ctx
                                .new_aggregate_error(&errors, "all promises were rejected")?;
                            ctx.call(reject_fn, &Value::Undefined, &[err])?;
                        }
                        Ok(Value::Undefined)
                    }),
                );
                (cap.resolve.clone(), Value::Object(on_rejected))
            }
        }
    }
}

/// Store one aggregate element result and resolve the aggregate when the
/// shared remaining-count reaches zero. `data` is
/// `[results_array, settle_fn]`; `index` arrives as the closure magic.
fn aggregate_settle(
    ctx: &Context,
    data: &[Value],
    index: i32,
    outcome: Value,
    remaining: &Rc<Cell<usize>>,
) -> JsResult<Value> {
    let results = data[0].as_object().cloned().expect("results array");
    let settle_fn = &data[1];
    ctx.set_property_value(
        &Value::Object(results.clone()),
        crate::atom::Atom::from_index(index as u32),
        outcome,
    )?;
    let left = remaining.get() - 1;
    remaining.set(left);
    if left == 0 {
        ctx.call(settle_fn, &Value::Undefined, &[Value::Object(results)])?;
    }
    Ok(Value::Undefined)
}

impl Context {
    /// An `AggregateError` with an `errors` array property.
    pub fn new_aggregate_error(&self, errors: &[Value], message: &str) -> JsResult<Value> {
        let err = self.new_error(ErrorKind::Aggregate, message);
        if let Some(obj) = err.as_object() {
            let errors_atom = self.rt.intern_atom("errors");
            let arr = self.new_array_from(errors.to_vec());
            self.define_own_property_raw(
                obj,
                errors_atom,
                Property::Value(Value::Object(arr)),
                PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::CONFIGURABLE),
            );
            self.rt.release_atom(errors_atom);
        }
        Ok(err)
    }
}
