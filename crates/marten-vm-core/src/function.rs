//! Function records and the interpreter seam
//!
//! The bytecode compiler and interpreter loop are external collaborators.
//! `FunctionBytecode` carries everything the object model needs (name,
//! flags, buffer sizes, closure-variable descriptors, a constant pool)
//! plus a [`FunctionBody`] trait object the collaborator supplies with the
//! actual executable behavior. Tests stand in for the interpreter by
//! implementing `FunctionBody` with Rust closures.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcRef, Trace};

use crate::atom::Atom;
use crate::context::{Context, Realm};
use crate::coroutine::{Completion, Coroutine, FuncRet};
use crate::error::JsResult;
use crate::frame::VarRef;
use crate::object::JsObject;
use crate::value::Value;

/// One captured variable in a function's closure description.
#[derive(Clone, Copy, Debug)]
pub struct ClosureVarDef {
    /// Binding name
    pub name: Atom,
    /// Capture from the creating frame's locals (`true`) or from the
    /// creating closure's own captured cells (`false`)
    pub is_local: bool,
    /// Slot in the frame locals or index into the parent capture list
    pub idx: u32,
}

/// Function behavior flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct FunctionFlags {
    /// Strict-mode body
    pub strict: bool,
    /// `async function`
    pub is_async: bool,
    /// `function*`
    pub is_generator: bool,
}

/// Token naming the active frame during a [`FunctionBody::call`]. Frame
/// contents are reached through `Context` accessors.
#[derive(Clone, Copy, Debug)]
pub struct FrameRef {
    /// Depth on the runtime frame stack
    pub depth: usize,
}

/// Executable behavior supplied by the interpreter collaborator.
pub trait FunctionBody {
    /// Run a plain function activation to completion.
    fn call(&self, ctx: &Context, frame: FrameRef) -> JsResult<Value>;

    /// Advance a suspendable activation (generator or async function) by
    /// one step. The default refuses: plain functions are not resumable.
    fn resume(
        &self,
        ctx: &Context,
        coroutine: &mut Coroutine,
        input: Completion,
    ) -> JsResult<FuncRet> {
        let _ = (coroutine, input);
        Err(ctx.throw_type_error("function is not resumable"))
    }
}

/// Compiled-function record (GC kind `FunctionBytecode`).
///
/// GC-tracked because the constant pool may hold objects (template
/// objects, child function prototypes) that can cycle back.
pub struct FunctionBytecode {
    /// Function name atom (released by the sweeper)
    pub name: Cell<Atom>,
    /// Behavior flags
    pub flags: FunctionFlags,
    /// Declared parameter count
    pub arg_count: u16,
    /// Local variable count (beyond arguments)
    pub var_count: u16,
    /// Captured-variable descriptors
    pub closure_vars: Vec<ClosureVarDef>,
    /// Constant pool
    pub cpool: RefCell<Vec<Value>>,
    /// Source file for backtraces
    pub filename: Option<Rc<crate::string::JsString>>,
    /// Executable behavior; absent on unlinked deserialized records
    pub body: RefCell<Option<Rc<dyn FunctionBody>>>,
}

impl Trace for FunctionBytecode {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        for v in self.cpool.borrow().iter() {
            v.trace(mark);
        }
    }
}

impl FunctionBytecode {
    /// Assemble a record. The caller owns the `name` atom reference
    /// transferred in.
    pub fn new(
        name: Atom,
        flags: FunctionFlags,
        arg_count: u16,
        var_count: u16,
        closure_vars: Vec<ClosureVarDef>,
        body: Option<Rc<dyn FunctionBody>>,
    ) -> FunctionBytecode {
        FunctionBytecode {
            name: Cell::new(name),
            flags,
            arg_count,
            var_count,
            closure_vars,
            cpool: RefCell::new(Vec::new()),
            filename: None,
            body: RefCell::new(body),
        }
    }

    /// The executable body, or a pending `TypeError` if unlinked.
    pub fn body_or_throw(&self, ctx: &Context) -> JsResult<Rc<dyn FunctionBody>> {
        match self.body.borrow().as_ref() {
            Some(b) => Ok(b.clone()),
            None => Err(ctx.throw_internal_error("function body is not linked")),
        }
    }
}

impl std::fmt::Debug for FunctionBytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionBytecode")
            .field("arg_count", &self.arg_count)
            .field("var_count", &self.var_count)
            .field("closure_vars", &self.closure_vars.len())
            .finish()
    }
}

/// Object payload of a bytecode function: the record plus captured cells.
pub struct ClosureData {
    /// Compiled record
    pub func: GcRef<FunctionBytecode>,
    /// Captured cells, one per `closure_vars` entry
    pub var_refs: Vec<GcRef<VarRef>>,
    /// `[[HomeObject]]` for method `super` access
    pub home_object: Option<GcRef<JsObject>>,
    /// Realm the function was created in
    pub realm: GcRef<Realm>,
}

impl ClosureData {
    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        mark(self.func.as_any());
        for vr in &self.var_refs {
            mark(vr.as_any());
        }
        if let Some(home) = &self.home_object {
            mark(home.as_any());
        }
        mark(self.realm.as_any());
    }
}

/// Native function signature: `(ctx, this, args, data, magic)`.
///
/// `data` is the GC-traced payload captured at creation
/// (`new_native_function_data`), the mechanism promise resolving
/// functions and combinator closures are built from. `magic`
/// distinguishes siblings sharing one entry point.
pub type NativeFn = Rc<dyn Fn(&Context, &Value, &[Value], &[Value], i32) -> JsResult<Value>>;

/// Object payload of a native function.
pub struct NativeFunctionData {
    /// Realm to execute in
    pub realm: GcRef<Realm>,
    /// Entry point
    pub func: NativeFn,
    /// Sibling discriminator
    pub magic: i32,
    /// GC-traced captured values
    pub data: Vec<Value>,
}

impl NativeFunctionData {
    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        mark(self.realm.as_any());
        for v in &self.data {
            v.trace(mark);
        }
    }
}

/// Object payload of a bound function.
pub struct BoundFunctionData {
    /// The wrapped callable
    pub target: Value,
    /// Bound `this`
    pub this_val: Value,
    /// Leading bound arguments
    pub bound_args: Vec<Value>,
}

impl BoundFunctionData {
    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        self.target.trace(mark);
        self.this_val.trace(mark);
        for v in &self.bound_args {
            v.trace(mark);
        }
    }
}

/// Call-site flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallFlags {
    /// `new`-style invocation
    pub constructor: bool,
    /// Resume a suspendable function instead of starting it
    pub generator: bool,
}

/// Convert a body closure into a boxed trait object.
///
/// Convenience for hosts and tests: `body_fn(|ctx, frame| ...)`.
pub fn body_fn<F>(f: F) -> Rc<dyn FunctionBody>
where
    F: Fn(&Context, FrameRef) -> JsResult<Value> + 'static,
{
    struct FnBody<F>(F);
    impl<F> FunctionBody for FnBody<F>
    where
        F: Fn(&Context, FrameRef) -> JsResult<Value> + 'static,
    {
        fn call(&self, ctx: &Context, frame: FrameRef) -> JsResult<Value> {
            (self.0)(ctx, frame)
        }
    }
    Rc::new(FnBody(f))
}

/// A resumable body built from a step closure; used for generators and
/// async functions in tests and by simple hosts.
pub fn resumable_body_fn<F>(f: F) -> Rc<dyn FunctionBody>
where
    F: Fn(&Context, &mut Coroutine, Completion) -> JsResult<FuncRet> + 'static,
{
    struct StepBody<F>(F);
    impl<F> FunctionBody for StepBody<F>
    where
        F: Fn(&Context, &mut Coroutine, Completion) -> JsResult<FuncRet> + 'static,
    {
        fn call(&self, ctx: &Context, _frame: FrameRef) -> JsResult<Value> {
            Err(ctx.throw_type_error("suspendable function requires generator call flag"))
        }

        fn resume(
            &self,
            ctx: &Context,
            coroutine: &mut Coroutine,
            input: Completion,
        ) -> JsResult<FuncRet> {
            (self.0)(ctx, coroutine, input)
        }
    }
    Rc::new(StepBody(f))
}
