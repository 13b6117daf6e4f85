//! The runtime: heap, atom table, shape cache, class registry, job queue
//!
//! There is no global state. Every table lives on the runtime, a runtime
//! belongs to one thread (`Rc` interior, `!Send`), and two runtimes share
//! nothing; passing a value between them requires serialization.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcHeap, GcKind, GcRef, GcStats, Sweeper};

use crate::atom::{Atom, AtomTable, CommonAtoms, JsSymbol};
use crate::class::{ClassDef, ClassRegistry};
use crate::context::{Context, Realm};
use crate::error::JsException;
use crate::frame::Frame;
use crate::function::FunctionBytecode;
use crate::module::ModuleRecord;
use crate::object::{ClassId, JsObject};
use crate::shape::{Shape, ShapeCache, shape_hash_step, shape_initial_hash};
use crate::string::JsString;
use crate::value::Value;
use crate::weak::WeakSlot;

/// A deferred computation on the job FIFO.
pub struct Job {
    /// Realm the job executes in
    pub realm: GcRef<Realm>,
    /// Entry point
    pub func: JobFn,
    /// Arguments, duplicated at enqueue time and released after the run
    pub args: Vec<Value>,
}

/// Job entry point.
pub type JobFn = Rc<dyn Fn(&Context, &[Value]) -> crate::error::JsResult<Value>>;

/// Host hook invoked for unhandled promise rejections:
/// `(ctx, promise, reason, is_handled)`.
pub type RejectionTracker = Box<dyn Fn(&Context, &Value, &Value, bool)>;

/// Host hook polled at interpreter back-edges; returning `true` aborts.
pub type InterruptHandler = Box<dyn Fn() -> bool>;

pub(crate) struct RuntimeInner {
    pub(crate) atoms: Rc<RefCell<AtomTable>>,
    pub(crate) common: CommonAtoms,
    pub(crate) classes: Rc<RefCell<ClassRegistry>>,
    pub(crate) shapes: Rc<RefCell<ShapeCache>>,
    pub(crate) realms: Rc<RefCell<Vec<GcAny>>>,
    pub(crate) current_exception: RefCell<Option<Value>>,
    pub(crate) uncatchable: Cell<bool>,
    pub(crate) jobs: RefCell<VecDeque<Job>>,
    pub(crate) frames: RefCell<Vec<Frame>>,
    pub(crate) interrupt: RefCell<Option<InterruptHandler>>,
    pub(crate) rejection_tracker: RefCell<Option<RejectionTracker>>,
    pub(crate) module_loader: RefCell<Option<Rc<dyn crate::module::ModuleLoader>>>,
    pub(crate) loaded_modules: RefCell<Vec<(String, GcRef<ModuleRecord>)>>,
    pub(crate) compiler: RefCell<Option<Rc<dyn crate::eval::Compiler>>>,
    pub(crate) stack_top: Cell<usize>,
    pub(crate) max_stack_size: Cell<usize>,
    /// Declared last: dropping the heap force-frees leftover allocations,
    /// so every value-holding field above must already be gone.
    pub(crate) heap: GcHeap,
}

/// Sweep callbacks wired into the heap. Holds only the side tables (no
/// handles, no heap) so it cannot pin the world.
struct RuntimeSweeper {
    atoms: Rc<RefCell<AtomTable>>,
    classes: Rc<RefCell<ClassRegistry>>,
    shapes: Rc<RefCell<ShapeCache>>,
    realms: Rc<RefCell<Vec<GcAny>>>,
}

impl Sweeper for RuntimeSweeper {
    fn clear_weak(&self, obj: GcAny) {
        if obj.kind() != GcKind::Object {
            return;
        }
        let Some(object) = obj.downcast_ref::<JsObject>() else {
            return;
        };
        for slot in object.take_weak_slots() {
            WeakSlot::clear_for_dead_target(&slot);
        }
    }

    fn finalize(&self, any: GcAny) {
        match any.kind() {
            GcKind::Object => {
                if let Some(object) = any.downcast_ref::<JsObject>() {
                    let classes = self.classes.borrow();
                    if let Some(def) = classes.get(object.class_id())
                        && let Some(fin) = &def.finalizer
                    {
                        fin(object);
                    }
                }
            }
            GcKind::Shape => {
                if let Some(shape) = any.downcast_ref::<Shape>() {
                    if shape.is_hashed() {
                        self.shapes.borrow_mut().remove(shape, any.addr());
                    }
                    let mut atoms = self.atoms.borrow_mut();
                    for prop in shape.props_snapshot() {
                        if !prop.atom.is_null() {
                            atoms.release(prop.atom);
                        }
                    }
                }
            }
            GcKind::FunctionBytecode => {
                if let Some(func) = any.downcast_ref::<FunctionBytecode>() {
                    let mut atoms = self.atoms.borrow_mut();
                    atoms.release(func.name.get());
                    for cv in &func.closure_vars {
                        atoms.release(cv.name);
                    }
                }
            }
            GcKind::Module => {
                if let Some(module) = any.downcast_ref::<ModuleRecord>() {
                    module.release_atoms(&mut self.atoms.borrow_mut());
                }
            }
            GcKind::Realm => {
                let addr = any.addr();
                self.realms.borrow_mut().retain(|r| r.addr() != addr);
            }
            GcKind::VarRef | GcKind::AsyncFunction => {}
        }
    }
}

/// Handle to a runtime instance. Cloning shares the instance; the last
/// clone tears it down.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Create a runtime with default limits.
    pub fn new() -> Runtime {
        let atoms = Rc::new(RefCell::new(AtomTable::new()));
        let common = CommonAtoms::new(&mut atoms.borrow_mut());
        let classes = Rc::new(RefCell::new(ClassRegistry::new()));
        let shapes = Rc::new(RefCell::new(ShapeCache::default()));
        let realms: Rc<RefCell<Vec<GcAny>>> = Rc::new(RefCell::new(Vec::new()));
        let heap = GcHeap::new();
        heap.set_sweeper(Rc::new(RuntimeSweeper {
            atoms: atoms.clone(),
            classes: classes.clone(),
            shapes: shapes.clone(),
            realms: realms.clone(),
        }));
        let stack_marker = 0u8;
        let rt = Runtime {
            inner: Rc::new(RuntimeInner {
                atoms,
                common,
                classes,
                shapes,
                realms,
                current_exception: RefCell::new(None),
                uncatchable: Cell::new(false),
                jobs: RefCell::new(VecDeque::new()),
                frames: RefCell::new(Vec::new()),
                interrupt: RefCell::new(None),
                rejection_tracker: RefCell::new(None),
                module_loader: RefCell::new(None),
                loaded_modules: RefCell::new(Vec::new()),
                compiler: RefCell::new(None),
                stack_top: Cell::new(&stack_marker as *const u8 as usize),
                max_stack_size: Cell::new(256 * 1024),
                heap,
            }),
        };
        crate::class::builtin::register_builtin_classes(&rt);
        rt
    }

    /// The heap (allocation, thresholds, collection).
    pub fn heap(&self) -> &GcHeap {
        &self.inner.heap
    }

    /// Identity comparison of runtime handles.
    pub fn same_runtime(a: &Runtime, b: &Runtime) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    // ---- atoms ----------------------------------------------------------

    /// Intern a Rust string as an atom (caller owns one reference).
    pub fn intern_atom(&self, s: &str) -> Atom {
        self.inner.atoms.borrow_mut().intern(s)
    }

    /// Intern an engine string as an atom.
    pub fn intern_string_atom(&self, s: Rc<JsString>) -> Atom {
        self.inner.atoms.borrow_mut().intern_string(s)
    }

    /// Property-key atom for a symbol.
    pub fn intern_symbol_atom(&self, sym: &Rc<JsSymbol>) -> Atom {
        self.inner.atoms.borrow_mut().intern_symbol(sym)
    }

    /// Take an extra atom reference.
    pub fn dup_atom(&self, atom: Atom) -> Atom {
        self.inner.atoms.borrow_mut().dup(atom)
    }

    /// Release one atom reference.
    pub fn release_atom(&self, atom: Atom) {
        self.inner.atoms.borrow_mut().release(atom);
    }

    /// String form of an atom.
    pub fn atom_to_string(&self, atom: Atom) -> Rc<JsString> {
        self.inner.atoms.borrow().to_string(atom)
    }

    /// Pre-interned names.
    pub fn common_atoms(&self) -> &CommonAtoms {
        &self.inner.common
    }

    /// Create a fresh unique symbol.
    pub fn new_symbol(&self, description: Option<Rc<JsString>>) -> Rc<JsSymbol> {
        self.inner
            .atoms
            .borrow_mut()
            .new_symbol(description, crate::atom::AtomKind::Symbol)
    }

    /// `Symbol.for`.
    pub fn symbol_for(&self, description: Rc<JsString>) -> Rc<JsSymbol> {
        self.inner.atoms.borrow_mut().symbol_for(description)
    }

    /// `Symbol.keyFor`: the registry key of a global symbol.
    pub fn symbol_key_for(&self, sym: &JsSymbol) -> Option<Rc<JsString>> {
        self.inner.atoms.borrow().symbol_key_for(sym)
    }

    // ---- shapes ---------------------------------------------------------

    /// The interned empty shape for `proto`, creating it on first use.
    pub fn initial_shape(&self, proto: Option<GcRef<JsObject>>) -> GcRef<Shape> {
        let hash = shape_initial_hash(proto.as_ref());
        {
            let shapes = self.inner.shapes.borrow();
            if let Some(found) = shapes.find(hash, |s| {
                s.prop_count() == 0 && proto_eq(&s.proto(), &proto)
            }) {
                return found;
            }
        }
        let shape = self
            .inner
            .heap
            .alloc(GcKind::Shape, Shape::new(proto));
        self.inner.shapes.borrow_mut().insert(&shape);
        shape
    }

    /// Transition a hashed shape by one property addition, reusing an
    /// interned child when one exists. Takes one reference on `atom` for
    /// the resulting shape.
    pub fn shape_transition(
        &self,
        shape: &GcRef<Shape>,
        atom: Atom,
        flags: crate::shape::PropFlags,
    ) -> GcRef<Shape> {
        debug_assert!(shape.is_hashed());
        let child_hash = shape_hash_step(shape.hash(), atom, flags);
        {
            let shapes = self.inner.shapes.borrow();
            if let Some(found) = shapes.find(child_hash, |s| shape.extends_to(atom, flags, s)) {
                return found;
            }
        }
        // No interned child: clone, extend, intern. The clone owns fresh
        // references for every inherited atom plus the new one.
        let clone = shape.clone_shape();
        {
            let mut atoms = self.inner.atoms.borrow_mut();
            for prop in clone.props_snapshot() {
                if !prop.atom.is_null() {
                    atoms.dup(prop.atom);
                }
            }
            atoms.dup(atom);
        }
        clone.add_prop(atom, flags);
        let child = self.inner.heap.alloc(GcKind::Shape, clone);
        self.inner.shapes.borrow_mut().insert(&child);
        child
    }

    /// Clone `shape` into a private (unhashed) copy for in-place updates.
    pub fn clone_shape_for_update(&self, shape: &GcRef<Shape>) -> GcRef<Shape> {
        let clone = shape.clone_shape();
        {
            let mut atoms = self.inner.atoms.borrow_mut();
            for prop in clone.props_snapshot() {
                if !prop.atom.is_null() {
                    atoms.dup(prop.atom);
                }
            }
        }
        self.inner.heap.alloc(GcKind::Shape, clone)
    }

    /// Unhash a sole-owner shape so it can be mutated in place.
    pub fn unhash_shape(&self, shape: &GcRef<Shape>) {
        if shape.is_hashed() {
            self.inner
                .shapes
                .borrow_mut()
                .remove(shape, shape.as_any().addr());
        }
    }

    // ---- classes --------------------------------------------------------

    /// Register an embedder class; grows every realm's prototype array.
    pub fn register_class(&self, def: ClassDef) -> ClassId {
        let id = self.inner.classes.borrow_mut().register(def);
        for realm_any in self.inner.realms.borrow().iter() {
            if let Some(realm) = realm_any.downcast_ref::<Realm>() {
                realm.ensure_class_slot(id);
            }
        }
        id
    }

    // ---- exception channel ----------------------------------------------

    /// Store `value` as the pending exception and signal the channel.
    pub fn throw(&self, value: Value) -> JsException {
        *self.inner.current_exception.borrow_mut() = Some(value);
        JsException
    }

    /// True when an exception is pending.
    pub fn has_exception(&self) -> bool {
        self.inner.current_exception.borrow().is_some()
    }

    /// Consume the pending exception (clears the uncatchable flag).
    pub fn take_exception(&self) -> Value {
        self.inner.uncatchable.set(false);
        self.inner
            .current_exception
            .borrow_mut()
            .take()
            .unwrap_or(Value::Undefined)
    }

    /// Mark the pending error as uncatchable by user `try/catch`.
    pub fn set_uncatchable_error(&self, flag: bool) {
        self.inner.uncatchable.set(flag);
    }

    /// Whether the pending error bypasses user catch clauses.
    pub fn is_uncatchable(&self) -> bool {
        self.inner.uncatchable.get()
    }

    // ---- jobs ------------------------------------------------------------

    /// Append a job to the FIFO.
    pub fn enqueue_job(&self, realm: GcRef<Realm>, func: JobFn, args: Vec<Value>) {
        self.inner.jobs.borrow_mut().push_back(Job { realm, func, args });
    }

    /// Number of queued jobs.
    pub fn job_count(&self) -> usize {
        self.inner.jobs.borrow().len()
    }

    /// Run exactly one pending job. `Ok(None)`: queue empty.
    /// `Ok(Some(ctx))`: one job ran. `Err((ctx, exception))`: the job
    /// threw; the exception has been consumed from the slot. Arguments
    /// are released either way.
    pub fn execute_pending_job(&self) -> Result<Option<Context>, (Context, Value)> {
        let job = self.inner.jobs.borrow_mut().pop_front();
        let Some(job) = job else {
            return Ok(None);
        };
        let ctx = Context::from_parts(self.clone(), job.realm.clone());
        let result = (job.func)(&ctx, &job.args);
        drop(job);
        match result {
            Ok(_) => Ok(Some(ctx)),
            Err(JsException) => {
                let exc = self.take_exception();
                Err((ctx, exc))
            }
        }
    }

    // ---- interrupts & hooks ----------------------------------------------

    /// Install the interrupt poll hook.
    pub fn set_interrupt_handler(&self, handler: Option<InterruptHandler>) {
        *self.inner.interrupt.borrow_mut() = handler;
    }

    /// Install the unhandled-rejection tracker.
    pub fn set_host_promise_rejection_tracker(&self, tracker: Option<RejectionTracker>) {
        *self.inner.rejection_tracker.borrow_mut() = tracker;
    }

    /// Install the host module loader (normalize + load).
    pub fn set_module_loader(&self, loader: Option<Rc<dyn crate::module::ModuleLoader>>) {
        *self.inner.module_loader.borrow_mut() = loader;
    }

    // ---- limits ----------------------------------------------------------

    /// Hard memory limit in bytes.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.inner.heap.set_memory_limit(bytes);
    }

    /// Cycle-collection trigger threshold.
    pub fn set_gc_threshold(&self, bytes: usize) {
        self.inner.heap.set_gc_threshold(bytes);
    }

    /// Stack budget for engine-driven calls.
    pub fn set_max_stack_size(&self, bytes: usize) {
        self.inner.max_stack_size.set(bytes);
    }

    /// Re-anchor the stack-budget origin to the current native stack
    /// position (call when entering the engine from a fresh thread stack).
    pub fn update_stack_top(&self) {
        let marker = 0u8;
        self.inner.stack_top.set(&marker as *const u8 as usize);
    }

    /// Bytes of native stack consumed below the recorded anchor.
    pub(crate) fn stack_used(&self) -> usize {
        let marker = 0u8;
        let here = &marker as *const u8 as usize;
        self.inner.stack_top.get().saturating_sub(here)
    }

    // ---- GC ---------------------------------------------------------------

    /// Run a full cycle collection now.
    pub fn run_gc(&self) -> GcStats {
        self.inner.heap.collect_cycles()
    }

    /// Collect if the allocation threshold has been crossed.
    pub fn maybe_gc(&self) {
        if self.inner.heap.needs_gc() {
            self.run_gc();
        }
    }

    // ---- frames -----------------------------------------------------------

    pub(crate) fn push_frame(&self, frame: Frame) -> usize {
        let mut frames = self.inner.frames.borrow_mut();
        frames.push(frame);
        frames.len() - 1
    }

    pub(crate) fn pop_frame(&self) {
        let mut frames = self.inner.frames.borrow_mut();
        if let Some(mut frame) = frames.pop() {
            frame.close_var_refs();
        }
    }

    /// Run `f` against the frame at `depth`.
    pub fn with_frame<R>(&self, depth: usize, f: impl FnOnce(&mut Frame) -> R) -> R {
        let mut frames = self.inner.frames.borrow_mut();
        f(&mut frames[depth])
    }

    /// Current frame stack depth.
    pub fn frame_depth(&self) -> usize {
        self.inner.frames.borrow().len()
    }

    pub(crate) fn register_realm(&self, realm: &GcRef<Realm>) {
        self.inner.realms.borrow_mut().push(realm.as_any());
    }
}

fn proto_eq(a: &Option<GcRef<JsObject>>, b: &Option<GcRef<JsObject>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => GcRef::ptr_eq(x, y),
        _ => false,
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("live_objects", &self.inner.heap.live_count())
            .field("jobs", &self.job_count())
            .finish()
    }
}
