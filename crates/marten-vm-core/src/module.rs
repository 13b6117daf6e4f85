//! Module records and the resolve → link → evaluate pipeline
//!
//! Resolution asks the host loader for each required module, setting the
//! `resolved` flag before recursing so import cycles terminate. Linking
//! allocates the module-level variable cells, resolves every import
//! across star re-export chains, validates indirect exports and builds
//! the module function. Evaluation is a depth-first walk guarded by
//! `eval_mark`; a throwing module records its exception and rethrows it
//! on every later evaluation attempt.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcKind, GcRef, Trace};

use crate::atom::{Atom, AtomTable};
use crate::class::{ExoticMethods, ExoticResult, PropertyDescriptor};
use crate::context::Context;
use crate::error::JsResult;
use crate::frame::VarRef;
use crate::function::FunctionBytecode;
use crate::object::{AutoInitKind, JsObject, ObjectData, Property, class_ids, obj_flags};
use crate::runtime::JobFn;
use crate::shape::PropFlags;
use crate::value::Value;

/// Host-side module resolution.
pub trait ModuleLoader {
    /// Resolve a specifier relative to the importing module's name.
    fn normalize(&self, ctx: &Context, base: &str, name: &str) -> JsResult<String>;

    /// Produce (usually: compile) the module for a normalized name.
    fn load(&self, ctx: &Context, name: &str) -> JsResult<GcRef<ModuleRecord>>;
}

/// One `import "name"` dependency edge.
pub struct RequiredModule {
    /// Requested (normalized) name
    pub name: Atom,
    /// Resolution result
    pub module: RefCell<Option<GcRef<ModuleRecord>>>,
}

/// What an export entry binds.
pub enum ExportKind {
    /// Module-local binding at closure slot `var_idx`
    Local {
        /// Closure-variable slot in the module function
        var_idx: usize,
        /// The cell, allocated at link time
        var_ref: RefCell<Option<GcRef<VarRef>>>,
    },
    /// Re-export of `local_name` from a required module
    Indirect {
        /// Index into `req_modules`
        req_idx: usize,
        /// Name inside the required module
        local_name: Atom,
    },
    /// `export * as ns from "mod"`: the required module's namespace
    Namespace {
        /// Index into `req_modules`
        req_idx: usize,
    },
}

/// One named export.
pub struct ExportEntry {
    /// Exported name
    pub export_name: Atom,
    /// Binding
    pub kind: ExportKind,
}

/// One import binding.
pub struct ImportEntry {
    /// Index into `req_modules`
    pub req_idx: usize,
    /// Imported name (ignored for star imports)
    pub import_name: Atom,
    /// Closure-variable slot in the module function
    pub var_idx: usize,
    /// `import * as ns`
    pub is_star: bool,
}

/// Native module initializer (sets export cells).
pub type NativeModuleInit = Rc<dyn Fn(&Context, &GcRef<ModuleRecord>) -> JsResult<()>>;

/// A module (GC-tracked non-object value).
pub struct ModuleRecord {
    pub(crate) name: Cell<Atom>,
    pub(crate) req_modules: RefCell<Vec<RequiredModule>>,
    pub(crate) exports: RefCell<Vec<ExportEntry>>,
    pub(crate) star_exports: RefCell<Vec<usize>>,
    pub(crate) imports: RefCell<Vec<ImportEntry>>,
    pub(crate) func_bytecode: RefCell<Option<GcRef<FunctionBytecode>>>,
    pub(crate) func_obj: RefCell<Value>,
    pub(crate) init: RefCell<Option<NativeModuleInit>>,
    pub(crate) namespace: RefCell<Option<GcRef<JsObject>>>,
    pub(crate) meta_obj: RefCell<Value>,
    pub(crate) resolved: Cell<bool>,
    pub(crate) func_created: Cell<bool>,
    pub(crate) instantiated: Cell<bool>,
    pub(crate) evaluated: Cell<bool>,
    pub(crate) eval_mark: Cell<bool>,
    pub(crate) eval_has_exception: Cell<bool>,
    pub(crate) eval_exception: RefCell<Value>,
}

impl Trace for ModuleRecord {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        for req in self.req_modules.borrow().iter() {
            if let Some(m) = req.module.borrow().as_ref() {
                mark(m.as_any());
            }
        }
        for e in self.exports.borrow().iter() {
            if let ExportKind::Local { var_ref, .. } = &e.kind
                && let Some(vr) = var_ref.borrow().as_ref()
            {
                mark(vr.as_any());
            }
        }
        if let Some(f) = self.func_bytecode.borrow().as_ref() {
            mark(f.as_any());
        }
        self.func_obj.borrow().trace(mark);
        if let Some(ns) = self.namespace.borrow().as_ref() {
            mark(ns.as_any());
        }
        self.meta_obj.borrow().trace(mark);
        self.eval_exception.borrow().trace(mark);
    }
}

impl ModuleRecord {
    /// Module name atom.
    pub fn name(&self) -> Atom {
        self.name.get()
    }

    /// Release every atom the record owns (sweeper callback).
    pub(crate) fn release_atoms(&self, atoms: &mut AtomTable) {
        atoms.release(self.name.get());
        for req in self.req_modules.borrow().iter() {
            atoms.release(req.name);
        }
        for e in self.exports.borrow().iter() {
            atoms.release(e.export_name);
            if let ExportKind::Indirect { local_name, .. } = &e.kind {
                atoms.release(*local_name);
            }
        }
        for i in self.imports.borrow().iter() {
            atoms.release(i.import_name);
        }
    }

    fn find_export(&self, name: Atom) -> Option<usize> {
        self.exports
            .borrow()
            .iter()
            .position(|e| e.export_name == name)
    }
}

impl std::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("resolved", &self.resolved.get())
            .field("instantiated", &self.instantiated.get())
            .field("evaluated", &self.evaluated.get())
            .finish()
    }
}

/// `ResolveExport` outcome.
pub enum ResolvedExport {
    /// Binding found
    Found {
        /// Module owning the binding
        module: GcRef<ModuleRecord>,
        /// Export index inside that module
        export_idx: usize,
    },
    /// No such export
    NotFound,
    /// Resolution revisited an in-progress pair
    Circular,
    /// Two star chains disagree
    Ambiguous,
}

impl Context {
    /// A fresh module record. The caller owns one reference to `name`'s
    /// atom transfer; the record takes its own.
    pub fn new_module(&self, name: &str) -> GcRef<ModuleRecord> {
        let name_atom = self.rt.intern_atom(name);
        self.rt.heap().alloc(
            GcKind::Module,
            ModuleRecord {
                name: Cell::new(name_atom),
                req_modules: RefCell::new(Vec::new()),
                exports: RefCell::new(Vec::new()),
                star_exports: RefCell::new(Vec::new()),
                imports: RefCell::new(Vec::new()),
                func_bytecode: RefCell::new(None),
                func_obj: RefCell::new(Value::Undefined),
                init: RefCell::new(None),
                namespace: RefCell::new(None),
                meta_obj: RefCell::new(Value::Undefined),
                resolved: Cell::new(false),
                func_created: Cell::new(false),
                instantiated: Cell::new(false),
                evaluated: Cell::new(false),
                eval_mark: Cell::new(false),
                eval_has_exception: Cell::new(false),
                eval_exception: RefCell::new(Value::Undefined),
            },
        )
    }

    /// Declare a dependency; returns its `req_idx`.
    pub fn module_add_require(&self, module: &GcRef<ModuleRecord>, name: &str) -> usize {
        let atom = self.rt.intern_atom(name);
        let mut reqs = module.req_modules.borrow_mut();
        reqs.push(RequiredModule {
            name: atom,
            module: RefCell::new(None),
        });
        reqs.len() - 1
    }

    /// Declare a module-local export bound to closure slot `var_idx`.
    pub fn module_add_local_export(
        &self,
        module: &GcRef<ModuleRecord>,
        export_name: &str,
        var_idx: usize,
    ) {
        let atom = self.rt.intern_atom(export_name);
        module.exports.borrow_mut().push(ExportEntry {
            export_name: atom,
            kind: ExportKind::Local {
                var_idx,
                var_ref: RefCell::new(None),
            },
        });
    }

    /// Declare `export { local_name as export_name } from req`.
    pub fn module_add_indirect_export(
        &self,
        module: &GcRef<ModuleRecord>,
        export_name: &str,
        req_idx: usize,
        local_name: &str,
    ) {
        let export_atom = self.rt.intern_atom(export_name);
        let local_atom = self.rt.intern_atom(local_name);
        module.exports.borrow_mut().push(ExportEntry {
            export_name: export_atom,
            kind: ExportKind::Indirect {
                req_idx,
                local_name: local_atom,
            },
        });
    }

    /// Declare `export * as export_name from req`.
    pub fn module_add_namespace_export(
        &self,
        module: &GcRef<ModuleRecord>,
        export_name: &str,
        req_idx: usize,
    ) {
        let export_atom = self.rt.intern_atom(export_name);
        module.exports.borrow_mut().push(ExportEntry {
            export_name: export_atom,
            kind: ExportKind::Namespace { req_idx },
        });
    }

    /// Declare `export * from req`.
    pub fn module_add_star_export(&self, module: &GcRef<ModuleRecord>, req_idx: usize) {
        module.star_exports.borrow_mut().push(req_idx);
    }

    /// Declare an import binding into closure slot `var_idx`.
    pub fn module_add_import(
        &self,
        module: &GcRef<ModuleRecord>,
        req_idx: usize,
        import_name: &str,
        var_idx: usize,
        is_star: bool,
    ) {
        let atom = self.rt.intern_atom(import_name);
        module.imports.borrow_mut().push(ImportEntry {
            req_idx,
            import_name: atom,
            var_idx,
            is_star,
        });
    }

    /// Attach the compiled module function.
    pub fn module_set_function(
        &self,
        module: &GcRef<ModuleRecord>,
        func: GcRef<FunctionBytecode>,
    ) {
        *module.func_bytecode.borrow_mut() = Some(func);
    }

    /// Attach a native initializer instead of a compiled function.
    pub fn module_set_init(&self, module: &GcRef<ModuleRecord>, init: NativeModuleInit) {
        *module.init.borrow_mut() = Some(init);
    }

    /// The `import.meta` object, created on first use.
    pub fn module_meta(&self, module: &GcRef<ModuleRecord>) -> Value {
        {
            let meta = module.meta_obj.borrow();
            if !meta.is_undefined() {
                return meta.clone();
            }
        }
        let obj = self.new_object_full(class_ids::OBJECT, None, ObjectData::Ordinary);
        let meta = Value::Object(obj);
        *module.meta_obj.borrow_mut() = meta.clone();
        meta
    }

    /// The export cell of a module-local binding (native initializers use
    /// this to publish values).
    pub fn module_export_cell(
        &self,
        module: &GcRef<ModuleRecord>,
        export_name: &str,
    ) -> Option<GcRef<VarRef>> {
        let atom = self.rt.intern_atom(export_name);
        let found = module.find_export(atom).and_then(|idx| {
            let exports = module.exports.borrow();
            match &exports[idx].kind {
                ExportKind::Local { var_ref, .. } => var_ref.borrow().clone(),
                _ => None,
            }
        });
        self.rt.release_atom(atom);
        found
    }

    // ---- resolve ---------------------------------------------------------

    /// Ask the host loader for a module, against the per-runtime registry.
    pub fn host_resolve_module(&self, base: &str, name: &str) -> JsResult<GcRef<ModuleRecord>> {
        let loader = self.rt.inner.module_loader.borrow().clone();
        let normalized = match &loader {
            Some(l) => l.normalize(self, base, name)?,
            None => name.to_string(),
        };
        {
            let loaded = self.rt.inner.loaded_modules.borrow();
            if let Some((_, m)) = loaded.iter().find(|(n, _)| *n == normalized) {
                return Ok(m.clone());
            }
        }
        let Some(loader) = loader else {
            return Err(self.throw_reference_error(format!("module '{name}' not found")));
        };
        let module = loader.load(self, &normalized)?;
        self.rt
            .inner
            .loaded_modules
            .borrow_mut()
            .push((normalized, module.clone()));
        Ok(module)
    }

    /// Register a hand-built module under its own name so imports can
    /// find it without a loader round-trip.
    pub fn register_module(&self, module: &GcRef<ModuleRecord>) {
        let name = self.rt.atom_to_string(module.name()).to_rust_string();
        self.rt
            .inner
            .loaded_modules
            .borrow_mut()
            .push((name, module.clone()));
    }

    /// Resolve phase: bind every dependency edge, recursively. The
    /// `resolved` flag is set before recursing to break cycles.
    pub fn resolve_module(&self, module: &GcRef<ModuleRecord>) -> JsResult<()> {
        if module.resolved.get() {
            return Ok(());
        }
        module.resolved.set(true);
        let base = self.rt.atom_to_string(module.name()).to_rust_string();
        let req_count = module.req_modules.borrow().len();
        for i in 0..req_count {
            let already = module.req_modules.borrow()[i].module.borrow().is_some();
            if already {
                continue;
            }
            let req_name = {
                let reqs = module.req_modules.borrow();
                self.rt.atom_to_string(reqs[i].name).to_rust_string()
            };
            let dep = self.host_resolve_module(&base, &req_name)?;
            *module.req_modules.borrow()[i].module.borrow_mut() = Some(dep.clone());
            self.resolve_module(&dep)?;
        }
        Ok(())
    }

    // ---- resolve_export --------------------------------------------------

    /// `ResolveExport` across star chains with cycle detection.
    pub fn resolve_export(
        &self,
        module: &GcRef<ModuleRecord>,
        export_name: Atom,
    ) -> JsResult<ResolvedExport> {
        let mut visited: Vec<(usize, Atom)> = Vec::new();
        self.resolve_export_inner(module, export_name, &mut visited)
    }

    fn resolve_export_inner(
        &self,
        module: &GcRef<ModuleRecord>,
        export_name: Atom,
        visited: &mut Vec<(usize, Atom)>,
    ) -> JsResult<ResolvedExport> {
        let key = (module.addr(), export_name);
        if visited.contains(&key) {
            return Ok(ResolvedExport::Circular);
        }
        visited.push(key);
        if let Some(idx) = module.find_export(export_name) {
            let forward = {
                let exports = module.exports.borrow();
                match &exports[idx].kind {
                    ExportKind::Local { .. } | ExportKind::Namespace { .. } => None,
                    ExportKind::Indirect {
                        req_idx,
                        local_name,
                    } => Some((*req_idx, *local_name)),
                }
            };
            match forward {
                None => {
                    return Ok(ResolvedExport::Found {
                        module: module.clone(),
                        export_idx: idx,
                    });
                }
                Some((req_idx, local_name)) => {
                    let dep = self.required_module(module, req_idx)?;
                    return self.resolve_export_inner(&dep, local_name, visited);
                }
            }
        }
        // Not a direct export: search star re-exports.
        let star_reqs: Vec<usize> = module.star_exports.borrow().clone();
        let mut found: Option<(GcRef<ModuleRecord>, usize)> = None;
        for req_idx in star_reqs {
            let dep = self.required_module(module, req_idx)?;
            match self.resolve_export_inner(&dep, export_name, visited)? {
                ResolvedExport::Found { module: m, export_idx } => {
                    if let Some((prev_m, prev_idx)) = &found {
                        let same =
                            GcRef::ptr_eq(prev_m, &m) && *prev_idx == export_idx;
                        if !same {
                            return Ok(ResolvedExport::Ambiguous);
                        }
                    } else {
                        found = Some((m, export_idx));
                    }
                }
                ResolvedExport::Ambiguous => return Ok(ResolvedExport::Ambiguous),
                ResolvedExport::NotFound | ResolvedExport::Circular => {}
            }
        }
        match found {
            Some((module, export_idx)) => Ok(ResolvedExport::Found { module, export_idx }),
            None => Ok(ResolvedExport::NotFound),
        }
    }

    fn required_module(
        &self,
        module: &GcRef<ModuleRecord>,
        req_idx: usize,
    ) -> JsResult<GcRef<ModuleRecord>> {
        let reqs = module.req_modules.borrow();
        let dep = reqs
            .get(req_idx)
            .and_then(|r| r.module.borrow().clone());
        match dep {
            Some(d) => Ok(d),
            None => Err(self.throw_internal_error("required module is not resolved")),
        }
    }

    /// The cell behind a `Found` resolution (local bindings only).
    fn export_cell(
        &self,
        module: &GcRef<ModuleRecord>,
        export_idx: usize,
    ) -> JsResult<GcRef<VarRef>> {
        let exports = module.exports.borrow();
        match &exports[export_idx].kind {
            ExportKind::Local { var_ref, .. } => var_ref
                .borrow()
                .clone()
                .ok_or_else(|| self.throw_internal_error("export cell not linked")),
            _ => Err(self.throw_internal_error("export is not a local binding")),
        }
    }

    // ---- link (instantiate) ----------------------------------------------

    /// Link phase: allocate binding cells, resolve imports and indirect
    /// exports, build the module function.
    pub fn instantiate_module(&self, module: &GcRef<ModuleRecord>) -> JsResult<()> {
        if module.instantiated.get() {
            return Ok(());
        }
        module.instantiated.set(true);
        self.resolve_module(module)?;
        let req_count = module.req_modules.borrow().len();
        for i in 0..req_count {
            let dep = self.required_module(module, i)?;
            self.instantiate_module(&dep)?;
        }

        // Allocate cells for local exports.
        {
            let exports = module.exports.borrow();
            for e in exports.iter() {
                if let ExportKind::Local { var_ref, .. } = &e.kind {
                    let cell = self
                        .rt
                        .heap()
                        .alloc(GcKind::VarRef, VarRef::new_closed(Value::Uninitialized));
                    *var_ref.borrow_mut() = Some(cell);
                }
            }
        }

        // Validate indirect exports across the chains.
        {
            let indirect: Vec<(usize, Atom)> = {
                let exports = module.exports.borrow();
                exports
                    .iter()
                    .filter_map(|e| match &e.kind {
                        ExportKind::Indirect {
                            req_idx,
                            local_name,
                        } => Some((*req_idx, *local_name)),
                        _ => None,
                    })
                    .collect()
            };
            for (req_idx, local_name) in indirect {
                let dep = self.required_module(module, req_idx)?;
                match self.resolve_export(&dep, local_name)? {
                    ResolvedExport::Found { .. } => {}
                    ResolvedExport::Ambiguous => {
                        return Err(self.throw_syntax_error(format!(
                            "export '{}' is ambiguous",
                            self.rt.atom_to_string(local_name)
                        )));
                    }
                    _ => {
                        return Err(self.throw_syntax_error(format!(
                            "export '{}' not found",
                            self.rt.atom_to_string(local_name)
                        )));
                    }
                }
            }
        }

        // Build the module function with its binding cells.
        let func_bytecode = module.func_bytecode.borrow().clone();
        if let Some(func) = func_bytecode
            && !module.func_created.get()
        {
            let cell_count = func.closure_vars.len();
            let mut cells: Vec<Option<GcRef<VarRef>>> = vec![None; cell_count];
            {
                let exports = module.exports.borrow();
                for e in exports.iter() {
                    if let ExportKind::Local { var_idx, var_ref } = &e.kind
                        && *var_idx < cell_count
                    {
                        cells[*var_idx] = var_ref.borrow().clone();
                    }
                }
            }
            let import_list: Vec<(usize, Atom, usize, bool)> = {
                let imports = module.imports.borrow();
                imports
                    .iter()
                    .map(|i| (i.req_idx, i.import_name, i.var_idx, i.is_star))
                    .collect()
            };
            for (req_idx, import_name, var_idx, is_star) in import_list {
                let dep = self.required_module(module, req_idx)?;
                if var_idx >= cell_count {
                    continue;
                }
                if is_star {
                    let ns = get_module_namespace(self, &dep)?;
                    cells[var_idx] = Some(self.rt.heap().alloc(
                        GcKind::VarRef,
                        VarRef::new_closed(Value::Object(ns)),
                    ));
                    continue;
                }
                match self.resolve_export(&dep, import_name)? {
                    ResolvedExport::Found {
                        module: owner,
                        export_idx,
                    } => {
                        let is_ns = matches!(
                            owner.exports.borrow()[export_idx].kind,
                            ExportKind::Namespace { .. }
                        );
                        if is_ns {
                            let target = {
                                let exports = owner.exports.borrow();
                                match &exports[export_idx].kind {
                                    ExportKind::Namespace { req_idx } => *req_idx,
                                    _ => unreachable!(),
                                }
                            };
                            let target_mod = self.required_module(&owner, target)?;
                            let ns = get_module_namespace(self, &target_mod)?;
                            cells[var_idx] = Some(self.rt.heap().alloc(
                                GcKind::VarRef,
                                VarRef::new_closed(Value::Object(ns)),
                            ));
                        } else {
                            cells[var_idx] = Some(self.export_cell(&owner, export_idx)?);
                        }
                    }
                    ResolvedExport::Ambiguous => {
                        return Err(self.throw_syntax_error(format!(
                            "import '{}' is ambiguous",
                            self.rt.atom_to_string(import_name)
                        )));
                    }
                    ResolvedExport::Circular => {
                        return Err(self.throw_syntax_error(format!(
                            "circular import of '{}'",
                            self.rt.atom_to_string(import_name)
                        )));
                    }
                    ResolvedExport::NotFound => {
                        return Err(self.throw_syntax_error(format!(
                            "import '{}' not found",
                            self.rt.atom_to_string(import_name)
                        )));
                    }
                }
            }
            // Unbound slots (module-level non-exported vars) get fresh
            // cells.
            let cells: Vec<GcRef<VarRef>> = cells
                .into_iter()
                .map(|c| {
                    c.unwrap_or_else(|| {
                        self.rt
                            .heap()
                            .alloc(GcKind::VarRef, VarRef::new_closed(Value::Undefined))
                    })
                })
                .collect();
            let func_obj = self.new_closure(&func, None, Some(&cells))?;
            *module.func_obj.borrow_mut() = Value::Object(func_obj);
            module.func_created.set(true);
        }
        Ok(())
    }

    // ---- evaluate --------------------------------------------------------

    /// Evaluation phase: depth-first, each module once; a recorded
    /// exception rethrows on every subsequent attempt.
    pub fn evaluate_module(&self, module: &GcRef<ModuleRecord>) -> JsResult<Value> {
        self.instantiate_module(module)?;
        self.evaluate_module_inner(module)
    }

    fn evaluate_module_inner(&self, module: &GcRef<ModuleRecord>) -> JsResult<Value> {
        if module.eval_has_exception.get() {
            let exc = module.eval_exception.borrow().clone();
            return Err(self.throw(exc));
        }
        if module.evaluated.get() || module.eval_mark.get() {
            return Ok(Value::Undefined);
        }
        module.eval_mark.set(true);
        let req_count = module.req_modules.borrow().len();
        for i in 0..req_count {
            let dep = self.required_module(module, i)?;
            match self.evaluate_module_inner(&dep) {
                Ok(_) => {}
                Err(e) => {
                    module.eval_mark.set(false);
                    return Err(e);
                }
            }
        }
        let result = self.run_module_body(module);
        module.eval_mark.set(false);
        module.evaluated.set(true);
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                let exc = self.rt.inner.current_exception.borrow().clone();
                module.eval_has_exception.set(true);
                *module.eval_exception.borrow_mut() = exc.unwrap_or(Value::Undefined);
                Err(e)
            }
        }
    }

    fn run_module_body(&self, module: &GcRef<ModuleRecord>) -> JsResult<Value> {
        let init = module.init.borrow().clone();
        if let Some(init) = init {
            init(self, module)?;
            return Ok(Value::Undefined);
        }
        let func = module.func_obj.borrow().clone();
        if func.is_undefined() {
            return Ok(Value::Undefined);
        }
        self.call(&func, &Value::Undefined, &[])
    }

    // ---- dynamic import --------------------------------------------------

    /// `import(specifier)`: schedules resolution and answers a promise
    /// for the namespace.
    pub fn dynamic_import(&self, base: &str, specifier: &str) -> JsResult<Value> {
        let promise = self.new_promise();
        let (resolve, reject) = self.create_resolving_functions(&promise);
        let func: JobFn = Rc::new(dynamic_import_job);
        self.rt.enqueue_job(
            self.realm.clone(),
            func,
            vec![
                Value::string(base),
                Value::string(specifier),
                resolve,
                reject,
            ],
        );
        Ok(Value::Object(promise))
    }
}

/// Job body for `import()`: args are `[base, specifier, resolve, reject]`.
fn dynamic_import_job(ctx: &Context, args: &[Value]) -> JsResult<Value> {
    let base = args[0].as_string().map(|s| s.to_rust_string()).unwrap_or_default();
    let spec = args[1].as_string().map(|s| s.to_rust_string()).unwrap_or_default();
    let resolve = &args[2];
    let reject = &args[3];
    let outcome = (|| -> JsResult<Value> {
        let module = ctx.host_resolve_module(&base, &spec)?;
        ctx.evaluate_module(&module)?;
        let ns = get_module_namespace(ctx, &module)?;
        Ok(Value::Object(ns))
    })();
    match outcome {
        Ok(ns) => ctx.call(resolve, &Value::Undefined, &[ns]),
        Err(_) => {
            let reason = ctx.get_exception();
            ctx.call(reject, &Value::Undefined, &[reason])
        }
    }
}

/// All reachable export names of a module (direct + star chains),
/// excluding ambiguous ones.
fn exported_names(
    ctx: &Context,
    module: &GcRef<ModuleRecord>,
    visited: &mut Vec<usize>,
) -> JsResult<Vec<Atom>> {
    if visited.contains(&module.addr()) {
        return Ok(Vec::new());
    }
    visited.push(module.addr());
    let mut names: Vec<Atom> = module
        .exports
        .borrow()
        .iter()
        .map(|e| e.export_name)
        .collect();
    let star_reqs: Vec<usize> = module.star_exports.borrow().clone();
    for req_idx in star_reqs {
        let reqs = module.req_modules.borrow();
        let dep = reqs[req_idx]
            .module
            .borrow()
            .clone();
        drop(reqs);
        let Some(dep) = dep else { continue };
        for name in exported_names(ctx, &dep, visited)? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// The lazily built namespace object: exported names in sort order, plain
/// var-ref properties for bindings and auto-init properties for
/// namespace re-exports; non-extensible, null prototype.
pub fn get_module_namespace(
    ctx: &Context,
    module: &GcRef<ModuleRecord>,
) -> JsResult<GcRef<JsObject>> {
    if let Some(ns) = module.namespace.borrow().as_ref() {
        return Ok(ns.clone());
    }
    let ns = ctx.new_object_full(class_ids::MODULE_NS, None, ObjectData::ModuleNamespace(module.clone()));
    // Install the cache up front: resolving namespace re-exports below
    // may legitimately cycle back here.
    *module.namespace.borrow_mut() = Some(ns.clone());

    let mut visited = Vec::new();
    let mut names = exported_names(ctx, module, &mut visited)?;
    {
        let atoms = ctx.rt().inner.atoms.borrow();
        names.sort_by(|a, b| atoms.compare(*a, *b));
    }
    for name in names {
        match ctx.resolve_export(module, name)? {
            ResolvedExport::Found {
                module: owner,
                export_idx,
            } => {
                let kind_is_ns = matches!(
                    owner.exports.borrow()[export_idx].kind,
                    ExportKind::Namespace { .. }
                );
                if kind_is_ns {
                    let req_idx = match &owner.exports.borrow()[export_idx].kind {
                        ExportKind::Namespace { req_idx } => *req_idx,
                        _ => unreachable!(),
                    };
                    let target = {
                        let reqs = owner.req_modules.borrow();
                        reqs[req_idx].module.borrow().clone()
                    };
                    let Some(target) = target else { continue };
                    ctx.define_own_property_raw(
                        &ns,
                        name,
                        Property::AutoInit {
                            realm: ctx.realm().clone(),
                            kind: AutoInitKind::ModuleNs(target),
                        },
                        PropFlags::from_bits(
                            PropFlags::ENUMERABLE | PropFlags::WRITABLE | PropFlags::AUTOINIT,
                        ),
                    );
                } else {
                    let cell = {
                        let exports = owner.exports.borrow();
                        match &exports[export_idx].kind {
                            ExportKind::Local { var_ref, .. } => var_ref.borrow().clone(),
                            _ => None,
                        }
                    };
                    let Some(cell) = cell else { continue };
                    ctx.define_own_property_raw(
                        &ns,
                        name,
                        Property::VarRef(cell),
                        PropFlags::from_bits(
                            PropFlags::ENUMERABLE | PropFlags::WRITABLE | PropFlags::VARREF,
                        ),
                    );
                }
            }
            // Ambiguous names are left off the namespace; direct imports
            // of them throw at link time.
            _ => continue,
        }
    }
    let to_string_tag = {
        let symbols = ctx.realm().symbols();
        ctx.rt().intern_symbol_atom(&symbols.to_string_tag)
    };
    ctx.define_own_property_raw(
        &ns,
        to_string_tag,
        Property::Value(Value::string("Module")),
        PropFlags::NONE,
    );
    ctx.rt().release_atom(to_string_tag);
    ns.set_flag(obj_flags::EXTENSIBLE, false);
    Ok(ns)
}

/// Module-namespace exotic behavior: writes and redefinitions are
/// refused, deletes succeed only for absent keys.
pub struct ModuleNsExotic;

impl ExoticMethods for ModuleNsExotic {
    fn set_property(
        &self,
        ctx: &Context,
        _obj: &GcRef<JsObject>,
        _prop: Atom,
        _value: Value,
        _receiver: &Value,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        if throw {
            return Err(ctx.throw_type_error("cannot assign to a module namespace"));
        }
        Ok(ExoticResult::Handled(false))
    }

    fn define_own_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
        desc: &PropertyDescriptor,
        throw: bool,
    ) -> JsResult<ExoticResult<bool>> {
        // Only a redefinition that matches the current binding succeeds.
        let current = ctx.ordinary_get_own_property(obj, prop)?;
        let ok = match (&current, &desc.value) {
            (Some(cur), Some(v)) => {
                !desc.is_accessor_descriptor()
                    && desc.writable != Some(false)
                    && desc.enumerable != Some(false)
                    && desc.configurable != Some(true)
                    && cur.value().map(|cv| Value::same_value(cv, v)).unwrap_or(false)
            }
            (Some(_), None) => !desc.is_accessor_descriptor() && desc.configurable != Some(true),
            (None, _) => false,
        };
        if !ok && throw {
            return Err(ctx.throw_type_error("cannot redefine a module namespace property"));
        }
        Ok(ExoticResult::Handled(ok))
    }

    fn delete_property(
        &self,
        ctx: &Context,
        obj: &GcRef<JsObject>,
        prop: Atom,
    ) -> JsResult<ExoticResult<bool>> {
        let present = obj.shape().find(prop).is_some();
        let _ = ctx;
        Ok(ExoticResult::Handled(!present))
    }
}
