//! Runtime configuration and construction

use std::rc::Rc;

use marten_vm_core::eval::Compiler;
use marten_vm_core::module::ModuleLoader;
use marten_vm_core::runtime::{InterruptHandler, RejectionTracker};
use marten_vm_core::{Context, Runtime};

/// Resource limits for one runtime instance.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Hard allocation ceiling in bytes (`None` = unlimited)
    pub memory_limit: Option<usize>,
    /// Cycle-collection trigger threshold in bytes
    pub gc_threshold: Option<usize>,
    /// Stack budget for engine-driven calls in bytes
    pub max_stack_size: Option<usize>,
}

/// Builder for a configured [`Runtime`] plus its first [`Context`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    interrupt: Option<InterruptHandler>,
    rejection_tracker: Option<RejectionTracker>,
    module_loader: Option<Rc<dyn ModuleLoader>>,
    compiler: Option<Rc<dyn Compiler>>,
}

impl RuntimeBuilder {
    /// Start from defaults.
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Set the hard memory limit.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.config.memory_limit = Some(bytes);
        self
    }

    /// Set the cycle-collection threshold.
    pub fn gc_threshold(mut self, bytes: usize) -> Self {
        self.config.gc_threshold = Some(bytes);
        self
    }

    /// Set the stack budget.
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.config.max_stack_size = Some(bytes);
        self
    }

    /// Install the interrupt poll hook.
    pub fn interrupt_handler(mut self, handler: InterruptHandler) -> Self {
        self.interrupt = Some(handler);
        self
    }

    /// Install the unhandled-rejection tracker.
    pub fn rejection_tracker(mut self, tracker: RejectionTracker) -> Self {
        self.rejection_tracker = Some(tracker);
        self
    }

    /// Install the module loader.
    pub fn module_loader(mut self, loader: Rc<dyn ModuleLoader>) -> Self {
        self.module_loader = Some(loader);
        self
    }

    /// Install the bytecode compiler.
    pub fn compiler(mut self, compiler: Rc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Build the runtime and its first realm.
    pub fn build(self) -> (Runtime, Context) {
        let rt = Runtime::new();
        if let Some(limit) = self.config.memory_limit {
            rt.set_memory_limit(limit);
        }
        if let Some(threshold) = self.config.gc_threshold {
            rt.set_gc_threshold(threshold);
        }
        if let Some(stack) = self.config.max_stack_size {
            rt.set_max_stack_size(stack);
        }
        if let Some(handler) = self.interrupt {
            rt.set_interrupt_handler(Some(handler));
        }
        if let Some(tracker) = self.rejection_tracker {
            rt.set_host_promise_rejection_tracker(Some(tracker));
        }
        if let Some(loader) = self.module_loader {
            rt.set_module_loader(Some(loader));
        }
        if let Some(compiler) = self.compiler {
            rt.set_compiler(Some(compiler));
        }
        let ctx = Context::new(&rt);
        (rt, ctx)
    }
}
