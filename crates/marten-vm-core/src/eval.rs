//! The evaluation surface and the compiler seam
//!
//! Parsing and bytecode generation are an external collaborator: the
//! host installs a [`Compiler`] and `eval` routes through it. Without
//! one, evaluation throws a `SyntaxError`; the core never interprets
//! source text itself.

use std::rc::Rc;

use crate::context::Context;
use crate::error::{EngineError, JsResult};
use crate::value::Value;

/// `eval` mode and option bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvalFlags(pub u32);

impl EvalFlags {
    /// Global script evaluation
    pub const GLOBAL: u32 = 0;
    /// Module evaluation
    pub const MODULE: u32 = 1 << 0;
    /// Direct `eval` semantics
    pub const DIRECT: u32 = 1 << 1;
    /// Indirect `eval` semantics
    pub const INDIRECT: u32 = 1 << 2;
    /// Force strict mode
    pub const STRICT: u32 = 1 << 3;
    /// Strip debug info while compiling
    pub const STRIP: u32 = 1 << 4;
    /// Compile without running
    pub const COMPILE_ONLY: u32 = 1 << 5;
    /// Hide caller frames from backtraces
    pub const BACKTRACE_BARRIER: u32 = 1 << 6;

    /// Test a bit.
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// The bytecode-compiler collaborator.
pub trait Compiler {
    /// Compile `source` into a callable function value
    /// (`EvalFlags::MODULE`: a module value).
    fn compile(
        &self,
        ctx: &Context,
        source: &str,
        filename: &str,
        flags: EvalFlags,
    ) -> JsResult<Value>;
}

impl Context {
    /// Evaluate source through the installed compiler.
    pub fn eval(&self, source: &str, filename: &str, flags: EvalFlags) -> JsResult<Value> {
        let compiler = self.rt.inner.compiler.borrow().clone();
        let Some(compiler) = compiler else {
            return Err(self.throw_syntax_error("no compiler installed"));
        };
        let compiled = compiler.compile(self, source, filename, flags)?;
        if flags.has(EvalFlags::COMPILE_ONLY) {
            return Ok(compiled);
        }
        match &compiled {
            Value::Module(module) => self.evaluate_module(module),
            func => self.call(func, &self.global(), &[]),
        }
    }

    /// Resolve, link, evaluate and return a module by name.
    pub fn run_module(&self, basename: &str, name: &str) -> JsResult<Value> {
        let module = self.host_resolve_module(basename, name)?;
        self.evaluate_module(&module)?;
        Ok(Value::Module(module))
    }

    /// Host-boundary wrapper: renders a pending exception into
    /// [`EngineError`].
    pub fn eval_to_engine_error(
        &self,
        source: &str,
        filename: &str,
        flags: EvalFlags,
    ) -> Result<Value, EngineError> {
        self.eval(source, filename, flags).map_err(|_| {
            let exc = self.get_exception();
            let stack = exc
                .as_object()
                .and_then(|obj| {
                    self.get_property_value(
                        &Value::Object(obj.clone()),
                        self.rt.common_atoms().stack,
                    )
                    .ok()
                })
                .and_then(|v| v.as_string().map(|s| s.to_rust_string()));
            EngineError::Exception {
                message: self.error_to_string(&exc),
                stack,
            }
        })
    }
}

/// Install the compiler collaborator.
impl crate::runtime::Runtime {
    /// Install (or clear) the bytecode compiler used by `eval`.
    pub fn set_compiler(&self, compiler: Option<Rc<dyn Compiler>>) {
        *self.inner.compiler.borrow_mut() = compiler;
    }
}
