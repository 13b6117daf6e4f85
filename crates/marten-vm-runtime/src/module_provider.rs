//! In-memory module provider and specifier normalization
//!
//! The core never touches the filesystem; hosts register module factories
//! under names and the loader resolves relative specifiers with plain
//! path algebra.

use std::cell::RefCell;
use std::rc::Rc;

use marten_vm_core::module::{ModuleLoader, ModuleRecord};
use marten_vm_core::{Context, GcRef, JsResult};
use rustc_hash::FxHashMap;

/// Builds (usually: compiles) one module on demand.
pub type ModuleFactory = Rc<dyn Fn(&Context) -> JsResult<GcRef<ModuleRecord>>>;

/// Resolve a specifier against the importing module's name.
///
/// Bare names pass through; `./` and `../` resolve against the base's
/// directory without consulting any filesystem.
pub fn normalize_specifier(base: &str, name: &str) -> String {
    if !name.starts_with("./") && !name.starts_with("../") {
        return name.to_string();
    }
    let mut parts: Vec<&str> = base.split('/').collect();
    parts.pop(); // drop the base filename
    for seg in name.split('/') {
        match seg {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// A loader serving registered in-memory modules.
#[derive(Default)]
pub struct MemoryModuleProvider {
    factories: RefCell<FxHashMap<String, ModuleFactory>>,
}

impl MemoryModuleProvider {
    /// Empty provider.
    pub fn new() -> Rc<MemoryModuleProvider> {
        Rc::new(MemoryModuleProvider::default())
    }

    /// Register a module factory under `name`.
    pub fn register(&self, name: &str, factory: ModuleFactory) {
        self.factories.borrow_mut().insert(name.to_string(), factory);
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.factories.borrow().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.borrow().is_empty()
    }
}

impl ModuleLoader for MemoryModuleProvider {
    fn normalize(&self, _ctx: &Context, base: &str, name: &str) -> JsResult<String> {
        Ok(normalize_specifier(base, name))
    }

    fn load(&self, ctx: &Context, name: &str) -> JsResult<GcRef<ModuleRecord>> {
        let factory = self.factories.borrow().get(name).cloned();
        match factory {
            Some(f) => f(ctx),
            None => Err(ctx.throw_reference_error(format!("module '{name}' not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare() {
        assert_eq!(normalize_specifier("dir/a.js", "lib"), "lib");
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_specifier("dir/a.js", "./b.js"), "dir/b.js");
        assert_eq!(normalize_specifier("dir/sub/a.js", "../b.js"), "dir/b.js");
        assert_eq!(normalize_specifier("a.js", "./b.js"), "b.js");
    }
}
