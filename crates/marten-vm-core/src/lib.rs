//! # Marten VM Core
//!
//! Core value, object and runtime model for the Marten JavaScript
//! engine: interned atoms, narrow/wide strings, the tagged value
//! representation, hidden-class objects with a shared shape cache, the
//! reference-counted heap driving (from `marten-vm-gc`), the module
//! linker, the promise/job machine, proxies, typed arrays, keyed
//! collections and the bit-exact serializer.
//!
//! ## Design principles
//!
//! - **Single-threaded**: a runtime belongs to one thread; every table is
//!   per-runtime, nothing global.
//! - **Refcount discipline**: every heap pointer bump is mirrored by a
//!   handle clone/drop; the cycle collector frees what the counts miss.
//! - **Exception channel**: fallible primitives return `Result`; the
//!   thrown value lives in the runtime's single slot.
//! - **Interface seams**: the compiler, interpreter loop and module
//!   storage are collaborators behind `Compiler`, `FunctionBody` and
//!   `ModuleLoader`.

#![warn(clippy::all)]

pub mod array;
pub mod array_buffer;
pub mod atom;
pub mod call;
pub mod class;
pub mod context;
pub mod convert;
pub mod coroutine;
pub mod error;
pub mod eval;
pub mod frame;
pub mod function;
pub mod intrinsics;
pub mod map_set;
pub mod module;
pub mod object;
pub mod object_ops;
pub mod promise;
pub mod proxy;
pub mod runtime;
pub mod serialize;
pub mod shape;
pub mod string;
pub mod typed_array;
pub mod value;
pub mod weak;

pub use atom::{Atom, AtomKind, AtomTable, JsSymbol};
pub use class::{
    ClassDef, ClassRegistry, ExoticMethods, ExoticResult, OwnProperty, OwnPropertyKind,
    PropertyDescriptor,
};
pub use context::{Context, Realm, WellKnownSymbols};
pub use convert::PrimitiveHint;
pub use coroutine::{Completion, Coroutine, FuncRet, GeneratorState};
pub use error::{EngineError, ErrorKind, JsException, JsResult};
pub use eval::{Compiler, EvalFlags};
pub use frame::{Frame, VarRef};
pub use function::{
    CallFlags, ClosureVarDef, FrameRef, FunctionBody, FunctionBytecode, FunctionFlags, NativeFn,
    body_fn, resumable_body_fn,
};
pub use map_set::{MapKey, MapState};
pub use module::{ModuleLoader, ModuleRecord, ResolvedExport};
pub use object::{ClassId, JsObject, ObjectData, Property, class_ids, obj_flags};
pub use object_ops::gpn_flags;
pub use promise::{PromiseCapability, PromiseState};
pub use runtime::{Job, JobFn, Runtime};
pub use serialize::{WriteResult, read_flags, write_flags};
pub use shape::{PropFlags, Shape, ShapeCache};
pub use string::JsString;
pub use typed_array::TypedArrayKind;
pub use value::Value;

pub use marten_vm_gc::{GcAny, GcHeap, GcKind, GcRef, GcStats, Trace};
