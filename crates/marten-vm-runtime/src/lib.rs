//! # Marten VM Runtime
//!
//! Host embedding glue for the Marten engine core: a configuration
//! builder, an in-memory module provider with specifier normalization,
//! and the job pump. Everything here sits on the public surface of
//! `marten-vm-core`; hosts wanting filesystem module loading or an event
//! loop layer those on top.

#![warn(clippy::all)]
#![warn(missing_docs)]

mod builder;
mod jobs;
mod module_provider;

pub use builder::{RuntimeBuilder, RuntimeConfig};
pub use jobs::{run_jobs, run_jobs_lossy};
pub use module_provider::{MemoryModuleProvider, ModuleFactory, normalize_specifier};
