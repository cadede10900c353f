//! gode is a server-side JavaScript execution host.
//!
//! The embedded QuickJS engine lives on a single dedicated worker thread; all
//! interaction goes through the [`Vm`] handle's bounded work queue and comes
//! back through [`AwaitableOp`]s. Scripts see a unified `require` surface over
//! builtin modules (`gode:*`), native plugins (shared objects or statically
//! registered tables), import-map aliases, manifest dependencies, and
//! filesystem modules with CommonJS semantics.
//!
//! ```no_run
//! use gode::Vm;
//!
//! fn main() -> gode::Result<()> {
//!     let vm = Vm::builder().build()?;
//!     let result = vm.eval("hello.js", "const c = require('gode:core'); c.platform").wait()?;
//!     println!("running on {result}");
//!     vm.dispose();
//!     Ok(())
//! }
//! ```
#![deny(missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod metrics;
mod op;
mod script;
mod vm;

/// Awaitable handle for queued VM work.
pub use op::{AwaitableOp, OpResult};
/// A script plus the metadata anchoring its module resolution.
pub use script::Script;
/// The VM handle, its builder, and the closure-side context.
pub use vm::{Vm, VmBuilder, VmContext, DEFAULT_QUEUE_CAPACITY};

/// Structured error type shared across the runtime.
pub use gode_runtime::error::{Error, ErrorKind};
/// Builtin module registration types.
pub use gode_runtime::builtins::{BuiltinModule, HostFunction};
/// Filesystem collaborator consumed by the resolver and loader.
pub use gode_runtime::fs::{FileMetadata, MemoryFileSystem, ModuleFs, OsFileSystem};
/// The project manifest record.
pub use gode_runtime::manifest::Manifest;
/// Canonical module identifier.
pub use gode_runtime::resolve::ModuleId;

/// The plugin ABI, re-exported for embedders that register static plugins.
pub use gode_plugin_api as plugin_api;

/// Result alias over the structured [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
