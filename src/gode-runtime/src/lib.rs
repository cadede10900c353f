//! The engine-owning half of gode.
//!
//! [`RuntimeCore`] bundles the QuickJS engine with the module system state and
//! lives on the VM worker thread for the lifetime of the VM. The host-facing
//! `gode` crate drives it exclusively through queued [`VmJob`] closures; the
//! [`JobSink`] trait is the narrow seam pointing back the other way, used by
//! the function bridge when plugins call into the VM from arbitrary threads.

pub mod bridge;
pub mod builtins;
pub mod engine;
pub mod error;
pub mod fs;
pub mod loader;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod resolve;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::ThreadId;

use gode_plugin_api::{Host, StaticPlugin};
use rquickjs::{Ctx, Function, Persistent};
use tracing::instrument;

use crate::engine::{CatchStructured as _, Engine, EngineConfig};
use crate::error::{ErrorKind, Result};
use crate::fs::ModuleFs;
use crate::manifest::Manifest;
use crate::plugin::PluginHost;
use crate::registry::ModuleRegistry;
use crate::resolve::{ModuleId, ResolverConfig};

/// A closure executed on the VM worker thread with exclusive engine access.
pub type VmJob = Box<dyn FnOnce(&mut RuntimeCore) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The VM has been disposed; the job was not accepted.
    Disposed,
    /// The queue is full and the submitter is the VM worker itself, which
    /// must not block on its own queue.
    QueueFull,
}

/// The serializer's intake, implemented by the host crate. Safe to call from
/// any thread.
pub trait JobSink: Send + Sync {
    /// Enqueue a job, applying backpressure when the queue is full.
    fn submit(&self, job: VmJob) -> std::result::Result<(), SubmitError>;

    /// Enqueue a job, dropping it silently when the queue is full or the VM
    /// is disposed. Returns whether the job was accepted.
    fn submit_or_drop(&self, job: VmJob) -> bool;

    /// Thread id of the VM worker, once it is running. Used for deadlock
    /// fast-fail in wait paths.
    fn worker_thread(&self) -> Option<ThreadId>;
}

/// Mutable module-system state, shared between the loader, the plugin host
/// and the host-function closures living inside the engine. Only ever touched
/// on the VM thread; the `RefCell` discipline is: never hold a borrow across
/// a script evaluation, because evaluation re-enters through `require`.
pub struct CoreState {
    pub(crate) registry: ModuleRegistry,
    pub(crate) resolver: ResolverConfig,
    pub(crate) fs: Arc<dyn ModuleFs>,
    pub(crate) virtuals: HashMap<String, String>,
    pub(crate) builtin_names: HashSet<String>,
    pub(crate) plugins: PluginHost,
    pub(crate) callbacks: HashMap<u64, Persistent<Function<'static>>>,
    pub(crate) next_callback: u64,
    pub(crate) promises: HashMap<u64, PromiseCell>,
    pub(crate) host: Host,
    /// The callback trampoline (see `bridge::CALLBACK_TRAMPOLINE`), kept for
    /// variable-arity callback calls with promise normalization.
    pub(crate) apply_helper: Option<Persistent<Function<'static>>>,
}

/// Settlement functions of a plugin-surfaced promise.
pub struct PromiseCell {
    pub(crate) resolve: Persistent<Function<'static>>,
    pub(crate) reject: Persistent<Function<'static>>,
}

impl CoreState {
    pub(crate) fn register_callback(&mut self, func: Persistent<Function<'static>>) -> u64 {
        let id = self.next_callback;
        self.next_callback += 1;
        self.callbacks.insert(id, func);
        id
    }
}

/// Everything the builder hands to the worker thread to construct the VM.
pub struct RuntimeSetup {
    pub engine: EngineConfig,
    pub manifest: Option<Manifest>,
    pub root: PathBuf,
    pub fs: Arc<dyn ModuleFs>,
    pub builtins: Vec<(String, BuiltinModule)>,
    pub static_plugins: Vec<(String, StaticPlugin)>,
    pub virtual_modules: Vec<(String, String)>,
}

/// The engine plus all module-system state. Constructed on the VM worker
/// thread and never leaves it.
pub struct RuntimeCore {
    // Declared before `engine`: the Rc clone drops first, the engine's drop
    // then releases every closure-held clone, and only then does CoreState
    // itself go away (after `shutdown` has already cleared all Persistents).
    state: Rc<RefCell<CoreState>>,
    engine: Engine,
    shut_down: bool,
}

impl RuntimeCore {
    #[instrument(skip_all, level = "info")]
    pub fn new(setup: RuntimeSetup, sink: Arc<dyn JobSink>) -> Result<Self> {
        let engine = Engine::new(&setup.engine)?;

        let resolver = match &setup.manifest {
            Some(manifest) => ResolverConfig::from_manifest(manifest, setup.root.clone()),
            None => ResolverConfig::empty(setup.root.clone()),
        };

        let host = Host::new(Arc::new(bridge::HostHandle::new(sink)));

        let state = Rc::new(RefCell::new(CoreState {
            registry: ModuleRegistry::new(),
            resolver,
            fs: setup.fs,
            virtuals: setup.virtual_modules.into_iter().collect(),
            builtin_names: HashSet::new(),
            plugins: PluginHost::new(setup.static_plugins),
            callbacks: HashMap::new(),
            next_callback: 1,
            promises: HashMap::new(),
            host,
            apply_helper: None,
        }));

        engine.with(|ctx| -> Result<()> {
            builtins::console::setup(&ctx).catch_as(&ctx, ErrorKind::Runtime, "setup")?;

            let helper: Function = ctx
                .eval(bridge::CALLBACK_TRAMPOLINE)
                .catch_as(&ctx, ErrorKind::Runtime, "setup")?;
            state.borrow_mut().apply_helper = Some(Persistent::save(&ctx, helper));

            // Embedder builtins first so they take precedence over defaults
            // of the same name.
            for (name, module) in &setup.builtins {
                builtins::install(&ctx, &state, name, module)?;
            }
            for (name, default) in builtins::DEFAULT_BUILTINS.entries() {
                if !state.borrow().builtin_names.contains(*name) {
                    builtins::install(&ctx, &state, name, &default())?;
                }
            }
            Ok(())
        })?;

        // Static ES imports resolve through the same pipeline as `require`.
        engine.set_loader(
            loader::ScriptResolver::new(state.clone()),
            loader::ScriptLoader::new(state.clone()),
        );

        Ok(Self {
            state,
            engine,
            shut_down: false,
        })
    }

    /// Run `f` with the engine context and the shared module-system state.
    pub fn with<R>(&mut self, f: impl FnOnce(&Ctx<'_>, &Rc<RefCell<CoreState>>) -> R) -> R {
        let state = self.state.clone();
        self.engine.with(|ctx| f(&ctx, &state))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Evaluate a top-level script. `name` labels stack traces; `base` (or the
    /// resolver root) anchors the script's `require`.
    #[instrument(skip(self, source), level = "debug")]
    pub fn run_script(
        &mut self,
        name: &str,
        source: &str,
        base: Option<&std::path::Path>,
    ) -> Result<serde_json::Value> {
        let referrer = script_referrer(name, base);
        let source = source.to_string();
        let name = name.to_string();
        self.with(move |ctx, state| {
            let require = loader::make_require(ctx, state.clone(), referrer)
                .catch_as(ctx, ErrorKind::Runtime, "execute")?;
            ctx.globals()
                .set("require", require)
                .catch_as(ctx, ErrorKind::Runtime, "execute")?;
            let value = engine::eval_with_name(ctx, &name, &source)?;
            engine::export_value(ctx, &value)
        })
    }

    /// Resolve and load a module by specifier, anchored at the resolver root.
    /// Returns the exports as a host JSON value.
    #[instrument(skip(self), level = "debug")]
    pub fn require(&mut self, specifier: &str) -> Result<serde_json::Value> {
        let specifier = specifier.to_string();
        self.with(move |ctx, state| {
            let referrer = ModuleId::new("gode:main");
            let exports = loader::require_value(state, ctx, &specifier, &referrer)?;
            engine::export_value(ctx, &exports)
        })
    }

    /// Set a global binding from a host JSON value.
    pub fn set_global_json(&mut self, name: &str, value: &serde_json::Value) -> Result<()> {
        let value = value.clone();
        self.with(move |ctx, _| {
            let value = engine::import_json(ctx, &value)?;
            ctx.globals()
                .set(name, value)
                .catch_as(ctx, ErrorKind::Runtime, "set_global")
        })
    }

    /// Read a global binding as a host JSON value.
    pub fn get_global_json(&mut self, name: &str) -> Result<serde_json::Value> {
        self.with(move |ctx, _| {
            let value: rquickjs::Value = ctx
                .globals()
                .get(name)
                .catch_as(ctx, ErrorKind::Runtime, "get_global")?;
            engine::export_value(ctx, &value)
        })
    }

    /// Ordered teardown: plugin `Dispose` hooks in reverse load order, then
    /// every engine reference held by the state maps. Must run before the
    /// engine drops; `Drop` calls it as a backstop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let mut state = self.state.borrow_mut();
        state.plugins.run_dispose();
        state.registry.clear();
        state.callbacks.clear();
        state.promises.clear();
        state.apply_helper = None;
    }
}

impl Drop for RuntimeCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn script_referrer(name: &str, base: Option<&std::path::Path>) -> ModuleId {
    let path = std::path::Path::new(name);
    if path.is_absolute() {
        ModuleId::from_path(path)
    } else if let Some(base) = base {
        ModuleId::from_path(&base.join(name))
    } else {
        ModuleId::new(format!("gode:script/{name}"))
    }
}

pub use crate::builtins::{BuiltinModule, HostFunction};
