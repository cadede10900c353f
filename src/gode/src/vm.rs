//! The VM serializer: a dedicated worker thread owning the engine, fed by a
//! bounded multi-producer single-consumer work queue.
//!
//! Queue-full policy: [`Vm::queue`] applies backpressure (the calling host
//! thread blocks until the queue accepts), [`Vm::queue_void`] drops silently
//! and counts the drop, observable through [`Vm::dropped_ops`] and the
//! `gode_ops_dropped_total` counter.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use gode_plugin_api::StaticPlugin;
use gode_runtime::builtins::{BuiltinModule, HostFunction};
use gode_runtime::engine::EngineConfig;
use gode_runtime::fs::{ModuleFs, OsFileSystem};
use gode_runtime::manifest::Manifest;
use gode_runtime::{JobSink, RuntimeCore, RuntimeSetup, SubmitError, VmJob};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{instrument, Level};

use crate::metrics::{
    METRIC_OPS_COMPLETED, METRIC_OPS_DROPPED, METRIC_OPS_ENQUEUED, METRIC_VMS_DISPOSED,
    METRIC_VMS_STARTED,
};
use crate::op::{AwaitableOp, OpResult};
use crate::{Error, ErrorKind, Result, Script};

/// Default depth of the serializer's work queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// State shared between the host-side handle, the worker, and every plugin
/// holding a callback into this VM.
struct VmShared {
    queue: Mutex<Option<Sender<VmJob>>>,
    disposed: AtomicBool,
    dropped: AtomicU64,
    worker: OnceLock<ThreadId>,
}

impl JobSink for VmShared {
    fn submit(&self, job: VmJob) -> std::result::Result<(), SubmitError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SubmitError::Disposed);
        }
        // Clone the sender out so a blocking send doesn't hold the lock
        // against other producers (or against dispose).
        let sender = self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .clone();
        let Some(sender) = sender else {
            return Err(SubmitError::Disposed);
        };
        // The worker must not block on its own queue.
        if self.worker_thread() == Some(std::thread::current().id()) {
            return match sender.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
                Err(TrySendError::Disconnected(_)) => Err(SubmitError::Disposed),
            };
        }
        sender.send(job).map_err(|_| SubmitError::Disposed)
    }

    fn submit_or_drop(&self, job: VmJob) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        let sender = self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .clone();
        match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(METRIC_OPS_DROPPED).increment(1);
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    fn worker_thread(&self) -> Option<ThreadId> {
        self.worker.get().copied()
    }
}

/// Builder for a [`Vm`].
pub struct VmBuilder {
    queue_capacity: usize,
    engine: EngineConfig,
    manifest: Option<Manifest>,
    manifest_path: Option<PathBuf>,
    root: Option<PathBuf>,
    fs: Option<Arc<dyn ModuleFs>>,
    builtins: Vec<(String, BuiltinModule)>,
    static_plugins: Vec<(String, StaticPlugin)>,
    virtual_modules: Vec<(String, String)>,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBuilder {
    /// A builder with default limits and an OS-filesystem resolver.
    pub fn new() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            engine: EngineConfig::default(),
            manifest: None,
            manifest_path: None,
            root: None,
            fs: None,
            builtins: Vec::new(),
            static_plugins: Vec::new(),
            virtual_modules: Vec::new(),
        }
    }

    /// Depth of the work queue. `queue` blocks and `queue_void` drops once
    /// this many closures are waiting.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Engine heap ceiling in bytes.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.engine.memory_limit = Some(bytes);
        self
    }

    /// Engine stack ceiling in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.engine.stack_size = Some(bytes);
        self
    }

    /// Wall-clock deadline applied to each queued closure.
    pub fn eval_timeout(mut self, timeout: Duration) -> Self {
        self.engine.eval_timeout = Some(timeout);
        self
    }

    /// Use an already-parsed manifest.
    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Read the manifest from a file at build time. Unless overridden with
    /// [`VmBuilder::root`], the manifest's directory becomes the resolver
    /// root.
    pub fn manifest_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    /// Anchor for top-level, alias and `file:` dependency resolution.
    /// Defaults to the manifest directory, or the working directory.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Substitute the filesystem the resolver and loader read through.
    pub fn filesystem(mut self, fs: impl ModuleFs + 'static) -> Self {
        self.fs = Some(Arc::new(fs));
        self
    }

    /// Register a builtin module, installed under `gode:<name>` before any
    /// user script runs. Registering an existing name replaces it.
    pub fn builtin(mut self, name: impl Into<String>, module: BuiltinModule) -> Self {
        let name = name.into();
        self.builtins.retain(|(existing, _)| *existing != name);
        self.builtins.push((name, module));
        self
    }

    /// Attach a host function to a builtin module. The function takes any
    /// serde-deserializable argument tuple and returns a serializable value.
    pub fn register_builtin_function<Args, Output>(
        mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        func: impl fn_traits::Fn<Args, Output = anyhow::Result<Output>> + Send + Sync + 'static,
    ) -> Self
    where
        Args: DeserializeOwned,
        Output: Serialize,
    {
        self.builtin_entry(module.into())
            .add_function(name.into(), HostFunction::new_serde(func));
        self
    }

    /// Attach a host function that takes and returns JSON strings.
    pub fn register_json_builtin_function(
        mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        func: impl Fn(String) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.builtin_entry(module.into())
            .add_function(name.into(), HostFunction::new_json(func));
        self
    }

    fn builtin_entry(&mut self, name: String) -> &mut BuiltinModule {
        if !self.builtins.iter().any(|(existing, _)| *existing == name) {
            self.builtins.push((name.clone(), BuiltinModule::new()));
        }
        let index = self
            .builtins
            .iter()
            .position(|(existing, _)| *existing == name)
            .expect("just inserted");
        &mut self.builtins[index].1
    }

    /// Register a statically linked plugin under the synthetic id
    /// `plugin:<key>`.
    pub fn static_plugin(mut self, key: impl Into<String>, plugin: StaticPlugin) -> Self {
        self.static_plugins.push((key.into(), plugin));
        self
    }

    /// Register an in-memory module loadable by exact specifier.
    pub fn virtual_module(
        mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.virtual_modules.push((name.into(), source.into()));
        self
    }

    /// Spawn the worker thread, construct the engine on it, and return the
    /// operating handle.
    #[instrument(err(Debug), skip_all, level = Level::INFO, fields(version = env!("CARGO_PKG_VERSION")))]
    pub fn build(self) -> Result<Vm> {
        let fs: Arc<dyn ModuleFs> = self.fs.unwrap_or_else(|| Arc::new(OsFileSystem));

        let manifest = match (self.manifest, &self.manifest_path) {
            (Some(manifest), _) => Some(manifest),
            (None, Some(path)) => Some(Manifest::load(&*fs, path)?),
            (None, None) => None,
        };

        let root = match self.root {
            Some(root) => root,
            None => match &self.manifest_path {
                Some(path) => path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
                None => std::env::current_dir().map_err(|err| {
                    Error::new(ErrorKind::Runtime, format!("no working directory: {err}"))
                })?,
            },
        };

        let (sender, receiver) = bounded::<VmJob>(self.queue_capacity);
        let shared = Arc::new(VmShared {
            queue: Mutex::new(Some(sender)),
            disposed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            worker: OnceLock::new(),
        });

        let setup = RuntimeSetup {
            engine: self.engine,
            manifest,
            root,
            fs,
            builtins: self.builtins,
            static_plugins: self.static_plugins,
            virtual_modules: self.virtual_modules,
        };

        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<()>>();
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("gode-vm".to_string())
            .spawn(move || worker_main(setup, worker_shared, receiver, init_tx))
            .map_err(|err| {
                Error::new(ErrorKind::Runtime, format!("unable to spawn vm worker: {err}"))
            })?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                metrics::counter!(METRIC_VMS_STARTED).increment(1);
                Ok(Vm {
                    inner: Arc::new(VmInner {
                        shared,
                        worker: Mutex::new(Some(handle)),
                    }),
                })
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::new(ErrorKind::Runtime, "vm worker failed to start"))
            }
        }
    }
}

fn worker_main(
    setup: RuntimeSetup,
    shared: Arc<VmShared>,
    receiver: Receiver<VmJob>,
    init_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let _ = shared.worker.set(std::thread::current().id());

    let mut core = match RuntimeCore::new(setup, shared.clone()) {
        Ok(core) => {
            let _ = init_tx.send(Ok(()));
            core
        }
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return;
        }
    };

    // FIFO to the end: the loop exits only after every sender is gone and all
    // accepted closures have run.
    while let Ok(job) = receiver.recv() {
        core.engine().arm_deadline();
        if catch_unwind(AssertUnwindSafe(|| job(&mut core))).is_err() {
            tracing::error!("a queued closure panicked; the vm continues");
        }
        core.engine().drain_pending_jobs();
        core.engine().disarm_deadline();
    }

    core.shutdown();
}

struct VmInner {
    shared: Arc<VmShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VmInner {
    fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        metrics::counter!(METRIC_VMS_DISPOSED).increment(1);

        // Severing the sender ends the worker loop after the in-flight and
        // already-accepted closures complete.
        drop(self.shared.queue.lock().expect("queue lock poisoned").take());

        // Joining from the worker itself (dispose inside a queued closure)
        // would deadlock; the worker exits on its own once the loop drains.
        if self.shared.worker_thread() == Some(std::thread::current().id()) {
            return;
        }
        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VmInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Handle to a running VM. Clones share the same VM; disposal through any
/// clone stops work intake for all of them.
#[derive(Clone)]
pub struct Vm {
    inner: Arc<VmInner>,
}

impl Vm {
    /// Start configuring a new VM.
    pub fn builder() -> VmBuilder {
        VmBuilder::new()
    }

    /// Enqueue a closure for the VM thread. Returns immediately with a handle;
    /// blocks only while the queue is at capacity. After disposal the handle
    /// carries a `Disposed` error without the closure running.
    pub fn queue<F>(&self, f: F) -> AwaitableOp
    where
        F: FnOnce(&mut VmContext<'_>) -> OpResult + Send + 'static,
    {
        if self.inner.shared.disposed.load(Ordering::SeqCst) {
            return AwaitableOp::completed(Err(Error::new(
                ErrorKind::Disposed,
                "queue called on a disposed vm",
            )));
        }
        metrics::counter!(METRIC_OPS_ENQUEUED).increment(1);

        let (op, mut completer) = AwaitableOp::pending(self.inner.shared.worker_thread());
        let job: VmJob = Box::new(move |core: &mut RuntimeCore| {
            let mut vm_ctx = VmContext { core };
            let result = f(&mut vm_ctx);
            metrics::counter!(METRIC_OPS_COMPLETED).increment(1);
            completer.complete(result);
        });
        // On a full queue this blocks (backpressure). If the VM raced into
        // disposal, the dropped completer resolves the op as Disposed.
        let _ = self.inner.shared.submit(job);
        op
    }

    /// Fire-and-forget variant: never blocks, drops silently when the queue is
    /// full or the VM is disposed. Drops are counted.
    pub fn queue_void<F>(&self, f: F)
    where
        F: FnOnce(&mut VmContext<'_>) -> OpResult + Send + 'static,
    {
        let job: VmJob = Box::new(move |core: &mut RuntimeCore| {
            let mut vm_ctx = VmContext { core };
            let _ = f(&mut vm_ctx);
        });
        let _ = self.inner.shared.submit_or_drop(job);
    }

    /// Evaluate a source string under a logical name.
    pub fn eval(&self, name: impl Into<String>, source: impl Into<String>) -> AwaitableOp {
        let name = name.into();
        let source = source.into();
        self.queue(move |vm| vm.eval(&name, &source))
    }

    /// Evaluate a [`Script`], honoring its base path for module resolution.
    pub fn run_script(&self, script: &Script) -> AwaitableOp {
        let name = script.name().to_string();
        let source = script.content().to_string();
        let base = script.base_path().map(Path::to_path_buf);
        self.queue(move |vm| vm.eval_at(&name, &source, base.as_deref()))
    }

    /// Resolve and load a module, returning its exports as a JSON value.
    pub fn require(&self, specifier: impl Into<String>) -> AwaitableOp {
        let specifier = specifier.into();
        self.queue(move |vm| vm.require(&specifier))
    }

    /// Stop accepting work and wait for accepted closures to finish. The
    /// worker disposes plugins (reverse load order) and tears the engine down.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Closures dropped by `queue_void` since the VM started.
    pub fn dropped_ops(&self) -> u64 {
        self.inner.shared.dropped.load(Ordering::Relaxed)
    }
}

/// The view of the VM a queued closure operates on.
pub struct VmContext<'a> {
    core: &'a mut RuntimeCore,
}

impl VmContext<'_> {
    /// Evaluate a script and export its completion value.
    pub fn eval(&mut self, name: &str, source: &str) -> OpResult {
        self.core.run_script(name, source, None)
    }

    pub(crate) fn eval_at(&mut self, name: &str, source: &str, base: Option<&Path>) -> OpResult {
        self.core.run_script(name, source, base)
    }

    /// Resolve and load a module; exports come back as JSON.
    pub fn require(&mut self, specifier: &str) -> OpResult {
        self.core.require(specifier)
    }

    /// Set a global binding from a JSON value.
    pub fn set_global(&mut self, name: &str, value: serde_json::Value) -> Result<()> {
        self.core.set_global_json(name, &value)
    }

    /// Read a global binding as a JSON value.
    pub fn get_global(&mut self, name: &str) -> OpResult {
        self.core.get_global_json(name)
    }
}
