//! The native plugin host: opens shared objects, probes the fixed symbol set,
//! and binds their export tables as module exports.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use dlopen::symbor::Library;
use gode_plugin_api::{ExportTable, Host, PluginError, StaticPlugin, API_VERSION};
use rquickjs::{Ctx, Object, Persistent, Value};
use tracing::{debug, warn};

use crate::bridge;
use crate::engine::CatchStructured as _;
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{ModuleKind, ModuleState};
use crate::resolve::{ModuleId, PluginSource};
use crate::CoreState;

type NameFn = fn() -> String;
type VersionFn = fn() -> String;
type ApiVersionFn = fn() -> u32;
type InitializeFn = fn(Host) -> std::result::Result<(), PluginError>;
type ExportsFn = fn() -> ExportTable;
type DisposeFn = fn() -> std::result::Result<(), PluginError>;

struct LoadedPlugin {
    id: ModuleId,
    dispose: Option<DisposeFn>,
    // Keeps the shared object mapped while bridged functions can still run.
    // The mapping is released when the host drops, which happens after the
    // engine has released every function referencing plugin code.
    _library: Option<Library>,
}

/// Tracks opened plugins and the statically registered plugin table.
/// Open-at-most-once is enforced by the module registry (one record per
/// canonical id); this type owns lifecycle: `Dispose` hooks run in reverse
/// load order at VM teardown.
pub struct PluginHost {
    statics: HashMap<String, StaticPlugin>,
    loaded: Vec<LoadedPlugin>,
    disposed: bool,
}

impl PluginHost {
    pub fn new(statics: Vec<(String, StaticPlugin)>) -> Self {
        Self {
            statics: statics.into_iter().collect(),
            loaded: Vec::new(),
            disposed: false,
        }
    }

    pub fn has_static(&self, key: &str) -> bool {
        self.statics.contains_key(key)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Run `Dispose` hooks in reverse load order. Faults are contained and
    /// logged; teardown always proceeds.
    pub fn run_dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for plugin in self.loaded.iter().rev() {
            let Some(dispose) = plugin.dispose else {
                continue;
            };
            match catch_unwind(dispose) {
                Ok(Ok(())) => debug!(plugin = %plugin.id, "plugin disposed"),
                Ok(Err(err)) => warn!(plugin = %plugin.id, error = %err, "plugin dispose failed"),
                Err(_) => warn!(plugin = %plugin.id, "plugin dispose panicked"),
            }
        }
    }
}

struct OpenedPlugin {
    name: String,
    version: String,
    table: ExportTable,
    dispose: Option<DisposeFn>,
    library: Option<Library>,
}

/// Execute a Plugin load plan: open, probe, initialize, bind exports.
/// Failures are cached on the module record, so a broken plugin reports the
/// same error on every request without re-opening.
pub(crate) fn load<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    id: &ModuleId,
    source: PluginSource,
) -> Result<Value<'js>> {
    core.borrow_mut()
        .registry
        .insert(id.clone(), ModuleKind::Plugin, ModuleState::Resolving, None);

    let fail = |err: Error| -> Error {
        core.borrow_mut().registry.mark_failed(id, err.clone());
        err
    };

    let opened = match open_plugin(core, id, &source) {
        Ok(opened) => opened,
        Err(err) => return Err(fail(err)),
    };
    debug!(plugin = %id, name = %opened.name, version = %opened.version, "plugin opened");

    let exports = match bridge::build_exports(core, ctx, &opened.name, &opened.version, opened.table)
    {
        Ok(exports) => exports,
        Err(err) => return Err(fail(err.with_module(id.clone()))),
    };

    let module = Object::new(ctx.clone()).catch_as(ctx, ErrorKind::Runtime, "plugin")?;
    module
        .set("exports", exports.clone())
        .catch_as(ctx, ErrorKind::Runtime, "plugin")?;
    module
        .set("id", id.as_str())
        .catch_as(ctx, ErrorKind::Runtime, "plugin")?;

    {
        let mut state = core.borrow_mut();
        state.registry.complete(id, Persistent::save(ctx, module));
        state.plugins.loaded.push(LoadedPlugin {
            id: id.clone(),
            dispose: opened.dispose,
            _library: opened.library,
        });
    }

    Ok(exports.into_value())
}

fn open_plugin(
    core: &Rc<RefCell<CoreState>>,
    id: &ModuleId,
    source: &PluginSource,
) -> Result<OpenedPlugin> {
    match source {
        PluginSource::Static(key) => {
            let registered = core.borrow().plugins.statics.get(key).cloned();
            let plugin = registered.ok_or_else(|| {
                Error::new(
                    ErrorKind::PluginLoad,
                    format!("no statically registered plugin '{key}'"),
                )
                .with_module(id.clone())
            })?;
            if let Some(init) = plugin.init {
                run_initialize(core, id, move |host| init(host))?;
            }
            Ok(OpenedPlugin {
                name: plugin.name.to_string(),
                version: plugin.version.to_string(),
                table: (plugin.exports)(),
                dispose: plugin.dispose,
                library: None,
            })
        }
        PluginSource::Dylib(path) => {
            let library = Library::open(path).map_err(|err| {
                Error::new(
                    ErrorKind::PluginLoad,
                    format!("unable to open plugin {}: {err}", path.display()),
                )
                .with_module(id.clone())
                .with_operation("open")
            })?;

            if let Ok(api_version) = unsafe { library.symbol::<ApiVersionFn>("ApiVersion") } {
                let reported = (*api_version)();
                if reported != API_VERSION {
                    return Err(Error::new(
                        ErrorKind::PluginLoad,
                        format!(
                            "plugin ABI version {reported} does not match host version {API_VERSION}"
                        ),
                    )
                    .with_module(id.clone()));
                }
            }

            let name = unsafe { library.symbol::<NameFn>("Name") }
                .map(|f| (*f)())
                .unwrap_or_default();
            let version = unsafe { library.symbol::<VersionFn>("Version") }
                .map(|f| (*f)())
                .unwrap_or_default();

            let exports_fn: ExportsFn = *unsafe { library.symbol::<ExportsFn>("Exports") }
                .map_err(|err| {
                    Error::new(
                        ErrorKind::PluginLoad,
                        format!("plugin is missing the required Exports symbol: {err}"),
                    )
                    .with_module(id.clone())
                })?;

            if let Ok(init) = unsafe { library.symbol::<InitializeFn>("Initialize") } {
                let init: InitializeFn = *init;
                run_initialize(core, id, move |host| init(host))?;
            }

            let table = catch_unwind(exports_fn).map_err(|_| {
                Error::new(ErrorKind::PluginLoad, "plugin Exports panicked")
                    .with_module(id.clone())
                    .with_captured_host_trace()
            })?;

            let dispose = unsafe { library.symbol::<DisposeFn>("Dispose") }
                .ok()
                .map(|f| *f);

            Ok(OpenedPlugin {
                name,
                version,
                table,
                dispose,
                library: Some(library),
            })
        }
    }
}

fn run_initialize(
    core: &Rc<RefCell<CoreState>>,
    id: &ModuleId,
    init: impl FnOnce(Host) -> std::result::Result<(), PluginError>,
) -> Result<()> {
    let host = core.borrow().host.clone();
    match catch_unwind(AssertUnwindSafe(move || init(host))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::new(
            ErrorKind::PluginInit,
            format!("plugin initialization failed: {}", err.message),
        )
        .with_module(id.clone())),
        Err(_) => Err(Error::new(
            ErrorKind::PluginInit,
            "plugin initialization panicked",
        )
        .with_module(id.clone())
        .with_captured_host_trace()),
    }
}
