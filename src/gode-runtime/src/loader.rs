//! Load-plan execution and the `require` surface.
//!
//! Everything here runs on the VM thread. The one discipline that matters:
//! never hold a `CoreState` borrow across script evaluation, because evaluated
//! code re-enters this module through `require`.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use rquickjs::prelude::Rest;
use rquickjs::{Ctx, FromJs, Function, IntoJs, Module, Object, Persistent, Undefined, Value};
use tracing::debug;

use crate::engine::{self, coerce_fn_signature, CatchStructured as _};
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{ModuleKind, ModuleState};
use crate::resolve::{LoadPlan, ModuleId, Resolution};
use crate::{plugin, CoreState};

/// Resolve a specifier against the current runtime state.
pub(crate) fn resolve_plan(
    core: &Rc<RefCell<CoreState>>,
    specifier: &str,
    referrer: &ModuleId,
) -> Result<LoadPlan> {
    let state = core.borrow();
    let referrer_dir = referrer.directory(&state.resolver.root);
    let builtins = |name: &str| state.builtin_names.contains(name);
    let statics = |key: &str| state.plugins.has_static(key);
    let virtuals = |name: &str| state.virtuals.contains_key(name);
    let resolution = Resolution {
        config: &state.resolver,
        fs: &*state.fs,
        builtins: &builtins,
        statics: &statics,
        virtuals: &virtuals,
    };
    resolution.resolve(specifier, &referrer_dir)
}

/// The `require` entry point: resolve, consult the registry, execute the plan
/// on a miss. Returns the module's exports value.
pub fn require_value<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    specifier: &str,
    referrer: &ModuleId,
) -> Result<Value<'js>> {
    let plan = resolve_plan(core, specifier, referrer)?;
    let id = plan.id();
    debug!(specifier, referrer = %referrer, id = %id, "module resolved");

    let cached = {
        let mut state = core.borrow_mut();
        state.registry.note_referrer(&id, referrer);
        match state.registry.get(&id) {
            None => None,
            Some(record) => match record.state {
                ModuleState::Failed => {
                    return Err(record.failure.clone().unwrap_or_else(|| {
                        Error::new(ErrorKind::ModuleLoad, "module previously failed")
                            .with_module(id.clone())
                    }));
                }
                // Evaluated modules return their exports; Evaluating ones
                // return the live (possibly partial) exports; this is the
                // cycle path.
                ModuleState::Evaluated | ModuleState::Evaluating | ModuleState::Resolving => {
                    Some(record.module.clone())
                }
            },
        }
    };
    if let Some(module) = cached {
        return exports_of(ctx, module);
    }

    match plan {
        LoadPlan::Builtin(name) => Err(Error::new(
            ErrorKind::ModuleNotFound,
            format!("builtin 'gode:{name}' is not installed"),
        )
        .with_module(id)
        .with_operation("require")),
        LoadPlan::File { path, ext } if ext == "json" => load_json(core, ctx, &id, &path),
        LoadPlan::File { path, .. } => {
            let read = core.borrow().fs.read_to_string(&path);
            let source = match read {
                Ok(source) => source,
                Err(err) => {
                    core.borrow_mut()
                        .registry
                        .insert(id.clone(), ModuleKind::File, ModuleState::Resolving, None);
                    return fail(
                        core,
                        &id,
                        Error::new(
                            ErrorKind::ModuleLoad,
                            format!("unable to read {}: {err}", path.display()),
                        )
                        .with_module(id.clone())
                        .with_operation("require"),
                    );
                }
            };
            let filename = path.to_string_lossy().into_owned();
            let dirname = path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            load_commonjs(core, ctx, &id, ModuleKind::File, &filename, &dirname, &source)
        }
        LoadPlan::Virtual(name) => {
            let source = core
                .borrow()
                .virtuals
                .get(&name)
                .cloned()
                .expect("resolved virtual module has a source");
            let dirname = {
                let state = core.borrow();
                state.resolver.root.to_string_lossy().into_owned()
            };
            load_commonjs(core, ctx, &id, ModuleKind::Virtual, &name, &dirname, &source)
        }
        LoadPlan::Plugin(source) => plugin::load(core, ctx, &id, source),
        LoadPlan::Url(url) => {
            core.borrow_mut()
                .registry
                .insert(id.clone(), ModuleKind::Url, ModuleState::Resolving, None);
            fail(
                core,
                &id,
                Error::new(
                    ErrorKind::ModuleLoad,
                    format!("URL module loading is not supported: {url}"),
                )
                .with_module(id.clone())
                .with_operation("require"),
            )
        }
    }
}

/// Build the per-module `require` function. Resolution anchors at `referrer`.
pub fn make_require<'js>(
    ctx: &Ctx<'js>,
    core: Rc<RefCell<CoreState>>,
    referrer: ModuleId,
) -> rquickjs::Result<Function<'js>> {
    let func = coerce_fn_signature(move |ctx: Ctx, args: Rest<Value>| -> rquickjs::Result<Value> {
        let specifier: String = match args.into_inner().into_iter().next() {
            Some(value) => String::from_js(&ctx, value)?,
            None => {
                return Err(rquickjs::Exception::throw_type(
                    &ctx,
                    "require expects a module specifier",
                ));
            }
        };
        match require_value(&core, &ctx, &specifier, &referrer) {
            Ok(value) => Ok(value),
            Err(err) => Err(engine::throw_error(&ctx, &err)),
        }
    });
    Function::new(ctx.clone(), func)?.with_name("require")
}

fn exports_of<'js>(
    ctx: &Ctx<'js>,
    module: Option<Persistent<Object<'static>>>,
) -> Result<Value<'js>> {
    match module {
        None => Undefined
            .into_js(ctx)
            .catch_as(ctx, ErrorKind::Runtime, "require"),
        Some(persistent) => {
            let module = persistent
                .restore(ctx)
                .catch_as(ctx, ErrorKind::Runtime, "require")?;
            module
                .get::<_, Value>("exports")
                .catch_as(ctx, ErrorKind::Runtime, "require")
        }
    }
}

fn fail<T>(core: &Rc<RefCell<CoreState>>, id: &ModuleId, err: Error) -> Result<T> {
    core.borrow_mut().registry.mark_failed(id, err.clone());
    Err(err)
}

fn load_json<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    id: &ModuleId,
    path: &Path,
) -> Result<Value<'js>> {
    core.borrow_mut()
        .registry
        .insert(id.clone(), ModuleKind::File, ModuleState::Resolving, None);

    let read = core.borrow().fs.read_to_string(path);
    let text = match read {
        Ok(text) => text,
        Err(err) => {
            return fail(
                core,
                id,
                Error::new(
                    ErrorKind::ModuleLoad,
                    format!("unable to read {}: {err}", path.display()),
                )
                .with_module(id.clone())
                .with_operation("require"),
            );
        }
    };

    let parsed = match ctx
        .json_parse(text)
        .catch_as(ctx, ErrorKind::ModuleLoad, "require")
    {
        Ok(value) => value,
        Err(err) => return fail(core, id, err.with_module(id.clone())),
    };

    let module = Object::new(ctx.clone()).catch_as(ctx, ErrorKind::Runtime, "require")?;
    module
        .set("exports", parsed.clone())
        .catch_as(ctx, ErrorKind::Runtime, "require")?;
    module
        .set("id", id.as_str())
        .catch_as(ctx, ErrorKind::Runtime, "require")?;
    core.borrow_mut()
        .registry
        .complete(id, Persistent::save(ctx, module));
    Ok(parsed)
}

/// Evaluate CommonJS source: the module scope is a declared ES module whose
/// default export is the `(exports, require, module, __filename, __dirname)`
/// factory. Declaring it under the module path puts real file names into
/// script stack traces; the factory call is where the user's top level runs.
fn load_commonjs<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    id: &ModuleId,
    kind: ModuleKind,
    filename: &str,
    dirname: &str,
    source: &str,
) -> Result<Value<'js>> {
    let exports = Object::new(ctx.clone()).catch_as(ctx, ErrorKind::Runtime, "require")?;
    let module = Object::new(ctx.clone()).catch_as(ctx, ErrorKind::Runtime, "require")?;
    module
        .set("exports", exports.clone())
        .catch_as(ctx, ErrorKind::Runtime, "require")?;
    module
        .set("id", id.as_str())
        .catch_as(ctx, ErrorKind::Runtime, "require")?;

    // The record goes in before evaluation, in state Evaluating and holding
    // the live module object: a cycle back into this module observes whatever
    // `module.exports` holds at that instant.
    core.borrow_mut().registry.insert(
        id.clone(),
        kind,
        ModuleState::Evaluating,
        Some(Persistent::save(ctx, module.clone())),
    );

    let wrapper = format!(
        "export default function (exports, require, module, __filename, __dirname) {{\n{source}\n}}\n"
    );

    let declared = (|| -> rquickjs::Result<Function<'js>> {
        let declared = Module::declare(ctx.clone(), filename, wrapper)?;
        let (evaluated, promise) = declared.eval()?;
        promise.finish::<()>()?;
        evaluated.get("default")
    })();
    let factory = match declared.catch_as(ctx, ErrorKind::ModuleLoad, "require") {
        Ok(factory) => factory,
        Err(err) => return fail(core, id, err.with_module(id.clone())),
    };

    let require = make_require(ctx, core.clone(), id.clone())
        .catch_as(ctx, ErrorKind::Runtime, "require")?;

    let called: rquickjs::Result<()> =
        factory.call((exports, require, module.clone(), filename, dirname));
    match called.catch_as(ctx, ErrorKind::ModuleEval, "require") {
        Ok(()) => {
            core.borrow_mut().registry.mark_evaluated(id);
            module
                .get::<_, Value>("exports")
                .catch_as(ctx, ErrorKind::Runtime, "require")
        }
        Err(err) => fail(core, id, err.with_module(id.clone())),
    }
}

/// Engine hook: static ES imports resolve through the same resolver and
/// filesystem as `require`, for file modules.
pub struct ScriptResolver {
    state: Rc<RefCell<CoreState>>,
}

impl ScriptResolver {
    pub fn new(state: Rc<RefCell<CoreState>>) -> Self {
        Self { state }
    }
}

impl rquickjs::loader::Resolver for ScriptResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let referrer = ModuleId::new(base);
        match resolve_plan(&self.state, name, &referrer) {
            Ok(LoadPlan::File { path, .. }) => Ok(path.to_string_lossy().replace('\\', "/")),
            _ => Err(rquickjs::Error::new_resolving(base, name)),
        }
    }
}

pub struct ScriptLoader {
    state: Rc<RefCell<CoreState>>,
}

impl ScriptLoader {
    pub fn new(state: Rc<RefCell<CoreState>>) -> Self {
        Self { state }
    }
}

impl rquickjs::loader::Loader for ScriptLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        let source = self
            .state
            .borrow()
            .fs
            .read_to_string(Path::new(name))
            .map_err(|_| rquickjs::Error::new_loading(name))?;
        Module::declare(ctx.clone(), name, source)
    }
}
