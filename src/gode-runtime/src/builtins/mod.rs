//! Builtin module registration.
//!
//! A builtin is a named bag of host functions and constant values installed
//! under a `gode:<name>` id before any user script runs. The core ships a
//! single default (`gode:core`); embedders register the rest.

pub mod console;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context as _;
use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::{self, coerce_fn_signature, CatchStructured as _};
use crate::error::{ErrorKind, Result};
use crate::registry::{ModuleKind, ModuleState};
use crate::resolve::ModuleId;
use crate::CoreState;

/// A host function callable from script code.
///
/// Wraps a Rust closure so different closure shapes construct the same thing,
/// with error conversion from `anyhow::Error` handled in one place.
#[derive(Clone)]
pub struct HostFunction {
    #[allow(clippy::type_complexity)]
    func: Arc<
        dyn for<'js> Fn(&Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>
            + Send
            + Sync,
    >,
}

impl HostFunction {
    /// Build from a closure over engine types directly. The most flexible
    /// constructor; the serde variants below cover the common cases.
    pub fn new(
        func: impl for<'js> Fn(&Ctx<'js>, Rest<Value<'js>>) -> anyhow::Result<Value<'js>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            func: Arc::new(
                move |ctx: &Ctx, args: Rest<Value>| -> rquickjs::Result<Value> {
                    func(ctx, args).map_err(|err| match err.downcast::<rquickjs::Error>() {
                        Ok(err) => err,
                        Err(err) => Exception::throw_internal(
                            ctx,
                            &format!("host function error: {err:#}"),
                        ),
                    })
                },
            ),
        }
    }

    /// Build from a closure that takes and returns JSON strings. The
    /// arguments arrive serialized as a JSON array.
    pub fn new_json(
        func: impl Fn(String) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            move |ctx: &Ctx, args: Rest<Value>| -> anyhow::Result<Value> {
                let args = ctx
                    .json_stringify(args.into_inner())?
                    .map(|s| s.to_string())
                    .transpose()?
                    .context("serializing host function arguments")?;
                let result = func(args).context("calling host function")?;
                ctx.json_parse(result)
                    .context("parsing host function result")
            },
        )
    }

    /// Build from a closure over any serde-deserializable argument tuple and
    /// serializable output.
    pub fn new_serde<Args, Output>(
        func: impl fn_traits::Fn<Args, Output = anyhow::Result<Output>> + Send + Sync + 'static,
    ) -> Self
    where
        Args: DeserializeOwned,
        Output: Serialize,
    {
        Self::new_json(move |args: String| -> anyhow::Result<String> {
            let args: Args =
                serde_json::from_str(&args).context("deserializing host function arguments")?;
            let output: Output = func.call(args)?;
            serde_json::to_string(&output).context("serializing host function output")
        })
    }

    pub fn call<'js>(
        &self,
        ctx: &Ctx<'js>,
        args: Rest<Value<'js>>,
    ) -> rquickjs::Result<Value<'js>> {
        (self.func)(ctx, args)
    }
}

/// A builtin module under construction: named host functions plus constant
/// JSON values.
#[derive(Clone, Default)]
pub struct BuiltinModule {
    functions: Vec<(String, HostFunction)>,
    values: Vec<(String, serde_json::Value)>,
}

impl BuiltinModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, name: impl Into<String>, func: HostFunction) -> Self {
        self.add_function(name, func);
        self
    }

    /// Registering a function under an existing name overwrites it.
    pub fn add_function(&mut self, name: impl Into<String>, func: HostFunction) -> &mut Self {
        let name = name.into();
        self.functions.retain(|(existing, _)| *existing != name);
        self.functions.push((name, func));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }
}

/// Builtins every VM carries unless the embedder overrides them by name.
pub(crate) static DEFAULT_BUILTINS: phf::Map<&'static str, fn() -> BuiltinModule> = phf::phf_map! {
    "core" => core_builtin,
};

/// `gode:core`: runtime identification.
fn core_builtin() -> BuiltinModule {
    BuiltinModule::new()
        .value("version", env!("CARGO_PKG_VERSION"))
        .value("platform", std::env::consts::OS)
}

/// Install a builtin as an Evaluated registry record under `gode:<name>`.
pub(crate) fn install(
    ctx: &Ctx<'_>,
    state: &Rc<RefCell<CoreState>>,
    name: &str,
    module: &BuiltinModule,
) -> Result<()> {
    let id = ModuleId::builtin(name);

    let exports = Object::new(ctx.clone()).catch_as(ctx, ErrorKind::Runtime, "setup")?;
    for (fn_name, host_fn) in &module.functions {
        let host_fn = host_fn.clone();
        let func = coerce_fn_signature(move |ctx: Ctx, args: Rest<Value>| host_fn.call(&ctx, args));
        let func = Function::new(ctx.clone(), func)
            .and_then(|f| f.with_name(fn_name))
            .catch_as(ctx, ErrorKind::Runtime, "setup")?;
        exports
            .set(fn_name.as_str(), func)
            .catch_as(ctx, ErrorKind::Runtime, "setup")?;
    }
    for (key, value) in &module.values {
        exports
            .set(key.as_str(), engine::import_json(ctx, value)?)
            .catch_as(ctx, ErrorKind::Runtime, "setup")?;
    }

    let module_obj = Object::new(ctx.clone()).catch_as(ctx, ErrorKind::Runtime, "setup")?;
    module_obj
        .set("exports", exports)
        .catch_as(ctx, ErrorKind::Runtime, "setup")?;
    module_obj
        .set("id", id.as_str())
        .catch_as(ctx, ErrorKind::Runtime, "setup")?;

    let mut state = state.borrow_mut();
    state.registry.insert(
        id,
        ModuleKind::Builtin,
        ModuleState::Evaluated,
        Some(Persistent::save(ctx, module_obj)),
    );
    state.builtin_names.insert(name.to_string());
    Ok(())
}
