//! The host/VM function bridge.
//!
//! Marshals calls from script-land into plugin callables and back: argument
//! coercion with arity tolerance, the panic barrier, script callbacks handed
//! to plugins as queue-routed handles, and plugin promises settled through
//! queued `resolve`/`reject`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gode_plugin_api::{
    Callable, Callback, CallbackDone, CallbackWait, Export, ExportTable, HostContext, ParamKind,
    PluginError, PluginReturn, PluginValue,
};
use rquickjs::prelude::Rest;
use rquickjs::{Array, Ctx, Function, IntoJs, Object, Persistent, Promise, Undefined, Value};

use crate::engine::{self, coerce_fn_signature, CatchStructured as _};
use crate::error::{Error, ErrorKind, Result};
use crate::{CoreState, JobSink, PromiseCell, RuntimeCore, VmJob};

/// Trampoline installed at VM setup. Normalizes any callback result through
/// `Promise.resolve` so sync returns, async returns and sync throws all land
/// in `onOk`/`onErr` during the post-job drain.
pub(crate) const CALLBACK_TRAMPOLINE: &str =
    "(f, args, onOk, onErr) => { try { Promise.resolve(f(...args)).then(onOk, onErr); } catch (e) { onErr(e); } }";

/// The runtime's implementation of the plugin-facing host contract. Lives
/// behind an `Arc` inside every `Host`, `Callback` and `Completer` a plugin
/// holds, so it must stay valid (and merely fail gracefully) after disposal.
pub struct HostHandle {
    sink: Arc<dyn JobSink>,
    next_promise: AtomicU64,
}

impl HostHandle {
    pub fn new(sink: Arc<dyn JobSink>) -> Self {
        Self {
            sink,
            next_promise: AtomicU64::new(1),
        }
    }
}

impl HostContext for HostHandle {
    fn invoke_callback(&self, callback: u64, args: Vec<PluginValue>) -> CallbackWait {
        let (wait, done) = CallbackWait::pending(self.sink.worker_thread());
        let job_done = done.clone();
        let job: VmJob = Box::new(move |core: &mut RuntimeCore| {
            core.with(|ctx, state| run_callback(state, ctx, callback, &args, &job_done));
        });
        if let Err(err) = self.sink.submit(job) {
            done.complete(Err(PluginError::new(match err {
                crate::SubmitError::Disposed => "callback invoked against a disposed vm",
                crate::SubmitError::QueueFull => "callback dropped: vm work queue is full",
            })));
        }
        wait
    }

    fn allocate_promise(&self) -> u64 {
        self.next_promise.fetch_add(1, Ordering::Relaxed)
    }

    fn settle_promise(&self, promise: u64, result: std::result::Result<PluginValue, PluginError>) {
        let job: VmJob = Box::new(move |core: &mut RuntimeCore| {
            core.with(|ctx, state| settle(state, ctx, promise, result));
        });
        if self.sink.submit(job).is_err() {
            tracing::debug!(promise, "promise settled after vm disposal; dropped");
        }
    }
}

/// Engine value → plugin value. Script functions register as callbacks.
pub(crate) fn from_js<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    value: &Value<'js>,
) -> rquickjs::Result<PluginValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(PluginValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(PluginValue::Bool(b));
    }
    if let Some(n) = value.as_int() {
        return Ok(PluginValue::Int(n as i64));
    }
    if let Some(f) = value.as_float() {
        return Ok(PluginValue::Float(f));
    }
    if let Some(s) = value.as_string() {
        return Ok(PluginValue::Str(s.to_string()?));
    }
    if let Some(func) = value.as_function() {
        let persistent = Persistent::save(ctx, func.clone());
        let mut state = core.borrow_mut();
        let id = state.register_callback(persistent);
        let host = state.host.clone();
        drop(state);
        return Ok(PluginValue::Callback(Callback::new(
            id,
            host.context().clone(),
        )));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value>() {
            items.push(from_js(core, ctx, &item?)?);
        }
        return Ok(PluginValue::Sequence(items));
    }
    if let Some(object) = value.as_object() {
        let mut map = std::collections::BTreeMap::new();
        for prop in object.props::<String, Value>() {
            let (key, value) = prop?;
            map.insert(key, from_js(core, ctx, &value)?);
        }
        return Ok(PluginValue::Mapping(map));
    }
    // Symbols, bigints and friends have no plugin representation.
    tracing::debug!(kind = ?value.type_of(), "opaque value crossed the bridge as null");
    Ok(PluginValue::Null)
}

/// Plugin value → engine value. Callback handles restore to the original
/// script function.
pub(crate) fn to_js<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    value: &PluginValue,
) -> rquickjs::Result<Value<'js>> {
    match value {
        PluginValue::Null => rquickjs::Null.into_js(ctx),
        PluginValue::Bool(b) => (*b).into_js(ctx),
        PluginValue::Int(n) => {
            if i32::try_from(*n).is_ok() {
                (*n as i32).into_js(ctx)
            } else {
                (*n as f64).into_js(ctx)
            }
        }
        PluginValue::Float(f) => (*f).into_js(ctx),
        PluginValue::Str(s) => s.as_str().into_js(ctx),
        PluginValue::Sequence(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, to_js(core, ctx, item)?)?;
            }
            Ok(array.into_value())
        }
        PluginValue::Mapping(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), to_js(core, ctx, item)?)?;
            }
            Ok(object.into_value())
        }
        PluginValue::Callback(callback) => {
            let persistent = core.borrow().callbacks.get(&callback.id()).cloned();
            match persistent {
                Some(func) => Ok(func.restore(ctx)?.into_value()),
                None => rquickjs::Null.into_js(ctx),
            }
        }
    }
}

/// Build the exports object for a plugin's export table.
pub(crate) fn build_exports<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    plugin_name: &str,
    plugin_version: &str,
    table: ExportTable,
) -> Result<Object<'js>> {
    let exports = Object::new(ctx.clone()).catch_as(ctx, ErrorKind::Runtime, "plugin")?;
    for (name, export) in table.into_entries() {
        match export {
            Export::Function(callable) => {
                let func = make_plugin_fn(core.clone(), ctx, plugin_name.to_string(), name.clone(), callable)
                    .catch_as(ctx, ErrorKind::Runtime, "plugin")?;
                exports
                    .set(name.as_str(), func)
                    .catch_as(ctx, ErrorKind::Runtime, "plugin")?;
            }
            Export::Value(value) => {
                let value = to_js(core, ctx, &value).catch_as(ctx, ErrorKind::Runtime, "plugin")?;
                exports
                    .set(name.as_str(), value)
                    .catch_as(ctx, ErrorKind::Runtime, "plugin")?;
            }
        }
    }
    exports
        .set("__pluginName", plugin_name)
        .catch_as(ctx, ErrorKind::Runtime, "plugin")?;
    exports
        .set("__pluginVersion", plugin_version)
        .catch_as(ctx, ErrorKind::Runtime, "plugin")?;
    Ok(exports)
}

/// Wrap one plugin callable as a VM-callable function.
fn make_plugin_fn<'js>(
    core: Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    plugin: String,
    name: String,
    callable: Callable,
) -> rquickjs::Result<Function<'js>> {
    let fn_name = name.clone();
    let func = coerce_fn_signature(move |ctx: Ctx, args: Rest<Value>| -> rquickjs::Result<Value> {
        match call_plugin(&core, &ctx, &plugin, &name, &callable, args.into_inner()) {
            Ok(value) => Ok(value),
            Err(err) => Err(engine::throw_error(&ctx, &err)),
        }
    });
    Function::new(ctx.clone(), func)?.with_name(&fn_name)
}

fn call_plugin<'js>(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'js>,
    plugin: &str,
    name: &str,
    callable: &Callable,
    args: Vec<Value<'js>>,
) -> Result<Value<'js>> {
    let host = core.borrow().host.clone();
    let params = callable.fixed_params();

    // Fixed positions: coerce what the script passed, zero-fill what it
    // didn't. Extra arguments beyond the declared arity are discarded unless
    // the callable is variadic.
    let mut call_args = Vec::with_capacity(params.len());
    for (position, kind) in params.iter().enumerate() {
        let value = match args.get(position) {
            Some(value) => {
                let value = from_js(core, ctx, value)
                    .catch_as(ctx, ErrorKind::PluginRuntime, "call")?;
                coerce_arg(*kind, value, position, name)?
            }
            None => kind.zero_value(),
        };
        call_args.push(value);
    }
    if let Some(kind) = callable.variadic_kind() {
        for (position, value) in args.iter().enumerate().skip(params.len()) {
            let value =
                from_js(core, ctx, value).catch_as(ctx, ErrorKind::PluginRuntime, "call")?;
            call_args.push(coerce_arg(kind, value, position, name)?);
        }
    }

    // The panic barrier. A host fault must never unwind into the engine.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callable.invoke(&host, &call_args)
    }));

    let returned = match outcome {
        Ok(Ok(returned)) => returned,
        Ok(Err(err)) => {
            return Err(Error::new(
                ErrorKind::PluginRuntime,
                format!("plugin '{plugin}' function '{name}': {}", err.message),
            )
            .maybe_script_stack(err.stack)
            .with_operation("call"));
        }
        Err(payload) => {
            return Err(Error::new(
                ErrorKind::PluginRuntime,
                format!(
                    "plugin '{plugin}' function '{name}' panicked: {}",
                    panic_message(payload)
                ),
            )
            .with_captured_host_trace()
            .with_operation("call"));
        }
    };

    match returned {
        PluginReturn::Value(PluginValue::Null) => Undefined
            .into_js(ctx)
            .catch_as(ctx, ErrorKind::Runtime, "call"),
        PluginReturn::Value(value) => {
            to_js(core, ctx, &value).catch_as(ctx, ErrorKind::Runtime, "call")
        }
        PluginReturn::Promise(promise) => {
            let (js_promise, resolve, reject) =
                Promise::new(ctx).catch_as(ctx, ErrorKind::Runtime, "call")?;
            core.borrow_mut().promises.insert(
                promise.id(),
                PromiseCell {
                    resolve: Persistent::save(ctx, resolve),
                    reject: Persistent::save(ctx, reject),
                },
            );
            Ok(js_promise.into_value())
        }
    }
}

/// Coerce one marshaled argument toward its declared kind. Null always takes
/// the kind's zero value; number kinds accept each other; everything else must
/// match or the call fails before the plugin runs.
fn coerce_arg(
    kind: ParamKind,
    value: PluginValue,
    position: usize,
    name: &str,
) -> Result<PluginValue> {
    let mismatch = |value: &PluginValue| {
        Error::new(
            ErrorKind::PluginRuntime,
            format!(
                "argument {position} of '{name}': expected {kind:?}, got {}",
                value.type_name()
            ),
        )
        .with_operation("call")
    };

    if value.is_null() && !matches!(kind, ParamKind::Dynamic) {
        return Ok(kind.zero_value());
    }

    Ok(match kind {
        ParamKind::Dynamic => value,
        ParamKind::Bool => match value.as_bool() {
            Some(b) => PluginValue::Bool(b),
            None => return Err(mismatch(&value)),
        },
        ParamKind::Int => match value.as_i64() {
            Some(n) => PluginValue::Int(n),
            None => return Err(mismatch(&value)),
        },
        ParamKind::Float => match value.as_f64() {
            Some(f) => PluginValue::Float(f),
            None => return Err(mismatch(&value)),
        },
        ParamKind::Str => match value {
            PluginValue::Str(s) => PluginValue::Str(s),
            PluginValue::Int(n) => PluginValue::Str(n.to_string()),
            PluginValue::Float(f) => PluginValue::Str(f.to_string()),
            other => return Err(mismatch(&other)),
        },
        ParamKind::Mapping => match value {
            PluginValue::Mapping(map) => PluginValue::Mapping(map),
            other => return Err(mismatch(&other)),
        },
        ParamKind::Sequence => match value {
            PluginValue::Sequence(items) => PluginValue::Sequence(items),
            other => return Err(mismatch(&other)),
        },
        ParamKind::Callback => match value {
            PluginValue::Callback(cb) => PluginValue::Callback(cb),
            other => return Err(mismatch(&other)),
        },
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Queued callback invocation: restore the script function, run it through the
/// trampoline, complete the plugin's wait handle from `onOk`/`onErr`.
fn run_callback(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'_>,
    id: u64,
    args: &[PluginValue],
    done: &CallbackDone,
) {
    if let Err(err) = run_callback_inner(core, ctx, id, args, done) {
        done.complete(Err(err));
    }
}

fn run_callback_inner(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'_>,
    id: u64,
    args: &[PluginValue],
    done: &CallbackDone,
) -> std::result::Result<(), PluginError> {
    let (func, trampoline) = {
        let state = core.borrow();
        (
            state.callbacks.get(&id).cloned(),
            state.apply_helper.clone(),
        )
    };
    let func = func.ok_or_else(|| PluginError::new(format!("unknown callback {id}")))?;
    let trampoline = trampoline.ok_or_else(|| PluginError::new("vm not initialized"))?;

    let result: rquickjs::Result<()> = (|| {
        let func = func.restore(ctx)?;
        let trampoline = trampoline.restore(ctx)?;

        let js_args = Array::new(ctx.clone())?;
        for (index, arg) in args.iter().enumerate() {
            js_args.set(index, to_js(core, ctx, arg)?)?;
        }

        let ok_core = core.clone();
        let ok_done = done.clone();
        let on_ok = coerce_fn_signature(
            move |ctx: Ctx, args: Rest<Value>| -> rquickjs::Result<Value> {
                let value = args.into_inner().into_iter().next();
                let converted = match &value {
                    Some(value) => from_js(&ok_core, &ctx, value),
                    None => Ok(PluginValue::Null),
                };
                match converted {
                    Ok(value) => ok_done.complete(Ok(value)),
                    Err(_) => ok_done.complete(Err(PluginError::new(
                        "callback result could not cross the bridge",
                    ))),
                }
                Undefined.into_js(&ctx)
            },
        );
        let err_done = done.clone();
        let on_err = coerce_fn_signature(
            move |ctx: Ctx, args: Rest<Value>| -> rquickjs::Result<Value> {
                let thrown = args.into_inner().into_iter().next();
                err_done.complete(Err(plugin_error_from_value(&ctx, thrown)));
                Undefined.into_js(&ctx)
            },
        );
        let on_ok = Function::new(ctx.clone(), on_ok)?;
        let on_err = Function::new(ctx.clone(), on_err)?;

        trampoline.call((func, js_args, on_ok, on_err))
    })();

    result
        .catch_as(ctx, ErrorKind::PluginRuntime, "callback")
        .map_err(|err| {
            let mut converted = PluginError::new(err.message().to_string());
            if let Some(stack) = err.script_stack() {
                converted = converted.with_stack(stack.to_string());
            }
            converted
        })
}

/// Extract a plugin error from a value thrown by script code.
fn plugin_error_from_value<'js>(ctx: &Ctx<'js>, thrown: Option<Value<'js>>) -> PluginError {
    let Some(thrown) = thrown else {
        return PluginError::new("callback raised");
    };
    if let Some(object) = thrown.as_object() {
        let message: Option<String> = object.get("message").ok();
        let stack: Option<String> = object.get("stack").ok();
        if let Some(message) = message {
            let mut err = PluginError::new(message);
            if let Some(stack) = stack {
                err = err.with_stack(stack);
            }
            return err;
        }
    }
    let rendered = engine::export_value(ctx, &thrown)
        .map(|json| json.to_string())
        .unwrap_or_else(|_| "callback raised".to_string());
    PluginError::new(rendered)
}

/// Queued promise settlement: call the stored resolve/reject function. First
/// settlement removes the cell; later ones are ignored.
fn settle(
    core: &Rc<RefCell<CoreState>>,
    ctx: &Ctx<'_>,
    id: u64,
    result: std::result::Result<PluginValue, PluginError>,
) {
    let cell = core.borrow_mut().promises.remove(&id);
    let Some(cell) = cell else {
        tracing::debug!(promise = id, "settlement for unknown or settled promise");
        return;
    };
    let settled: rquickjs::Result<()> = (|| match result {
        Ok(value) => {
            let resolve = cell.resolve.restore(ctx)?;
            let value = to_js(core, ctx, &value)?;
            resolve.call((value,))
        }
        Err(err) => {
            let reject = cell.reject.restore(ctx)?;
            let host_err = Error::from(err).with_operation("plugin");
            let value = engine::error_to_value(ctx, &host_err)?;
            reject.call((value,))
        }
    })();
    if settled
        .catch_as(ctx, ErrorKind::Runtime, "plugin")
        .is_err()
    {
        tracing::warn!(promise = id, "failed to settle plugin promise");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_fills_null_with_zero_value() {
        let coerced = coerce_arg(ParamKind::Int, PluginValue::Null, 0, "f").unwrap();
        assert_eq!(coerced, PluginValue::Int(0));
        let coerced = coerce_arg(ParamKind::Mapping, PluginValue::Null, 1, "f").unwrap();
        assert_eq!(coerced, PluginValue::Mapping(Default::default()));
    }

    #[test]
    fn coerce_accepts_numeric_widening() {
        let coerced = coerce_arg(ParamKind::Float, PluginValue::Int(3), 0, "f").unwrap();
        assert_eq!(coerced, PluginValue::Float(3.0));
        let coerced = coerce_arg(ParamKind::Int, PluginValue::Float(4.0), 0, "f").unwrap();
        assert_eq!(coerced, PluginValue::Int(4));
    }

    #[test]
    fn coerce_stringifies_numbers() {
        let coerced = coerce_arg(ParamKind::Str, PluginValue::Int(7), 0, "f").unwrap();
        assert_eq!(coerced, PluginValue::Str("7".into()));
    }

    #[test]
    fn coerce_rejects_hard_mismatches() {
        let err = coerce_arg(ParamKind::Sequence, PluginValue::Int(1), 2, "process").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PluginRuntime);
        assert!(err.message().contains("argument 2"));
        assert!(err.message().contains("process"));
    }

    #[test]
    fn coerce_passes_dynamic_through() {
        let value = PluginValue::Str("anything".into());
        assert_eq!(
            coerce_arg(ParamKind::Dynamic, value.clone(), 0, "f").unwrap(),
            value
        );
    }

    #[test]
    fn panic_messages_unwrap_common_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u32)), "non-string panic payload");
    }
}
