//! Thin adapter over the embedded QuickJS engine.
//!
//! Everything the rest of the runtime needs from `rquickjs` funnels through
//! here: context construction with resource limits, named evaluation, JSON
//! ingress/egress, and the two-way conversion between structured [`Error`]s
//! and script exception values. A future engine swap stays local to this
//! module.
//!
//! Every function here must be called on the VM thread. The serializer
//! guarantees that by construction; nothing in this module checks.

use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::loader::{Loader, Resolver};
use rquickjs::prelude::Rest;
use rquickjs::{qjs, CatchResultExt, CaughtError, Context, Ctx, Exception, Runtime, Value};

use crate::error::{Error, ErrorKind, Result};

/// Resource limits, fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Engine heap ceiling in bytes.
    pub memory_limit: Option<usize>,
    /// Engine stack ceiling in bytes.
    pub stack_size: Option<usize>,
    /// Wall-clock deadline applied to each queued closure. Exceeding it
    /// interrupts the running script with a `Runtime` error.
    pub eval_timeout: Option<Duration>,
}

pub struct Engine {
    runtime: Runtime,
    context: Context,
    deadline: Arc<Mutex<Option<Instant>>>,
    eval_timeout: Option<Duration>,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let runtime = Runtime::new().map_err(|err| {
            Error::new(ErrorKind::Runtime, format!("unable to initialize engine: {err}"))
        })?;

        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = config.stack_size {
            runtime.set_max_stack_size(size);
        }

        let deadline = Arc::new(Mutex::new(None::<Instant>));
        if config.eval_timeout.is_some() {
            let deadline = deadline.clone();
            runtime.set_interrupt_handler(Some(Box::new(move || {
                matches!(
                    *deadline.lock().expect("deadline lock poisoned"),
                    Some(at) if Instant::now() >= at
                )
            })));
        }

        let context = Context::full(&runtime).map_err(|err| {
            Error::new(ErrorKind::Runtime, format!("unable to create context: {err}"))
        })?;

        Ok(Self {
            runtime,
            context,
            deadline,
            eval_timeout: config.eval_timeout,
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(Ctx) -> R) -> R {
        self.context.with(f)
    }

    /// Install the engine's module resolution hooks (used for static ES
    /// imports; `require` has its own pipeline).
    pub fn set_loader<R, L>(&self, resolver: R, loader: L)
    where
        R: Resolver + 'static,
        L: Loader + 'static,
    {
        self.runtime.set_loader(resolver, loader);
    }

    /// Start the wall-clock deadline for the closure about to run.
    pub fn arm_deadline(&self) {
        if let Some(timeout) = self.eval_timeout {
            *self.deadline.lock().expect("deadline lock poisoned") = Some(Instant::now() + timeout);
        }
    }

    pub fn disarm_deadline(&self) {
        if self.eval_timeout.is_some() {
            *self.deadline.lock().expect("deadline lock poisoned") = None;
        }
    }

    /// Run engine-internal pending jobs (promise reactions) to quiescence.
    /// Called by the worker after every queued closure.
    pub fn drain_pending_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => {
                    tracing::warn!("a pending engine job raised");
                    continue;
                }
            }
        }
    }
}

/// Evaluate `source` in the global scope under the logical name `name`, which
/// is the file label surfaced in script stack traces. The safe `rquickjs`
/// surface hard-codes the eval label, so this drops to the raw engine call.
pub fn eval_with_name<'js>(ctx: &Ctx<'js>, name: &str, source: &str) -> Result<Value<'js>> {
    let src = CString::new(source).map_err(|_| {
        Error::new(ErrorKind::Runtime, "script source contains a NUL byte")
    })?;
    let file = CString::new(name).map_err(|_| {
        Error::new(ErrorKind::Runtime, "script name contains a NUL byte")
    })?;

    let raw = unsafe {
        qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            src.as_ptr(),
            source.len() as u64,
            file.as_ptr(),
            qjs::JS_EVAL_TYPE_GLOBAL as i32,
        )
    };

    if unsafe { qjs::JS_IsException(raw) } {
        let caught = Err::<(), _>(rquickjs::Error::Exception)
            .catch(ctx)
            .expect_err("exception flagged but nothing pending");
        Err(error_from_caught(caught, ErrorKind::Runtime, "execute"))
    } else {
        Ok(unsafe { Value::from_raw(ctx.clone(), raw) })
    }
}

/// Egress: engine value → host JSON value, through the engine's own
/// stringifier. `undefined` and values JSON cannot express (functions) export
/// as `null`. Engine values themselves never leave the VM thread.
pub fn export_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<serde_json::Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(serde_json::Value::Null);
    }
    let text = ctx
        .json_stringify(value.clone())
        .catch_as(ctx, ErrorKind::Runtime, "export")?;
    match text {
        None => Ok(serde_json::Value::Null),
        Some(text) => {
            let text = text
                .to_string()
                .map_err(|err| Error::new(ErrorKind::Runtime, err.to_string()))?;
            serde_json::from_str(&text).map_err(|err| {
                Error::new(ErrorKind::Runtime, format!("non-JSON export: {err}"))
            })
        }
    }
}

/// Ingress: host JSON value → engine value, through the engine's parser.
pub fn import_json<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> Result<Value<'js>> {
    let text = serde_json::to_string(value)
        .map_err(|err| Error::new(ErrorKind::Runtime, err.to_string()))?;
    ctx.json_parse(text).catch_as(ctx, ErrorKind::Runtime, "import")
}

/// Build a script-catchable error value out of a structured host error. The
/// value carries `message`, `name` (the kind), the combined stack, and the
/// structured extras so host code that re-catches it can recover the kind.
pub fn error_to_value<'js>(ctx: &Ctx<'js>, err: &Error) -> rquickjs::Result<Value<'js>> {
    let exception = Exception::from_message(ctx.clone(), err.message())?;
    exception.set("name", err.kind().as_str())?;
    let combined = err.combined_stack();
    if !combined.is_empty() {
        exception.set("stack", combined)?;
    }
    if let Some(module) = err.module() {
        exception.set("moduleId", module.as_str())?;
    }
    if let Some(operation) = err.operation() {
        exception.set("operation", operation)?;
    }
    Ok(exception.into_value())
}

/// Throw a structured host error into the current context.
pub fn throw_error(ctx: &Ctx<'_>, err: &Error) -> rquickjs::Error {
    match error_to_value(ctx, err) {
        Ok(value) => ctx.throw(value),
        Err(engine_err) => engine_err,
    }
}

/// Convert a caught engine error into a structured [`Error`]. When the thrown
/// value was one of ours (its `name` names a kind), the original kind and
/// module id survive the round trip; otherwise `fallback` applies.
pub fn error_from_caught(
    caught: CaughtError<'_>,
    fallback: ErrorKind,
    operation: &'static str,
) -> Error {
    match caught {
        CaughtError::Exception(exception) => {
            let message = exception
                .message()
                .unwrap_or_else(|| "unknown error".to_string());
            let kind = exception
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .and_then(|name| ErrorKind::from_name(&name))
                .unwrap_or(fallback);
            let mut err = Error::new(kind, message)
                .with_operation(operation)
                .maybe_script_stack(exception.stack());
            if let Ok(Some(module)) = exception.get::<_, Option<String>>("moduleId") {
                err = err.with_module(crate::resolve::ModuleId::new(module));
            }
            err
        }
        CaughtError::Value(value) => {
            let ctx = value.ctx().clone();
            let rendered = export_value(&ctx, &value)
                .map(|json| json.to_string())
                .unwrap_or_else(|_| format!("{:?}", value.type_of()));
            Error::new(fallback, format!("uncaught value: {rendered}")).with_operation(operation)
        }
        CaughtError::Error(err) => {
            Error::new(fallback, err.to_string()).with_operation(operation)
        }
    }
}

/// Map an engine `Result` into a structured one, catching any pending
/// exception along the way.
pub(crate) trait CatchStructured {
    type Ok;
    fn catch_as(
        self,
        ctx: &Ctx<'_>,
        kind: ErrorKind,
        operation: &'static str,
    ) -> Result<Self::Ok>;
}

impl<T> CatchStructured for rquickjs::Result<T> {
    type Ok = T;
    fn catch_as(self, ctx: &Ctx<'_>, kind: ErrorKind, operation: &'static str) -> Result<T> {
        self.catch(ctx)
            .map_err(|caught| error_from_caught(caught, kind, operation))
    }
}

/// Pin the lifetimes of a host-function closure so the returned value shares
/// the context lifetime. Without this the compiler assumes independent
/// lifetimes and rejects the closure where a `for<'js>` bound is expected.
pub(crate) fn coerce_fn_signature<F, E>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> std::result::Result<Value<'js>, E>,
{
    f
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_engine<R>(f: impl FnOnce(&Engine) -> R) -> R {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        f(&engine)
    }

    #[test]
    fn eval_with_name_labels_stack_frames() {
        with_engine(|engine| {
            engine.with(|ctx| {
                let err = eval_with_name(&ctx, "boom.js", "throw new Error('bad')").unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Runtime);
                assert_eq!(err.message(), "bad");
                assert!(err.script_stack().unwrap_or_default().contains("boom.js"));
            });
        });
    }

    #[test]
    fn eval_returns_completion_value() {
        with_engine(|engine| {
            engine.with(|ctx| {
                let value = eval_with_name(&ctx, "main.js", "const a = 40; a + 2").unwrap();
                let json = export_value(&ctx, &value).unwrap();
                assert_eq!(json, serde_json::json!(42));
            });
        });
    }

    #[test]
    fn json_round_trip() {
        with_engine(|engine| {
            engine.with(|ctx| {
                let json = serde_json::json!({"a": [1, 2, 3], "b": "x"});
                let value = import_json(&ctx, &json).unwrap();
                assert_eq!(export_value(&ctx, &value).unwrap(), json);
            });
        });
    }

    #[test]
    fn undefined_exports_as_null() {
        with_engine(|engine| {
            engine.with(|ctx| {
                let value = eval_with_name(&ctx, "main.js", "void 0").unwrap();
                assert_eq!(export_value(&ctx, &value).unwrap(), serde_json::Value::Null);
            });
        });
    }

    #[test]
    fn structured_error_survives_script_round_trip() {
        with_engine(|engine| {
            engine.with(|ctx| {
                let original = Error::new(ErrorKind::ModuleNotFound, "no such module")
                    .with_module(crate::resolve::ModuleId::new("gode:missing"));
                let value = error_to_value(&ctx, &original).unwrap();
                ctx.globals().set("hostError", value).unwrap();
                let err = eval_with_name(&ctx, "main.js", "throw hostError").unwrap_err();
                assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
                assert_eq!(err.module().unwrap().as_str(), "gode:missing");
            });
        });
    }

    #[test]
    fn eval_timeout_interrupts_runaway_script() {
        let engine = Engine::new(&EngineConfig {
            eval_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .unwrap();
        engine.arm_deadline();
        engine.with(|ctx| {
            let err = eval_with_name(&ctx, "spin.js", "for (;;) {}").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Runtime);
        });
        engine.disarm_deadline();
    }

    #[test]
    fn memory_limit_surfaces_as_runtime_error() {
        let engine = Engine::new(&EngineConfig {
            memory_limit: Some(2 * 1024 * 1024),
            ..Default::default()
        })
        .unwrap();
        engine.with(|ctx| {
            let result = eval_with_name(
                &ctx,
                "hog.js",
                "const xs = []; for (let i = 0; i < 1e9; i++) xs.push('x'.repeat(1024));",
            );
            assert!(result.is_err());
        });
    }
}
