use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use crate::resolve::ModuleId;

/// Classification of every failure the runtime can surface. The script-side
/// `name` of a thrown error equals the kind's display form, which is how host
/// errors keep their kind when they round-trip through script land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// The resolver could not match the specifier.
    #[error("ModuleNotFound")]
    ModuleNotFound,
    /// File read, parse, or load-plan execution failed.
    #[error("ModuleLoad")]
    ModuleLoad,
    /// Script evaluation raised during a module's top level.
    #[error("ModuleEval")]
    ModuleEval,
    /// Opening a shared object failed, or a required symbol was absent.
    #[error("PluginLoad")]
    PluginLoad,
    /// A plugin's initialization returned an error.
    #[error("PluginInit")]
    PluginInit,
    /// A fault captured inside a plugin call, including panics.
    #[error("PluginRuntime")]
    PluginRuntime,
    /// Uncategorized script-side runtime error from the engine.
    #[error("Runtime")]
    Runtime,
    /// Illegal wait on the VM worker thread.
    #[error("Deadlock")]
    Deadlock,
    /// Operation issued against a VM that has been disposed.
    #[error("Disposed")]
    Disposed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModuleNotFound => "ModuleNotFound",
            ErrorKind::ModuleLoad => "ModuleLoad",
            ErrorKind::ModuleEval => "ModuleEval",
            ErrorKind::PluginLoad => "PluginLoad",
            ErrorKind::PluginInit => "PluginInit",
            ErrorKind::PluginRuntime => "PluginRuntime",
            ErrorKind::Runtime => "Runtime",
            ErrorKind::Deadlock => "Deadlock",
            ErrorKind::Disposed => "Disposed",
        }
    }

    /// Inverse of [`ErrorKind::as_str`], used to recover the kind from the
    /// `name` field of a caught script exception.
    pub fn from_name(name: &str) -> Option<ErrorKind> {
        Some(match name {
            "ModuleNotFound" => ErrorKind::ModuleNotFound,
            "ModuleLoad" => ErrorKind::ModuleLoad,
            "ModuleEval" => ErrorKind::ModuleEval,
            "PluginLoad" => ErrorKind::PluginLoad,
            "PluginInit" => ErrorKind::PluginInit,
            "PluginRuntime" => ErrorKind::PluginRuntime,
            "Runtime" => ErrorKind::Runtime,
            "Deadlock" => ErrorKind::Deadlock,
            "Disposed" => ErrorKind::Disposed,
            _ => return None,
        })
    }
}

/// A structured runtime error.
///
/// Carries both sides of the boundary: the script stack when the failure came
/// out of the engine, and a host trace when it was captured host-side (panic
/// barriers, plugin faults). Cloneable so a Failed module record can re-surface
/// the identical error on every subsequent request.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    module: Option<ModuleId>,
    operation: Option<&'static str>,
    script_stack: Option<String>,
    host_trace: Option<String>,
    cause: Option<Arc<Error>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            module: None,
            operation: None,
            script_stack: None,
            host_trace: None,
            cause: None,
        }
    }

    pub fn with_module(mut self, module: ModuleId) -> Self {
        self.module = Some(module);
        self
    }

    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_script_stack(mut self, stack: impl Into<String>) -> Self {
        self.script_stack = Some(stack.into());
        self
    }

    pub fn maybe_script_stack(mut self, stack: Option<String>) -> Self {
        self.script_stack = stack;
        self
    }

    pub fn with_host_trace(mut self, trace: impl Into<String>) -> Self {
        self.host_trace = Some(trace.into());
        self
    }

    /// Record the current host backtrace on the error.
    pub fn with_captured_host_trace(mut self) -> Self {
        self.host_trace = Some(Backtrace::force_capture().to_string());
        self
    }

    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn module(&self) -> Option<&ModuleId> {
        self.module.as_ref()
    }

    pub fn operation(&self) -> Option<&'static str> {
        self.operation
    }

    pub fn script_stack(&self) -> Option<&str> {
        self.script_stack.as_deref()
    }

    pub fn host_trace(&self) -> Option<&str> {
        self.host_trace.as_deref()
    }

    /// Combined stack string: script frames first, host frames after, both in
    /// caller-first order. Empty when neither side was captured.
    pub fn combined_stack(&self) -> String {
        let mut out = String::new();
        if let Some(stack) = &self.script_stack {
            out.push_str(stack.trim_end());
        }
        if let Some(trace) = &self.host_trace {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("  -- host --\n");
            out.push_str(trace.trim_end());
        }
        out
    }

    /// Full rendering for user-visible output: module id, operation tag,
    /// canonical message, combined stack.
    pub fn render(&self) -> String {
        let mut out = format!("{self}");
        let stack = self.combined_stack();
        if !stack.is_empty() {
            out.push('\n');
            out.push_str(&stack);
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(module) = &self.module {
            write!(f, " (module {module})")?;
        }
        if let Some(operation) = self.operation {
            write!(f, " [{operation}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<gode_plugin_api::PluginError> for Error {
    fn from(err: gode_plugin_api::PluginError) -> Self {
        let mut out = Error::new(ErrorKind::PluginRuntime, err.message);
        if let Some(stack) = err.stack {
            out = out.with_script_stack(stack);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            ErrorKind::ModuleNotFound,
            ErrorKind::ModuleLoad,
            ErrorKind::ModuleEval,
            ErrorKind::PluginLoad,
            ErrorKind::PluginInit,
            ErrorKind::PluginRuntime,
            ErrorKind::Runtime,
            ErrorKind::Deadlock,
            ErrorKind::Disposed,
        ] {
            assert_eq!(ErrorKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("TypeError"), None);
    }

    #[test]
    fn combined_stack_orders_script_before_host() {
        let err = Error::new(ErrorKind::PluginRuntime, "boom")
            .with_script_stack("at handler (main.js:3)")
            .with_host_trace("0: plugin_call");
        let stack = err.combined_stack();
        let script = stack.find("main.js").unwrap();
        let host = stack.find("plugin_call").unwrap();
        assert!(script < host);
    }

    #[test]
    fn display_carries_module_and_operation() {
        let err = Error::new(ErrorKind::ModuleLoad, "read failed")
            .with_module(ModuleId::new("/srv/app/util.js"))
            .with_operation("require");
        let text = err.to_string();
        assert!(text.contains("ModuleLoad"));
        assert!(text.contains("/srv/app/util.js"));
        assert!(text.contains("require"));
    }
}
