//! Shared types for native gode plugins.
//!
//! A plugin is a shared library that exposes a small, fixed symbol set:
//! `Exports` (required), plus optional `Name`, `Version`, `Initialize`,
//! `Dispose` and `ApiVersion`. The [`export_plugin!`] macro generates all of
//! them from plain Rust functions. The runtime probes these symbols with the
//! platform dynamic loader, wraps every declared [`Callable`] as a JavaScript
//! function, and hands each invocation the [`Host`] handle so plugin code can
//! call back into the VM or surface deferred results as promises.
//!
//! Everything in this crate is engine-agnostic: values cross the boundary as
//! [`PluginValue`]s and faults as [`PluginError`]s.

mod callable;
mod host;
mod value;

pub use callable::{Callable, Export, ExportTable, ParamKind, PluginFn, PluginReturn, StaticPlugin};
pub use host::{Callback, CallbackDone, CallbackWait, Completer, Host, HostContext, PluginPromise};
pub use value::PluginValue;

/// Version of the plugin ABI. Bumped on any breaking change to the types in
/// this crate. The runtime refuses to load a plugin whose `ApiVersion` symbol
/// reports a different value.
pub const API_VERSION: u32 = 1;

/// A fault produced by plugin code, or captured on its behalf by the runtime's
/// panic barrier.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    /// Human readable description of the fault.
    pub message: String,
    /// Stack of the faulting side, when one was captured. For script-side
    /// faults delivered through a callback this is the script stack; for
    /// captured panics it is the host trace.
    pub stack: Option<String>,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for PluginError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Declare the exported symbol set of a plugin cdylib.
///
/// ```ignore
/// use gode_plugin_api::{
///     export_plugin, Callable, ExportTable, Host, ParamKind, PluginError, PluginReturn,
///     PluginValue,
/// };
///
/// fn add(_host: &Host, args: &[PluginValue]) -> Result<PluginReturn, PluginError> {
///     let a = args[0].as_i64().unwrap_or(0);
///     let b = args[1].as_i64().unwrap_or(0);
///     Ok(PluginReturn::from(a + b))
/// }
///
/// fn exports() -> ExportTable {
///     ExportTable::new()
///         .function("add", Callable::new(add).params(&[ParamKind::Int, ParamKind::Int]))
/// }
///
/// export_plugin! {
///     name: "adder",
///     version: "1.0.0",
///     exports: exports,
/// }
/// ```
#[macro_export]
macro_rules! export_plugin {
    (
        name: $name:expr,
        version: $version:expr,
        exports: $exports:expr
        $(, init: $init:expr)?
        $(, dispose: $dispose:expr)?
        $(,)?
    ) => {
        #[unsafe(no_mangle)]
        #[allow(non_snake_case)]
        pub extern "Rust" fn ApiVersion() -> u32 {
            $crate::API_VERSION
        }

        #[unsafe(no_mangle)]
        #[allow(non_snake_case)]
        pub extern "Rust" fn Name() -> ::std::string::String {
            ::std::string::String::from($name)
        }

        #[unsafe(no_mangle)]
        #[allow(non_snake_case)]
        pub extern "Rust" fn Version() -> ::std::string::String {
            ::std::string::String::from($version)
        }

        #[unsafe(no_mangle)]
        #[allow(non_snake_case)]
        pub extern "Rust" fn Exports() -> $crate::ExportTable {
            ($exports)()
        }

        $(
            #[unsafe(no_mangle)]
            #[allow(non_snake_case)]
            pub extern "Rust" fn Initialize(
                host: $crate::Host,
            ) -> ::std::result::Result<(), $crate::PluginError> {
                ($init)(host)
            }
        )?

        $(
            #[unsafe(no_mangle)]
            #[allow(non_snake_case)]
            pub extern "Rust" fn Dispose() -> ::std::result::Result<(), $crate::PluginError> {
                ($dispose)()
            }
        )?
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    mod declared {
        use crate::{export_plugin, ExportTable, Host, PluginError};

        fn exports() -> ExportTable {
            ExportTable::new().value("ready", true)
        }

        fn init(_host: Host) -> Result<(), PluginError> {
            Ok(())
        }

        export_plugin! {
            name: "test-plugin",
            version: "0.0.1",
            exports: exports,
            init: init,
        }
    }

    #[test]
    fn export_plugin_generates_the_symbol_set() {
        assert_eq!(declared::ApiVersion(), API_VERSION);
        assert_eq!(declared::Name(), "test-plugin");
        assert_eq!(declared::Version(), "0.0.1");
        let table = declared::Exports();
        assert_eq!(table.entries().len(), 1);
    }

    #[test]
    fn plugin_error_from_str() {
        let err = PluginError::from("boom");
        assert_eq!(err.message, "boom");
        assert!(err.stack.is_none());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn plugin_error_keeps_stack() {
        let err = PluginError::new("boom").with_stack("at foo (a.js:1)");
        assert_eq!(err.stack.as_deref(), Some("at foo (a.js:1)"));
    }
}
