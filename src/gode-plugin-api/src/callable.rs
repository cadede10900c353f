use crate::host::{Host, PluginPromise};
use crate::{PluginError, PluginValue};

/// Per-position type hint for a plugin parameter. The runtime coerces script
/// arguments toward the hinted kind and substitutes the kind's zero value for
/// missing positional arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    Mapping,
    Sequence,
    Callback,
    /// No coercion; the argument is passed through as-is.
    Dynamic,
}

impl ParamKind {
    /// The value substituted when the script passed fewer arguments than the
    /// callable declares.
    pub fn zero_value(&self) -> PluginValue {
        match self {
            ParamKind::Bool => PluginValue::Bool(false),
            ParamKind::Int => PluginValue::Int(0),
            ParamKind::Float => PluginValue::Float(0.0),
            ParamKind::Str => PluginValue::Str(String::new()),
            ParamKind::Mapping => PluginValue::Mapping(Default::default()),
            ParamKind::Sequence => PluginValue::Sequence(Vec::new()),
            // There is no zero callback; the plugin sees null and must check.
            ParamKind::Callback | ParamKind::Dynamic => PluginValue::Null,
        }
    }
}

/// What a plugin call produced.
#[derive(Debug)]
pub enum PluginReturn {
    /// An immediate value. `Value(PluginValue::Null)` surfaces as `undefined`.
    Value(PluginValue),
    /// A deferred value; the script receives a promise settled through the
    /// matching [`crate::Completer`].
    Promise(PluginPromise),
}

impl PluginReturn {
    pub fn value(value: impl Into<PluginValue>) -> Self {
        PluginReturn::Value(value.into())
    }
}

impl From<PluginValue> for PluginReturn {
    fn from(value: PluginValue) -> Self {
        PluginReturn::Value(value)
    }
}

impl From<i64> for PluginReturn {
    fn from(value: i64) -> Self {
        PluginReturn::Value(PluginValue::Int(value))
    }
}

impl From<f64> for PluginReturn {
    fn from(value: f64) -> Self {
        PluginReturn::Value(PluginValue::Float(value))
    }
}

impl From<bool> for PluginReturn {
    fn from(value: bool) -> Self {
        PluginReturn::Value(PluginValue::Bool(value))
    }
}

impl From<&str> for PluginReturn {
    fn from(value: &str) -> Self {
        PluginReturn::Value(PluginValue::from(value))
    }
}

impl From<String> for PluginReturn {
    fn from(value: String) -> Self {
        PluginReturn::Value(PluginValue::Str(value))
    }
}

impl From<PluginPromise> for PluginReturn {
    fn from(promise: PluginPromise) -> Self {
        PluginReturn::Promise(promise)
    }
}

/// Signature of every plugin entry point. The first argument is the host
/// handle; the slice holds exactly the declared fixed parameters followed by
/// any collected variadic arguments.
pub type PluginFn = fn(&Host, &[PluginValue]) -> Result<PluginReturn, PluginError>;

/// A callable exported by a plugin: the function pointer plus the signature
/// descriptor the bridge uses for arity tolerance and coercion.
#[derive(Debug, Clone)]
pub struct Callable {
    func: PluginFn,
    params: Vec<ParamKind>,
    variadic: Option<ParamKind>,
}

impl Callable {
    pub fn new(func: PluginFn) -> Self {
        Self {
            func,
            params: Vec::new(),
            variadic: None,
        }
    }

    /// Declare the fixed parameters, in position order.
    pub fn params(mut self, params: &[ParamKind]) -> Self {
        self.params = params.to_vec();
        self
    }

    /// Accept any number of trailing arguments of `kind`.
    pub fn variadic(mut self, kind: ParamKind) -> Self {
        self.variadic = Some(kind);
        self
    }

    pub fn fixed_params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn variadic_kind(&self) -> Option<ParamKind> {
        self.variadic
    }

    pub fn invoke(&self, host: &Host, args: &[PluginValue]) -> Result<PluginReturn, PluginError> {
        (self.func)(host, args)
    }
}

/// One exported member of a plugin.
#[derive(Debug, Clone)]
pub enum Export {
    Function(Callable),
    Value(PluginValue),
}

/// The mapping returned from a plugin's `Exports` symbol.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    entries: Vec<(String, Export)>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, name: impl Into<String>, callable: Callable) -> Self {
        self.entries.push((name.into(), Export::Function(callable)));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<PluginValue>) -> Self {
        self.entries.push((name.into(), Export::Value(value.into())));
        self
    }

    pub fn entries(&self) -> &[(String, Export)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(String, Export)> {
        self.entries
    }
}

/// A plugin linked into the host process and registered at startup instead of
/// being opened from a shared object. Identity is preserved through a
/// synthetic `plugin:<key>` id.
#[derive(Clone)]
pub struct StaticPlugin {
    pub name: &'static str,
    pub version: &'static str,
    pub exports: fn() -> ExportTable,
    pub init: Option<fn(Host) -> Result<(), PluginError>>,
    pub dispose: Option<fn() -> Result<(), PluginError>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(_host: &Host, args: &[PluginValue]) -> Result<PluginReturn, PluginError> {
        Ok(PluginReturn::Value(
            args.first().cloned().unwrap_or(PluginValue::Null),
        ))
    }

    #[test]
    fn zero_values() {
        assert_eq!(ParamKind::Int.zero_value(), PluginValue::Int(0));
        assert_eq!(ParamKind::Str.zero_value(), PluginValue::Str(String::new()));
        assert_eq!(
            ParamKind::Sequence.zero_value(),
            PluginValue::Sequence(Vec::new())
        );
        assert_eq!(ParamKind::Callback.zero_value(), PluginValue::Null);
    }

    #[test]
    fn export_table_preserves_order() {
        let table = ExportTable::new()
            .function("echo", Callable::new(echo).params(&[ParamKind::Dynamic]))
            .value("answer", 42i64);
        let names: Vec<_> = table.entries().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["echo", "answer"]);
    }
}
