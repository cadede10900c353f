use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::Serialize;

use crate::host::Callback;
use crate::PluginError;

/// A value crossing the plugin boundary.
///
/// The shape mirrors JSON with two additions: integers are kept apart from
/// floats (plugin signatures routinely want exact integers), and script
/// functions travel as [`Callback`] handles that route back through the VM's
/// work queue when invoked.
#[derive(Debug, Clone)]
pub enum PluginValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Sequence(Vec<PluginValue>),
    Mapping(BTreeMap<String, PluginValue>),
    Callback(Callback),
}

impl PluginValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PluginValue::Null => "null",
            PluginValue::Bool(_) => "bool",
            PluginValue::Int(_) => "int",
            PluginValue::Float(_) => "float",
            PluginValue::Str(_) => "string",
            PluginValue::Sequence(_) => "sequence",
            PluginValue::Mapping(_) => "mapping",
            PluginValue::Callback(_) => "callback",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PluginValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PluginValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view. Floats with an integral value convert losslessly.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PluginValue::Int(n) => Some(*n),
            PluginValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PluginValue::Int(n) => Some(*n as f64),
            PluginValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PluginValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[PluginValue]> {
        match self {
            PluginValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, PluginValue>> {
        match self {
            PluginValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            PluginValue::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    /// Convert to a JSON value. Callbacks have no JSON representation and
    /// produce an error.
    pub fn to_json(&self) -> Result<serde_json::Value, PluginError> {
        Ok(match self {
            PluginValue::Null => serde_json::Value::Null,
            PluginValue::Bool(b) => serde_json::Value::Bool(*b),
            PluginValue::Int(n) => serde_json::Value::from(*n),
            PluginValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PluginValue::Str(s) => serde_json::Value::String(s.clone()),
            PluginValue::Sequence(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(PluginValue::to_json)
                    .collect::<Result<_, _>>()?,
            ),
            PluginValue::Mapping(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_, PluginError>>()?,
            ),
            PluginValue::Callback(_) => {
                return Err(PluginError::new("a callback cannot be converted to JSON"));
            }
        })
    }
}

impl From<serde_json::Value> for PluginValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PluginValue::Null,
            serde_json::Value::Bool(b) => PluginValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PluginValue::Int(i)
                } else {
                    PluginValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => PluginValue::Str(s),
            serde_json::Value::Array(items) => {
                PluginValue::Sequence(items.into_iter().map(PluginValue::from).collect())
            }
            serde_json::Value::Object(map) => PluginValue::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, PluginValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for PluginValue {
    fn from(v: bool) -> Self {
        PluginValue::Bool(v)
    }
}

impl From<i64> for PluginValue {
    fn from(v: i64) -> Self {
        PluginValue::Int(v)
    }
}

impl From<i32> for PluginValue {
    fn from(v: i32) -> Self {
        PluginValue::Int(v as i64)
    }
}

impl From<f64> for PluginValue {
    fn from(v: f64) -> Self {
        PluginValue::Float(v)
    }
}

impl From<&str> for PluginValue {
    fn from(v: &str) -> Self {
        PluginValue::Str(v.to_string())
    }
}

impl From<String> for PluginValue {
    fn from(v: String) -> Self {
        PluginValue::Str(v)
    }
}

impl<T: Into<PluginValue>> From<Vec<T>> for PluginValue {
    fn from(items: Vec<T>) -> Self {
        PluginValue::Sequence(items.into_iter().map(Into::into).collect())
    }
}

impl PartialEq for PluginValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PluginValue::Null, PluginValue::Null) => true,
            (PluginValue::Bool(a), PluginValue::Bool(b)) => a == b,
            (PluginValue::Int(a), PluginValue::Int(b)) => a == b,
            (PluginValue::Float(a), PluginValue::Float(b)) => a == b,
            (PluginValue::Str(a), PluginValue::Str(b)) => a == b,
            (PluginValue::Sequence(a), PluginValue::Sequence(b)) => a == b,
            (PluginValue::Mapping(a), PluginValue::Mapping(b)) => a == b,
            (PluginValue::Callback(a), PluginValue::Callback(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl Serialize for PluginValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PluginValue::Null => serializer.serialize_unit(),
            PluginValue::Bool(b) => serializer.serialize_bool(*b),
            PluginValue::Int(n) => serializer.serialize_i64(*n),
            PluginValue::Float(f) => serializer.serialize_f64(*f),
            PluginValue::Str(s) => serializer.serialize_str(s),
            PluginValue::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            PluginValue::Mapping(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            // Callbacks are opaque on the wire.
            PluginValue::Callback(_) => serializer.serialize_unit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": 1, "b": [true, "x", 1.5], "c": null}"#).unwrap();
        let value = PluginValue::from(json.clone());
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn integers_stay_integers() {
        let value = PluginValue::from(serde_json::json!(7));
        assert_eq!(value, PluginValue::Int(7));
        assert_eq!(value.as_f64(), Some(7.0));
    }

    #[test]
    fn integral_float_converts_to_int() {
        assert_eq!(PluginValue::Float(3.0).as_i64(), Some(3));
        assert_eq!(PluginValue::Float(3.5).as_i64(), None);
    }
}
