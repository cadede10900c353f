//! The project manifest, consumed as read-only resolver configuration.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};
use crate::fs::ModuleFs;

/// A `package.json`-shaped configuration record.
///
/// The runtime only reads the fields below; everything else in the file is
/// ignored. `imports` is the import map (alias prefix → target specifier),
/// `dependencies` maps bare specifiers to their declared targets (including
/// `file:` targets for local modules and plugins), `registries` maps registry
/// names to base URLs for URL resolution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub imports: HashMap<String, String>,
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    #[serde(default)]
    pub registries: HashMap<String, String>,
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::ModuleLoad, format!("invalid manifest: {err}"))
                .with_operation("manifest")
        })
    }

    pub fn load(fs: &dyn ModuleFs, path: &Path) -> Result<Self> {
        let text = fs.read_to_string(path).map_err(|err| {
            Error::new(
                ErrorKind::ModuleLoad,
                format!("unable to read manifest {}: {err}", path.display()),
            )
            .with_operation("manifest")
        })?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_manifest() {
        let manifest = Manifest::from_json(
            r#"{
                "name": "demo",
                "version": "0.3.0",
                "main": "src/index.js",
                "imports": {"lib": "./src/lib"},
                "dependencies": {"mathplug": "file:./plugins/libmath.so"},
                "registries": {"npm": "https://registry.example.com"}
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.name.as_deref(), Some("demo"));
        assert_eq!(manifest.imports["lib"], "./src/lib");
        assert_eq!(manifest.dependencies["mathplug"], "file:./plugins/libmath.so");
        assert_eq!(manifest.registries["npm"], "https://registry.example.com");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let manifest =
            Manifest::from_json(r#"{"name": "demo", "scripts": {"test": "gode test"}}"#).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("demo"));
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn invalid_manifest_is_module_load() {
        let err = Manifest::from_json("{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleLoad);
    }
}
