use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{Error, ErrorKind, Result};

/// An immutable script with metadata about its source location. The base path
/// anchors resolution of relative imports made from the script.
#[derive(Debug, Clone)]
pub struct Script {
    content: Arc<str>,
    name: String,
    base_path: Option<PathBuf>,
}

impl Script {
    /// Create a script from a string with no base path for module resolution.
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: Arc::from(content.into()),
            name: "script.js".to_string(),
            base_path: None,
        }
    }

    /// Create a script by reading from a file. The name is the file path and
    /// the base path is the containing directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::new(
                ErrorKind::ModuleLoad,
                format!("failed to read script from '{}': {err}", path.display()),
            )
        })?;
        Ok(Self {
            content: Arc::from(content),
            name: path.to_string_lossy().into_owned(),
            base_path: path.parent().map(Path::to_path_buf),
        })
    }

    /// Set the logical name surfaced in stack traces.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set a virtual base path for module resolution.
    pub fn with_virtual_base(mut self, path: impl AsRef<str>) -> Self {
        self.base_path = Some(PathBuf::from(path.as_ref()));
        self
    }

    /// The script source.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The logical name surfaced in stack traces.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The base path for module resolution, if any.
    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }
}

impl From<String> for Script {
    fn from(content: String) -> Self {
        Self::from_content(content)
    }
}

impl From<&str> for Script {
    fn from(content: &str) -> Self {
        Self::from_content(content)
    }
}

impl TryFrom<&Path> for Script {
    type Error = Error;
    fn try_from(path: &Path) -> Result<Self> {
        Self::from_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_content_has_no_base() {
        let script = Script::from_content("1 + 1");
        assert_eq!(script.content(), "1 + 1");
        assert!(script.base_path().is_none());
    }

    #[test]
    fn virtual_base_overrides() {
        let script = Script::from_content("1").with_virtual_base("/srv/app");
        assert_eq!(script.base_path(), Some(Path::new("/srv/app")));
    }
}
