//! The filesystem collaborator consumed by the resolver and loader.
//!
//! The runtime never touches `std::fs` directly; everything goes through
//! [`ModuleFs`] so embedders can substitute a closed module set (see
//! [`MemoryFileSystem`]) or instrument access.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Minimal metadata the resolver needs for probing.
#[derive(Debug, Clone, Copy)]
pub struct FileMetadata {
    pub is_file: bool,
    pub is_dir: bool,
}

pub trait ModuleFs: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn metadata(&self, path: &Path) -> io::Result<FileMetadata>;

    /// Canonical form of `path`: symlinks resolved where the backing store has
    /// them, `.`/`..` segments removed. Identical specifiers must keep
    /// producing identical module ids, and that hinges on this.
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    fn is_file(&self, path: &Path) -> bool {
        self.metadata(path).map(|m| m.is_file).unwrap_or(false)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.metadata(path).map(|m| m.is_dir).unwrap_or(false)
    }
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl ModuleFs for OsFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
        let meta = std::fs::metadata(path)?;
        Ok(FileMetadata {
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
        })
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }
}

/// An in-memory filesystem with a fixed set of files.
///
/// Directories are implied by prefixes: registering `galaxy/index.js` makes
/// `galaxy` a directory. Paths are normalized on every lookup so `./a.js`,
/// `a.js` and `/a.js` all address the same entry.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: HashMap<String, String>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.add(path, content);
        self
    }

    pub fn add(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(normalize(Path::new(&path.into())), content.into());
    }

    fn is_directory(&self, normalized: &str) -> bool {
        if normalized.is_empty() {
            return !self.files.is_empty();
        }
        let prefix = format!("{normalized}/");
        self.files.keys().any(|key| key.starts_with(&prefix))
    }
}

/// Lexical normalization: forward slashes, no leading `./` or `/`, `..`
/// segments collapsed.
fn normalize(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().replace('\\', "/")),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

impl ModuleFs for MemoryFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let normalized = normalize(path);
        self.files.get(&normalized).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("module '{normalized}' not found"),
            )
        })
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
        let normalized = normalize(path);
        let is_file = self.files.contains_key(&normalized);
        let is_dir = self.is_directory(&normalized);
        if !is_file && !is_dir {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("path '{normalized}' not found"),
            ));
        }
        Ok(FileMetadata { is_file, is_dir })
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        Ok(PathBuf::from(format!("/{}", normalize(path))))
    }
}
