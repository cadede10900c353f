//! Priority resolution of `(specifier, referrer)` pairs to load plans.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};
use crate::fs::ModuleFs;
use crate::manifest::Manifest;

/// Canonical module key. Two specifiers naming the same artifact canonicalize
/// to the same id, which is what lets the registry deduplicate.
///
/// Forms: `gode:<name>` for builtins, `plugin:<key>` for statically registered
/// plugins, an absolute (canonical) filesystem path, an absolute URL, or a
/// virtual module name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn builtin(name: &str) -> Self {
        Self(format!("gode:{name}"))
    }

    pub fn static_plugin(key: &str) -> Self {
        Self(format!("plugin:{key}"))
    }

    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory against which relative specifiers from this module resolve.
    /// Non-path ids (builtins, virtuals, URLs) anchor at the resolver root.
    pub fn directory(&self, root: &Path) -> PathBuf {
        let path = Path::new(&self.0);
        if path.is_absolute() {
            path.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf())
        } else {
            root.to_path_buf()
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform extension for native plugin libraries.
#[cfg(target_os = "windows")]
pub const PLUGIN_EXT: &str = "dll";
#[cfg(target_os = "macos")]
pub const PLUGIN_EXT: &str = "dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const PLUGIN_EXT: &str = "so";

/// Source extensions probed in order, before the plugin extension.
const SOURCE_EXTS: [&str; 3] = ["js", "ts", "json"];

/// Bound on import-map alias rewrites for a single resolution.
pub const ALIAS_DEPTH_LIMIT: usize = 8;

/// Where a plugin comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// A shared object on disk, identified by its canonical path.
    Dylib(PathBuf),
    /// A statically registered plugin table, identified by its key.
    Static(String),
}

/// Resolver output: how to load a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPlan {
    Builtin(String),
    File { path: PathBuf, ext: String },
    Plugin(PluginSource),
    Url(String),
    Virtual(String),
}

impl LoadPlan {
    pub fn id(&self) -> ModuleId {
        match self {
            LoadPlan::Builtin(name) => ModuleId::builtin(name),
            LoadPlan::File { path, .. } => ModuleId::from_path(path),
            LoadPlan::Plugin(PluginSource::Dylib(path)) => ModuleId::from_path(path),
            LoadPlan::Plugin(PluginSource::Static(key)) => ModuleId::static_plugin(key),
            LoadPlan::Url(url) => ModuleId::new(url.clone()),
            LoadPlan::Virtual(name) => ModuleId::new(name.clone()),
        }
    }
}

/// Static resolver configuration, extracted from the manifest.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Anchor for alias targets, `file:` dependency targets, and top-level
    /// specifiers: the manifest's directory (or the working directory).
    pub root: PathBuf,
    pub imports: HashMap<String, String>,
    pub dependencies: HashMap<String, String>,
    pub registries: HashMap<String, String>,
}

impl ResolverConfig {
    pub fn empty(root: PathBuf) -> Self {
        Self {
            root,
            imports: HashMap::new(),
            dependencies: HashMap::new(),
            registries: HashMap::new(),
        }
    }

    pub fn from_manifest(manifest: &Manifest, root: PathBuf) -> Self {
        Self {
            root,
            imports: manifest.imports.clone(),
            dependencies: manifest.dependencies.clone(),
            registries: manifest.registries.clone(),
        }
    }
}

/// One resolution pass. Borrowed views over the pieces of runtime state the
/// priority chain consults.
pub struct Resolution<'a> {
    pub config: &'a ResolverConfig,
    pub fs: &'a dyn ModuleFs,
    /// Registered builtin names (without the `gode:` prefix).
    pub builtins: &'a dyn Fn(&str) -> bool,
    /// Registered static plugin keys.
    pub statics: &'a dyn Fn(&str) -> bool,
    /// Registered virtual module names.
    pub virtuals: &'a dyn Fn(&str) -> bool,
}

impl Resolution<'_> {
    /// Map a specifier to a load plan. Priority order: import-map alias,
    /// reserved schemes (`gode:`, `plugin:`), virtual modules, manifest
    /// dependencies, relative/absolute paths, registries and URLs.
    pub fn resolve(&self, specifier: &str, referrer_dir: &Path) -> Result<LoadPlan> {
        let mut spec = specifier.to_string();
        let mut base = referrer_dir.to_path_buf();

        for _ in 0..=ALIAS_DEPTH_LIMIT {
            // 1. Import-map alias: rewrite and restart, anchored at the root
            // (not the referrer) so aliases cannot recurse through referrers.
            if let Some((alias, target)) = self.alias_match(&spec) {
                let rest = &spec[alias.len()..];
                spec = format!("{target}{rest}");
                base = self.config.root.clone();
                continue;
            }

            // 2. Reserved schemes do not fall through on a miss.
            if let Some(name) = spec.strip_prefix("gode:") {
                if (self.builtins)(name) {
                    return Ok(LoadPlan::Builtin(name.to_string()));
                }
                return Err(not_found(format!("no builtin module '{spec}'")));
            }
            if let Some(key) = spec.strip_prefix("plugin:") {
                if (self.statics)(key) {
                    return Ok(LoadPlan::Plugin(PluginSource::Static(key.to_string())));
                }
                return Err(not_found(format!("no registered plugin '{spec}'")));
            }

            // 3. Virtual modules match their registered name exactly.
            if (self.virtuals)(&spec) {
                return Ok(LoadPlan::Virtual(spec));
            }

            // 4. Manifest dependency for bare specifiers.
            if is_bare(&spec) {
                if let Some(target) = self.config.dependencies.get(&spec) {
                    if let Some(rest) = target.strip_prefix("file:") {
                        return self.resolve_path(&self.config.root.join(rest), true);
                    }
                    spec = target.clone();
                    base = self.config.root.clone();
                    continue;
                }
            }

            // 5. Relative and absolute paths.
            if spec.starts_with("./") || spec.starts_with("../") {
                return self.resolve_path(&base.join(&spec), true);
            }
            if Path::new(&spec).is_absolute() {
                return self.resolve_path(Path::new(&spec), true);
            }

            // 6. URLs, including registry-name expansion.
            if spec.starts_with("http://") || spec.starts_with("https://") {
                return Ok(LoadPlan::Url(spec));
            }
            if let Some((registry, rest)) = spec.split_once(':') {
                if let Some(url) = self.config.registries.get(registry) {
                    return Ok(LoadPlan::Url(format!(
                        "{}/{}",
                        url.trim_end_matches('/'),
                        rest
                    )));
                }
            }

            return Err(not_found(format!("cannot resolve module '{spec}'")));
        }

        Err(not_found(format!(
            "alias expansion for '{specifier}' exceeded {ALIAS_DEPTH_LIMIT} rewrites"
        )))
    }

    /// Longest-prefix alias match: either the whole specifier equals a key, or
    /// the key is followed by a `/` path segment.
    fn alias_match(&self, spec: &str) -> Option<(String, String)> {
        self.config
            .imports
            .iter()
            .filter(|(alias, _)| {
                spec == alias.as_str() || spec.starts_with(&format!("{alias}/"))
            })
            .max_by_key(|(alias, _)| alias.len())
            .map(|(alias, target)| (alias.clone(), target.clone()))
    }

    /// Filesystem resolution of a base candidate: exact file, then extension
    /// probing, then directory handling (`index.*`, then a nested manifest's
    /// `main`). Probing is not recursive; the first extension match wins.
    fn resolve_path(&self, candidate: &Path, follow_main: bool) -> Result<LoadPlan> {
        if self.fs.is_file(candidate) {
            return self.finish_file(candidate);
        }

        for ext in SOURCE_EXTS.iter().chain(std::iter::once(&PLUGIN_EXT)) {
            let probed = append_extension(candidate, ext);
            if self.fs.is_file(&probed) {
                return self.finish_file(&probed);
            }
        }

        if self.fs.is_dir(candidate) {
            for ext in SOURCE_EXTS.iter().chain(std::iter::once(&PLUGIN_EXT)) {
                let index = candidate.join(format!("index.{ext}"));
                if self.fs.is_file(&index) {
                    return self.finish_file(&index);
                }
            }
            if follow_main {
                if let Ok(manifest) = Manifest::load(self.fs, &candidate.join("package.json")) {
                    if let Some(main) = manifest.main {
                        return self.resolve_path(&candidate.join(main), false);
                    }
                }
            }
        }

        Err(not_found(format!(
            "no module at '{}'",
            candidate.display()
        )))
    }

    fn finish_file(&self, path: &Path) -> Result<LoadPlan> {
        let canonical = self.fs.canonicalize(path).map_err(|err| {
            Error::new(
                ErrorKind::ModuleNotFound,
                format!("cannot canonicalize '{}': {err}", path.display()),
            )
            .with_operation("resolve")
        })?;
        let ext = canonical
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        if ext == PLUGIN_EXT {
            Ok(LoadPlan::Plugin(PluginSource::Dylib(canonical)))
        } else {
            Ok(LoadPlan::File {
                path: canonical,
                ext,
            })
        }
    }
}

fn not_found(message: String) -> Error {
    Error::new(ErrorKind::ModuleNotFound, message).with_operation("resolve")
}

fn is_bare(spec: &str) -> bool {
    !spec.starts_with("./")
        && !spec.starts_with("../")
        && !Path::new(spec).is_absolute()
        && !spec.contains(':')
}

/// `foo.bar` + `js` → `foo.bar.js` (unlike `Path::set_extension`, which would
/// replace `.bar`).
fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}
