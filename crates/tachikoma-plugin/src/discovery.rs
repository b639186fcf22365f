//! Plugin discovery
//!
//! Scans the global and project plugin directories for `<name>/plugin.yaml`.
//! Project plugins override global plugins with the same name.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{Manifest, PluginError, PluginType, Result, Scope};

/// Manifest file expected inside every plugin directory.
pub const MANIFEST_FILE_NAME: &str = "plugin.yaml";

const APP_DIR: &str = ".tachikoma";
const PLUGINS_DIR: &str = "plugins";

/// `~/.tachikoma/plugins`
pub fn default_global_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR).join(PLUGINS_DIR))
        .ok_or_else(|| {
            PluginError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })
}

/// `<root>/.tachikoma/plugins`
pub fn default_project_dir(root: &Path) -> PathBuf {
    root.join(APP_DIR).join(PLUGINS_DIR)
}

/// Finds plugin manifests in the global and project directories.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    global_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
}

impl Discovery {
    /// Create a discovery over the given directories; `None` skips that scope.
    pub fn new(global_dir: Option<PathBuf>, project_dir: Option<PathBuf>) -> Self {
        Self {
            global_dir,
            project_dir,
        }
    }

    /// Discovery over the default directories for a workspace root.
    ///
    /// A missing home directory only disables the global scope.
    pub fn for_workspace(root: &Path) -> Self {
        let global_dir = match default_global_dir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                warn!(error = %e, "global plugin directory unavailable");
                None
            }
        };
        Self::new(global_dir, Some(default_project_dir(root)))
    }

    pub fn global_dir(&self) -> Option<&Path> {
        self.global_dir.as_deref()
    }

    pub fn project_dir(&self) -> Option<&Path> {
        self.project_dir.as_deref()
    }

    /// Directory for a scope, if configured.
    pub fn dir_for(&self, scope: Scope) -> Option<&Path> {
        match scope {
            Scope::Global => self.global_dir(),
            Scope::Project => self.project_dir(),
        }
    }

    /// All valid manifests keyed by name.
    ///
    /// The global directory is scanned first, so a project plugin replaces a
    /// global plugin with the same name.
    pub fn discover(&self) -> Result<HashMap<String, Manifest>> {
        let mut manifests = HashMap::new();

        let scopes = [
            (self.global_dir.as_deref(), Scope::Global),
            (self.project_dir.as_deref(), Scope::Project),
        ];
        for (dir, scope) in scopes {
            if let Some(dir) = dir {
                scan_dir(dir, scope, &mut manifests)?;
            }
        }

        Ok(manifests)
    }

    /// Manifests of one plugin type.
    pub fn discover_by_type(&self, plugin_type: PluginType) -> Result<Vec<Manifest>> {
        let mut manifests: Vec<Manifest> = self
            .discover()?
            .into_values()
            .filter(|m| m.plugin_type == Some(plugin_type))
            .collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(manifests)
    }

    /// The effective manifest for `name`.
    pub fn discover_by_name(&self, name: &str) -> Result<Option<Manifest>> {
        Ok(self.discover()?.remove(name))
    }

    /// Every manifest file under the configured directories, including
    /// ones that fail to parse and ones shadowed by a project override.
    pub fn manifest_files(&self) -> Result<Vec<(Scope, PathBuf)>> {
        let mut files = Vec::new();
        for scope in [Scope::Global, Scope::Project] {
            if let Some(dir) = self.dir_for(scope) {
                files.extend(manifest_files_in(dir)?.into_iter().map(|path| (scope, path)));
            }
        }
        Ok(files)
    }
}

fn scan_dir(dir: &Path, scope: Scope, manifests: &mut HashMap<String, Manifest>) -> Result<()> {
    for manifest_path in manifest_files_in(dir)? {
        match Manifest::load(&manifest_path) {
            Ok(mut manifest) => {
                manifest.scope = Some(scope);
                debug!(plugin = %manifest.name, %scope, "discovered plugin");
                manifests.insert(manifest.name.clone(), manifest);
            }
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "skipping invalid plugin manifest");
            }
        }
    }

    Ok(())
}

/// `<dir>/<name>/plugin.yaml` files, sorted. A missing `dir` has none.
fn manifest_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "plugin directory does not exist");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(PluginError::Discovery {
                dir: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PluginError::Discovery {
            dir: dir.to_path_buf(),
            source,
        })?;
        let manifest_path = entry.path().join(MANIFEST_FILE_NAME);
        if entry.path().is_dir() && manifest_path.is_file() {
            files.push(manifest_path);
        }
    }
    files.sort();
    Ok(files)
}

/// Create a plugin base directory if it does not exist.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Directory holding the plugin `name` under `base`.
pub fn plugin_dir(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}

/// Target directory for installing `name` under `base`.
///
/// Rejects names that would leave `base`.
pub fn install_path(base: &Path, name: &str) -> Result<PathBuf> {
    let is_plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\']);
    if !is_plain {
        return Err(PluginError::InvalidManifest(format!(
            "plugin name {name:?} is not a valid directory name"
        )));
    }
    Ok(plugin_dir(base, name))
}
