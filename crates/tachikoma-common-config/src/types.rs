//! Configuration types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TachikomaConfig {
    /// Plugin configuration.
    pub plugins: PluginsConfig,
}

/// Plugin settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugins to load at startup, by name.
    pub enabled: Vec<String>,
    /// Per-plugin configuration sent with the init call.
    pub config: HashMap<String, Map<String, Value>>,
    /// Override for `~/.tachikoma/plugins`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_dir: Option<PathBuf>,
    /// Override for `<project>/.tachikoma/plugins`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<PathBuf>,
}

impl PluginsConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|n| n == name)
    }

    /// Configuration for one plugin, empty if none is set.
    pub fn config_for(&self, name: &str) -> Map<String, Value> {
        self.config.get(name).cloned().unwrap_or_default()
    }
}
