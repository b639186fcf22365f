//! Plugin manifest types
//!
//! Defines the structure for plugin.yaml manifest files and the rules a
//! manifest must satisfy before the host will launch it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::protocol::methods;
use crate::{PluginError, Result};

/// Type of plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Work-tracking backend
    Provider,
    /// AI agent
    Agent,
    /// Workflow extension
    Workflow,
}

impl PluginType {
    /// Every known plugin type.
    pub const ALL: [PluginType; 3] = [PluginType::Provider, PluginType::Agent, PluginType::Workflow];

    /// Method called right after the process starts.
    pub fn init_method(self) -> &'static str {
        match self {
            PluginType::Provider => methods::PROVIDER_INIT,
            PluginType::Agent => methods::AGENT_INIT,
            PluginType::Workflow => methods::WORKFLOW_INIT,
        }
    }

    /// Init method for an optional type; untyped plugins get the bare `init`.
    pub fn init_method_for(plugin_type: Option<PluginType>) -> &'static str {
        plugin_type.map_or(methods::INIT, PluginType::init_method)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginType::Provider => "provider",
            PluginType::Agent => "agent",
            PluginType::Workflow => "workflow",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "provider" => Ok(PluginType::Provider),
            "agent" => Ok(PluginType::Agent),
            "workflow" => Ok(PluginType::Workflow),
            other => Err(PluginError::InvalidManifest(format!(
                "invalid plugin type: {other}"
            ))),
        }
    }
}

/// Where a plugin was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// User-wide plugin directory
    Global,
    /// Workspace plugin directory
    Project,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Project => f.write_str("project"),
        }
    }
}

/// How to start the plugin process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutableConfig {
    /// Binary path, absolute or relative to the plugin directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Explicit argument vector; takes precedence over `path`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

/// Provider-specific settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider name used in references (e.g. `jira`)
    pub name: String,

    /// Reference schemes the provider recognizes (e.g. `jira:`)
    pub schemes: Vec<String>,

    /// Ordering hint when several providers match the same input
    pub priority: i32,

    /// Optional operations the provider supports
    pub capabilities: Vec<String>,
}

/// Agent-specific settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent name exposed to the host
    pub name: String,

    /// Whether the agent streams events while running
    pub streaming: bool,

    /// Declared agent capabilities (e.g. `tool_use`)
    pub capabilities: Vec<String>,
}

/// Workflow-specific settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub phases: Vec<PhaseConfig>,
    pub guards: Vec<GuardConfig>,
    pub effects: Vec<EffectConfig>,
}

/// A custom workflow phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub name: String,
    pub description: String,
    /// Phase this one runs after
    #[serde(skip_serializing_if = "String::is_empty")]
    pub after: String,
    /// Phase this one runs before
    #[serde(skip_serializing_if = "String::is_empty")]
    pub before: String,
}

/// A custom workflow guard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub name: String,
    pub description: String,
}

/// A custom workflow effect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectConfig {
    pub name: String,
    pub description: String,
    /// Failure blocks the workflow transition
    pub critical: bool,
}

/// An environment variable the plugin reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvVarSpec {
    pub description: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Plugin manifest (plugin.yaml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    /// Plugin version (semver)
    pub version: String,

    /// Plugin name (unique identifier)
    pub name: String,

    /// Plugin type
    #[serde(
        rename = "type",
        deserialize_with = "deserialize_plugin_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub plugin_type: Option<PluginType>,

    /// Wire protocol version the plugin speaks
    pub protocol: String,

    /// Human-readable description
    pub description: String,

    /// Plugin author
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Plugin homepage/repository
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    /// Semver requirement on the host version (e.g. `>=0.1`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,

    /// How to start the plugin
    pub executable: ExecutableConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowConfig>,

    /// Environment variables the plugin reads
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, EnvVarSpec>,

    /// Directory the manifest was loaded from
    #[serde(skip)]
    pub dir: PathBuf,

    /// Set by discovery
    #[serde(skip)]
    pub scope: Option<Scope>,
}

/// Type-specific block of a validated manifest.
#[derive(Debug, Clone, Copy)]
pub enum TypedConfig<'a> {
    Provider(&'a ProviderConfig),
    Agent(&'a AgentConfig),
    Workflow(&'a WorkflowConfig),
}

impl Manifest {
    /// Read, parse and validate a manifest file.
    ///
    /// The returned manifest's `dir` is the directory containing `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PluginError::ManifestRead {
            path: path.to_path_buf(),
            source,
        })?;

        let mut manifest = Self::parse(&content)?;
        manifest.validate()?;
        manifest.dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(manifest)
    }

    /// Parse manifest YAML without validating it.
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Check the manifest, returning the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PluginError::InvalidManifest(msg.to_string()));

        if self.version.is_empty() {
            return invalid("version is required");
        }
        if self.name.is_empty() {
            return invalid("name is required");
        }
        let Some(plugin_type) = self.plugin_type else {
            return invalid("type is required");
        };
        if self.protocol.is_empty() {
            return invalid("protocol is required");
        }
        if self.executable.path.as_deref().unwrap_or_default().is_empty()
            && self.executable.command.is_empty()
        {
            return invalid("executable.path or executable.command is required");
        }

        match plugin_type {
            PluginType::Provider => {
                let Some(provider) = &self.provider else {
                    return invalid("provider configuration required for provider plugin");
                };
                if provider.name.is_empty() {
                    return invalid("provider.name is required");
                }
                if provider.schemes.is_empty() {
                    return invalid("provider.schemes is required");
                }
            }
            PluginType::Agent => {
                let Some(agent) = &self.agent else {
                    return invalid("agent configuration required for agent plugin");
                };
                if agent.name.is_empty() {
                    return invalid("agent.name is required");
                }
            }
            PluginType::Workflow => {
                if self.workflow.is_none() {
                    return invalid("workflow configuration required for workflow plugin");
                }
            }
        }

        Ok(())
    }

    /// Resolved `executable.path`, joined onto `dir` when relative.
    pub fn executable_path(&self) -> Option<PathBuf> {
        let path = self.executable.path.as_deref().filter(|p| !p.is_empty())?;
        let path = Path::new(path);
        if path.is_absolute() {
            Some(path.to_path_buf())
        } else {
            Some(self.dir.join(path))
        }
    }

    /// Argument vector used to start the plugin.
    pub fn executable_command(&self) -> Vec<String> {
        if !self.executable.command.is_empty() {
            return self.executable.command.clone();
        }
        vec![self
            .executable_path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()]
    }

    /// Whether the manifest declares `name` for its own plugin type.
    pub fn has_capability(&self, name: &str) -> bool {
        let capabilities = match self.typed_config() {
            Some(TypedConfig::Provider(provider)) => &provider.capabilities,
            Some(TypedConfig::Agent(agent)) => &agent.capabilities,
            _ => return false,
        };
        capabilities.iter().any(|c| c == name)
    }

    /// The type-specific block matching `plugin_type`, if present.
    pub fn typed_config(&self) -> Option<TypedConfig<'_>> {
        match self.plugin_type? {
            PluginType::Provider => self.provider.as_ref().map(TypedConfig::Provider),
            PluginType::Agent => self.agent.as_ref().map(TypedConfig::Agent),
            PluginType::Workflow => self.workflow.as_ref().map(TypedConfig::Workflow),
        }
    }

    /// Required environment variables that are unset and have no default.
    pub fn missing_env(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .env
            .iter()
            .filter(|(name, spec)| {
                spec.required && spec.default.is_none() && std::env::var_os(name).is_none()
            })
            .map(|(name, _)| name.clone())
            .collect();
        missing.sort();
        missing
    }

    /// Check `requires` against the running host version.
    pub fn check_host_version(&self, host: &semver::Version) -> Result<()> {
        let Some(requirement) = self.requires.as_deref().filter(|r| !r.is_empty()) else {
            return Ok(());
        };
        let req = semver::VersionReq::parse(requirement).map_err(|e| {
            PluginError::InvalidManifest(format!("requires: {e}"))
        })?;
        if req.matches(host) {
            Ok(())
        } else {
            Err(PluginError::IncompatibleHost {
                plugin: self.name.clone(),
                requirement: requirement.to_string(),
                host: host.to_string(),
            })
        }
    }
}

fn deserialize_plugin_type<'de, D>(deserializer: D) -> std::result::Result<Option<PluginType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid plugin type: {s}"))),
    }
}
