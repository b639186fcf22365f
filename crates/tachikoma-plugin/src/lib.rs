//! Plugin System for Tachikoma
//!
//! Out-of-process plugins are independent executables that talk to the host
//! over newline-delimited JSON-RPC 2.0 on their stdin/stdout. Each plugin plays
//! one of three roles:
//! - **Providers**: work-tracking backends that fetch and update work units
//! - **Agents**: AI agents that stream events while running a prompt
//! - **Workflows**: custom phases, guards and effects for the workflow engine
//!
//! ## Plugin Discovery
//!
//! Plugins are discovered from a global and a project directory. A project
//! plugin overrides a global plugin with the same name:
//! ```text
//! ~/.tachikoma/plugins/                 (global)
//! └── jira/plugin.yaml
//! <workspace>/.tachikoma/plugins/       (project)
//! ├── jira/plugin.yaml                  overrides the global one
//! └── reviewer/plugin.yaml
//! ```
//!
//! ## Lifecycle
//!
//! A [`Registry`] discovers manifests, spawns a [`Process`] for every enabled
//! plugin and calls its init method. Loaded plugins are then wrapped in a
//! [`ProviderAdapter`], [`AgentAdapter`] or [`WorkflowAdapter`].

pub mod agent;
pub mod discovery;
pub mod manifest;
pub mod process;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentAdapter, Event, EventType};
pub use discovery::Discovery;
pub use manifest::{Manifest, PluginType, Scope};
pub use process::Process;
pub use protocol::{PluginConfig, RpcError};
pub use provider::{Capability, CapabilitySet, ProviderAdapter, WorkProvider};
pub use registry::{PluginInfo, Registry};
pub use workflow::WorkflowAdapter;

/// Re-exported so callers can cancel plugin calls without a direct dependency.
pub use tokio_util::sync::CancellationToken;

use std::path::PathBuf;

/// Result type for plugin operations
pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors that can occur in the plugin system
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin not found
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// Invalid plugin manifest
    #[error("invalid plugin manifest: {0}")]
    InvalidManifest(String),

    /// Manifest file could not be read
    #[error("failed to read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A plugin directory could not be scanned
    #[error("failed to scan plugin directory {dir}: {source}")]
    Discovery {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executable could not be located
    #[error("plugin {plugin}: executable not found: {executable}")]
    ExecutableNotFound { plugin: String, executable: String },

    /// A relative executable resolved outside the plugin directory
    #[error("plugin {plugin}: executable {executable} escapes the plugin directory")]
    ExecutableEscapesPluginDir { plugin: String, executable: String },

    /// The child process could not be started
    #[error("plugin {plugin}: failed to spawn: {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: std::io::Error,
    },

    /// The init call failed or returned malformed data
    #[error("plugin {plugin}: initialization failed: {source}")]
    Init {
        plugin: String,
        #[source]
        source: Box<PluginError>,
    },

    /// The plugin answered with an error object
    #[error("{method}: {error}")]
    Rpc { method: String, error: RpcError },

    /// The plugin answered with a result that does not match the expected shape
    #[error("{method}: malformed response: {source}")]
    InvalidResponse {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    /// The plugin process exited while a call was in flight
    #[error("plugin {0}: process closed")]
    ProcessExited(String),

    /// The plugin process is shutting down and accepts no new calls
    #[error("plugin {0}: process is stopping")]
    Stopping(String),

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The plugin does not declare the capability needed for an operation
    #[error("plugin {plugin} does not support {capability}")]
    Capability { plugin: String, capability: String },

    /// The plugin reported a domain failure inside a successful response
    #[error("plugin {plugin}: {message}")]
    Plugin { plugin: String, message: String },

    /// An agent run ended with an error event
    #[error("agent run failed: {0}")]
    AgentRun(String),

    /// A run callback aborted the run
    #[error("callback error: {0}")]
    Callback(anyhow::Error),

    /// A workflow effect reported failure
    #[error("effect {name} failed: {message}")]
    EffectFailed { name: String, message: String },

    /// A critical workflow effect failed; the transition must not proceed
    #[error("critical effect {name} failed: {source}")]
    CriticalEffect {
        name: String,
        #[source]
        source: Box<PluginError>,
    },

    /// One or more plugins failed to stop cleanly
    #[error("shutdown errors: {}", format_failures(.0))]
    Shutdown(Vec<(String, PluginError)>),

    /// The host version does not satisfy the manifest's `requires`
    #[error("plugin {plugin} requires host {requirement}, running {host}")]
    IncompatibleHost {
        plugin: String,
        requirement: String,
        host: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Wire-level error code for this error.
    ///
    /// Capability errors map to [`protocol::CAPABILITY_ERROR`]; errors the
    /// plugin sent keep their own code.
    pub fn code(&self) -> i64 {
        match self {
            PluginError::Capability { .. } => protocol::CAPABILITY_ERROR,
            PluginError::Rpc { error, .. } => error.code,
            PluginError::InvalidResponse { .. } => protocol::PARSE_ERROR,
            PluginError::Init { source, .. } | PluginError::CriticalEffect { source, .. } => {
                source.code()
            }
            _ => protocol::PLUGIN_ERROR,
        }
    }

    /// True for local capability refusals, which never reach the process.
    pub fn is_capability_error(&self) -> bool {
        matches!(self, PluginError::Capability { .. })
    }

    /// True for failures of the process transport itself.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            PluginError::Rpc { .. }
                | PluginError::InvalidResponse { .. }
                | PluginError::ProcessExited(_)
                | PluginError::Stopping(_)
                | PluginError::Io(_)
                | PluginError::Json(_)
        )
    }

    pub(crate) fn capability(plugin: impl Into<String>, capability: impl Into<String>) -> Self {
        PluginError::Capability {
            plugin: plugin.into(),
            capability: capability.into(),
        }
    }
}

fn format_failures(failures: &[(String, PluginError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
