//! CLI error handling.
//!
//! Every failure maps to an exit status and, where the user can do something
//! about it, a hint naming the `tachikoma plugins` step that helps.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use tachikoma_plugin::PluginError;
use thiserror::Error;

/// Shown for failures whose details only appear in the plugin's stderr.
const STDERR_HINT: &str = "Run `tachikoma -vv plugins check <name>` to see the plugin's stderr";

#[derive(Debug, Error)]
pub enum CliError {
    /// Host configuration could not be used
    #[error("{message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        hint: Option<String>,
    },

    #[error("{message}{}", .path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
    Io {
        message: String,
        #[source]
        source: io::Error,
        path: Option<PathBuf>,
    },

    /// One or more manifests or install sources were rejected
    #[error("{message}")]
    Validation { message: String },

    /// No discovered plugin has this name
    #[error("plugin not found: {name}")]
    UnknownPlugin {
        name: String,
        /// Discovered names close to `name`
        suggestions: Vec<String>,
    },

    /// `git` failed while fetching a plugin
    #[error("{message}")]
    Git { message: String },

    #[error("{0}")]
    Plugin(#[from] PluginError),

    /// The request conflicts with what is installed
    #[error("{message}")]
    User {
        message: String,
        hint: Option<String>,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Process exit status; one value per failure category.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(match self {
            Self::User { .. } | Self::Other(_) => 1,
            Self::Config { .. } => 2,
            Self::Io { .. } => 3,
            Self::Validation { .. } => 5,
            Self::UnknownPlugin { .. } => 6,
            Self::Git { .. } => 8,
            Self::Plugin(_) => 9,
        })
    }

    /// What the user can try next, if anything.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { hint, .. } | Self::User { hint, .. } => hint.as_deref(),
            Self::UnknownPlugin { .. } => Some("Run `tachikoma plugins list` to see discovered plugins"),
            Self::Git { .. } => Some("Check the repository URL and that git is on PATH"),
            Self::Plugin(err) => plugin_hint(err),
            Self::Io { .. } | Self::Validation { .. } | Self::Other(_) => None,
        }
    }

    /// Plugin names close to the one the user asked for.
    pub fn suggestions(&self) -> &[String] {
        match self {
            Self::UnknownPlugin { suggestions, .. } => suggestions,
            _ => &[],
        }
    }

    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
            path: None,
        }
    }

    pub fn io_with_path(message: impl Into<String>, source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            message: message.into(),
            source,
            path: Some(path.into()),
        }
    }

    pub fn unknown_plugin(name: impl Into<String>, suggestions: Vec<String>) -> Self {
        Self::UnknownPlugin {
            name: name.into(),
            suggestions,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn user_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }
}

fn plugin_hint(err: &PluginError) -> Option<&'static str> {
    match err {
        PluginError::NotFound(_) => Some("Run `tachikoma plugins list` to see discovered plugins"),
        PluginError::InvalidManifest(_) | PluginError::ManifestRead { .. } => {
            Some("Run `tachikoma plugins validate` to see every manifest problem")
        }
        PluginError::ExecutableNotFound { .. } => {
            Some("Check `executable` in plugin.yaml or install the binary on PATH")
        }
        PluginError::ExecutableEscapesPluginDir { .. } => {
            Some("Relative executables must stay inside the plugin directory")
        }
        PluginError::IncompatibleHost { .. } => {
            Some("Upgrade tachikoma or install a plugin release built for this host")
        }
        PluginError::Capability { .. } => {
            Some("The plugin does not declare this capability; see `tachikoma plugins info <name>`")
        }
        PluginError::Init { source, .. } => plugin_hint(source).or(Some(STDERR_HINT)),
        PluginError::Spawn { .. } | PluginError::ProcessExited(_) => Some(STDERR_HINT),
        _ => None,
    }
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        Self::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(anyhow::anyhow!("JSON serialization failed: {err}"))
    }
}

impl From<tachikoma_common_config::ConfigError> for CliError {
    fn from(err: tachikoma_common_config::ConfigError) -> Self {
        Self::Config {
            message: format!("Configuration error: {err}"),
            source: Some(Box::new(err)),
            hint: Some("Check .tachikoma/config.yaml".to_string()),
        }
    }
}
