//! CLI argument definitions using clap derive macros.

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand, ValueHint};
use tachikoma_common_config::{ConfigLoader, TachikomaConfig};

use crate::commands::PluginsCommand;
use crate::error::CliError;

/// Tachikoma - plugin host
///
/// Discover, validate and manage out-of-process plugins.
#[derive(Debug, Parser)]
#[command(
    name = "tachikoma",
    author,
    version,
    about,
    long_about = None,
    propagate_version = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Increase verbosity level (-v, -vv, -vvv)
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        global = true,
        help = "Increase verbosity level"
    )]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Suppress non-error output"
    )]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "TACHIKOMA_CONFIG",
        value_hint = ValueHint::FilePath,
        help = "Path to configuration file"
    )]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        help = "Output format (text, json)"
    )]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Output format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage plugins
    #[command(visible_alias = "plugin")]
    Plugins(PluginsCommand),
}

impl Cli {
    /// Load configuration from `--config` or `<cwd>/.tachikoma/config.yaml`
    pub fn load_config(&self, project_root: &Path) -> Result<TachikomaConfig, CliError> {
        let loader = match &self.config {
            Some(path) => ConfigLoader::with_path(path),
            None => ConfigLoader::new(project_root),
        };
        tracing::debug!(path = %loader.config_path().display(), "loading configuration");
        Ok(loader.load()?)
    }

    /// Execute the selected command
    pub async fn execute(self) -> Result<(), CliError> {
        let project_root = std::env::current_dir()
            .map_err(|e| CliError::io("failed to determine current directory", e))?;
        let config = self.load_config(&project_root)?;

        let ctx = CommandContext {
            config,
            project_root,
            format: self.format,
        };

        match self.command {
            Command::Plugins(cmd) => cmd.execute(&ctx).await,
        }
    }
}

/// Context passed to all commands
#[derive(Debug)]
pub struct CommandContext {
    pub config: TachikomaConfig,
    /// Workspace root; project plugins live under `<root>/.tachikoma/plugins`
    pub project_root: PathBuf,
    pub format: OutputFormat,
}
