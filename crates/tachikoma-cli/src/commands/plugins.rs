//! Plugins command implementation.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tachikoma_plugin::discovery::{self, MANIFEST_FILE_NAME};
use tachikoma_plugin::manifest::TypedConfig;
use tachikoma_plugin::protocol::{AgentMetadataResult, EffectInfo, GuardInfo, PhaseInfo};
use tachikoma_plugin::registry::InitOutcome;
use tachikoma_plugin::{
    CancellationToken, Discovery, Manifest, PluginError, PluginType, Registry, Scope,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cli::CommandContext;
use crate::error::CliError;
use crate::output::{print_output, FormattedOutput, StatusOutput};

const ENABLE_HINT: &str = "plugins.enabled in .tachikoma/config.yaml";

/// Manage plugins
#[derive(Debug, Parser)]
pub struct PluginsCommand {
    #[command(subcommand)]
    pub action: PluginsAction,
}

#[derive(Debug, Subcommand)]
pub enum PluginsAction {
    /// List discovered plugins
    #[command(visible_alias = "ls")]
    List {
        /// Only show plugins of this type (provider, agent, workflow)
        #[arg(long = "type", value_name = "TYPE")]
        plugin_type: Option<PluginType>,
    },

    /// Validate plugin manifests
    Validate {
        /// Plugin name or plugin directory; all plugins when omitted
        name: Option<String>,
    },

    /// Show plugin details
    Info {
        /// Plugin name
        name: String,
    },

    /// Start a plugin, initialize it and report what it supports
    Check {
        /// Plugin name
        name: String,
    },

    /// Install a plugin from a local directory or git URL
    Install {
        /// Local directory or git URL
        source: String,

        /// Install into the global plugin directory
        #[arg(long)]
        global: bool,

        /// Replace an existing installation
        #[arg(long)]
        force: bool,
    },

    /// Remove an installed plugin
    #[command(visible_alias = "rm")]
    Remove {
        /// Plugin name
        name: String,

        /// Remove from the global plugin directory
        #[arg(long)]
        global: bool,
    },
}

impl PluginsCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<(), CliError> {
        match &self.action {
            PluginsAction::List { plugin_type } => list(ctx, *plugin_type),
            PluginsAction::Validate { name } => validate(ctx, name.as_deref()),
            PluginsAction::Info { name } => show_info(ctx, name),
            PluginsAction::Check { name } => check(ctx, name).await,
            PluginsAction::Install {
                source,
                global,
                force,
            } => install(ctx, source, *global, *force).await,
            PluginsAction::Remove { name, global } => remove(ctx, name, *global),
        }
    }
}

/// Discovery over the configured directories, falling back to the defaults.
fn plugin_discovery(ctx: &CommandContext) -> Discovery {
    let plugins = &ctx.config.plugins;
    let resolve = |dir: &PathBuf| ctx.project_root.join(dir);

    let global_dir = match plugins.global_dir.as_ref() {
        Some(dir) => Some(resolve(dir)),
        None => discovery::default_global_dir()
            .map_err(|e| warn!(error = %e, "global plugin directory unavailable"))
            .ok(),
    };
    let project_dir = plugins
        .project_dir
        .as_ref()
        .map(resolve)
        .unwrap_or_else(|| discovery::default_project_dir(&ctx.project_root));

    Discovery::new(global_dir, Some(project_dir))
}

fn base_dir(discovery: &Discovery, global: bool) -> Result<PathBuf, CliError> {
    let scope = if global { Scope::Global } else { Scope::Project };
    discovery
        .dir_for(scope)
        .map(Path::to_path_buf)
        .ok_or_else(|| CliError::Config {
            message: format!("no {scope} plugin directory is available"),
            source: None,
            hint: Some("Set plugins.global_dir in .tachikoma/config.yaml".to_string()),
        })
}

fn host_version() -> Result<semver::Version, CliError> {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).map_err(|e| CliError::Other(e.into()))
}

fn not_found(name: &str, known: impl IntoIterator<Item = String>) -> CliError {
    let needle = name.to_lowercase();
    let mut suggestions: Vec<String> = known
        .into_iter()
        .filter(|candidate| {
            let candidate = candidate.to_lowercase();
            candidate.contains(&needle) || needle.contains(&candidate)
        })
        .collect();
    suggestions.sort();
    CliError::unknown_plugin(name, suggestions)
}

fn type_label(plugin_type: Option<PluginType>) -> &'static str {
    plugin_type.map_or("-", PluginType::as_str)
}

// -- list ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PluginSummary {
    name: String,
    #[serde(rename = "type")]
    plugin_type: Option<PluginType>,
    scope: Option<Scope>,
    version: String,
    description: String,
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct PluginList {
    plugins: Vec<PluginSummary>,
    global_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
}

impl FormattedOutput for PluginList {
    fn format_text(&self) -> String {
        let dir = |d: &Option<PathBuf>| {
            d.as_ref()
                .map_or_else(|| "(unavailable)".to_string(), |d| d.display().to_string())
        };

        if self.plugins.is_empty() {
            return format!(
                "No plugins discovered.\n\nPlugin locations:\n  Global:  {}\n  Project: {}",
                dir(&self.global_dir),
                dir(&self.project_dir)
            );
        }

        let width = self
            .plugins
            .iter()
            .map(|p| p.name.len())
            .max()
            .unwrap_or(0)
            .max("NAME".len());

        let mut out = format!(
            "{:<width$}  {:<8}  {:<7}  {:<10}  ENABLED\n",
            "NAME", "TYPE", "SCOPE", "VERSION"
        );
        for plugin in &self.plugins {
            let scope = plugin.scope.map_or_else(|| "-".to_string(), |s| s.to_string());
            out.push_str(&format!(
                "{:<width$}  {:<8}  {:<7}  {:<10}  {}\n",
                plugin.name,
                type_label(plugin.plugin_type),
                scope,
                plugin.version,
                if plugin.enabled { "yes" } else { "no" }
            ));
        }
        out.push_str(&format!("\nEnable plugins under {ENABLE_HINT}"));
        out
    }
}

fn list(ctx: &CommandContext, plugin_type: Option<PluginType>) -> Result<(), CliError> {
    let discovery = plugin_discovery(ctx);

    let mut plugins: Vec<PluginSummary> = discovery
        .discover()?
        .into_values()
        .filter(|m| plugin_type.map_or(true, |t| m.plugin_type == Some(t)))
        .map(|m| PluginSummary {
            enabled: ctx.config.plugins.is_enabled(&m.name),
            name: m.name,
            plugin_type: m.plugin_type,
            scope: m.scope,
            version: m.version,
            description: m.description,
        })
        .collect();
    plugins.sort_by(|a, b| a.name.cmp(&b.name));

    print_output(
        ctx,
        &PluginList {
            plugins,
            global_dir: discovery.global_dir().map(Path::to_path_buf),
            project_dir: discovery.project_dir().map(Path::to_path_buf),
        },
    )
}

// -- validate -----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ValidationEntry {
    name: String,
    scope: Option<Scope>,
    path: PathBuf,
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    plugins: Vec<ValidationEntry>,
}

impl ValidationReport {
    fn invalid_count(&self) -> usize {
        self.plugins.iter().filter(|p| !p.valid).count()
    }
}

impl FormattedOutput for ValidationReport {
    fn format_text(&self) -> String {
        if self.plugins.is_empty() {
            return "No plugins to validate.".to_string();
        }

        let mut out = String::new();
        for entry in &self.plugins {
            out.push_str(&format!("Validating '{}'...\n", entry.name));
            for error in &entry.errors {
                out.push_str(&format!("  ERROR: {error}\n"));
            }
            for warning in &entry.warnings {
                out.push_str(&format!("  WARNING: {warning}\n"));
            }
            if entry.errors.is_empty() && entry.warnings.is_empty() {
                out.push_str("  OK\n");
            }
        }

        match self.invalid_count() {
            0 => out.push_str("\nAll plugin manifests are valid."),
            n => out.push_str(&format!("\n{n} plugin manifest(s) invalid.")),
        }
        out
    }
}

/// Check one manifest file without starting the plugin.
fn validate_manifest(path: &Path, scope: Option<Scope>, host: &semver::Version) -> ValidationEntry {
    let dir_name = path
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let manifest = match Manifest::load(path) {
        Ok(manifest) => manifest,
        Err(e) => {
            return ValidationEntry {
                name: dir_name,
                scope,
                path: path.to_path_buf(),
                valid: false,
                errors: vec![e.to_string()],
                warnings: Vec::new(),
            }
        }
    };

    let mut warnings: Vec<String> = manifest
        .missing_env()
        .into_iter()
        .map(|var| format!("required environment variable {var} is not set"))
        .collect();
    if let Err(e) = manifest.check_host_version(host) {
        warnings.push(e.to_string());
    }
    if let Err(e) = tachikoma_plugin::process::resolve_executable(&manifest) {
        warnings.push(e.to_string());
    }
    if manifest.name != dir_name {
        warnings.push(format!(
            "directory name {dir_name:?} differs from manifest name {:?}",
            manifest.name
        ));
    }

    ValidationEntry {
        name: manifest.name,
        scope,
        path: path.to_path_buf(),
        valid: true,
        errors: Vec::new(),
        warnings,
    }
}

fn validate(ctx: &CommandContext, name: Option<&str>) -> Result<(), CliError> {
    let host = host_version()?;

    let explicit = name
        .map(|n| ctx.project_root.join(n).join(MANIFEST_FILE_NAME))
        .filter(|path| path.is_file());

    let plugins = match (name, explicit) {
        (_, Some(path)) => vec![validate_manifest(&path, None, &host)],
        (name, None) => {
            let discovery = plugin_discovery(ctx);
            let mut entries: Vec<ValidationEntry> = discovery
                .manifest_files()?
                .into_iter()
                .map(|(scope, path)| validate_manifest(&path, Some(scope), &host))
                .collect();
            if let Some(name) = name {
                let known: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
                entries.retain(|e| e.name == name);
                if entries.is_empty() {
                    return Err(not_found(name, known));
                }
            }
            entries
        }
    };

    let report = ValidationReport { plugins };
    print_output(ctx, &report)?;

    match report.invalid_count() {
        0 => Ok(()),
        n => Err(CliError::validation(format!("{n} plugin manifest(s) invalid"))),
    }
}

// -- info ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PluginDetails {
    #[serde(flatten)]
    manifest: Manifest,
    scope: Option<Scope>,
    dir: PathBuf,
    enabled: bool,
}

impl FormattedOutput for PluginDetails {
    fn format_text(&self) -> String {
        let m = &self.manifest;
        let mut out = String::new();
        let mut line = |label: &str, value: &str| out.push_str(&format!("{label:<13}{value}\n"));

        line("Name:", &m.name);
        line("Type:", type_label(m.plugin_type));
        line("Version:", &m.version);
        line("Protocol:", &m.protocol);
        line("Description:", &m.description);
        line(
            "Scope:",
            &self.scope.map_or_else(|| "-".to_string(), |s| s.to_string()),
        );
        line("Directory:", &self.dir.display().to_string());
        line("Enabled:", if self.enabled { "yes" } else { "no" });
        if let Some(author) = &m.author {
            line("Author:", author);
        }
        if let Some(homepage) = &m.homepage {
            line("Homepage:", homepage);
        }
        if let Some(requires) = &m.requires {
            line("Requires:", requires);
        }
        line("Executable:", &m.executable_command().join(" "));

        match m.typed_config() {
            Some(TypedConfig::Provider(provider)) => {
                out.push_str("\nProvider Configuration:\n");
                out.push_str(&format!("  Schemes:      {}\n", provider.schemes.join(", ")));
                out.push_str(&format!("  Priority:     {}\n", provider.priority));
                out.push_str(&format!("  Capabilities: {}\n", provider.capabilities.join(", ")));
            }
            Some(TypedConfig::Agent(agent)) => {
                out.push_str("\nAgent Configuration:\n");
                out.push_str(&format!("  Streaming:    {}\n", agent.streaming));
                if !agent.capabilities.is_empty() {
                    out.push_str(&format!("  Capabilities: {}\n", agent.capabilities.join(", ")));
                }
            }
            Some(TypedConfig::Workflow(workflow)) => {
                out.push_str("\nWorkflow Configuration:\n");
                let sections = [
                    ("Phases", workflow.phases.iter().map(|p| (&p.name, &p.description, false)).collect::<Vec<_>>()),
                    ("Guards", workflow.guards.iter().map(|g| (&g.name, &g.description, false)).collect()),
                    ("Effects", workflow.effects.iter().map(|e| (&e.name, &e.description, e.critical)).collect()),
                ];
                for (title, items) in sections {
                    if items.is_empty() {
                        continue;
                    }
                    out.push_str(&format!("  {title}:\n"));
                    for (name, description, critical) in items {
                        let marker = if critical { " [critical]" } else { "" };
                        out.push_str(&format!("    - {name}{marker}: {description}\n"));
                    }
                }
            }
            None => {}
        }

        if !m.env.is_empty() {
            out.push_str("\nEnvironment Variables:\n");
            let mut names: Vec<&String> = m.env.keys().collect();
            names.sort();
            for name in names {
                let spec = &m.env[name];
                let required = if spec.required { " (required)" } else { "" };
                out.push_str(&format!("  {name}{required}\n"));
                if !spec.description.is_empty() {
                    out.push_str(&format!("    {}\n", spec.description));
                }
                if let Some(default) = &spec.default {
                    out.push_str(&format!("    default: {default}\n"));
                }
            }
        }

        out.trim_end().to_string()
    }
}

fn show_info(ctx: &CommandContext, name: &str) -> Result<(), CliError> {
    let mut manifests = plugin_discovery(ctx).discover()?;
    let manifest = manifests
        .remove(name)
        .ok_or_else(|| not_found(name, manifests.into_keys()))?;

    let details = PluginDetails {
        scope: manifest.scope,
        dir: manifest.dir.clone(),
        enabled: ctx.config.plugins.is_enabled(&manifest.name),
        manifest,
    };
    print_output(ctx, &details)
}

// -- check --------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
struct CheckReport {
    name: String,
    #[serde(rename = "type")]
    plugin_type: Option<PluginType>,
    version: String,
    pid: Option<u32>,
    capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<AgentMetadataResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    phases: Vec<PhaseInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    guards: Vec<GuardInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    effects: Vec<EffectInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl FormattedOutput for CheckReport {
    fn format_text(&self) -> String {
        let mut out = format!(
            "✓ Plugin '{}' ({} {}) initialized",
            self.name,
            type_label(self.plugin_type),
            self.version
        );
        if let Some(pid) = self.pid {
            out.push_str(&format!(" [pid {pid}]"));
        }
        out.push('\n');

        if !self.capabilities.is_empty() {
            out.push_str(&format!("  Capabilities: {}\n", self.capabilities.join(", ")));
        }
        if let Some(metadata) = &self.metadata {
            if !metadata.models.is_empty() {
                out.push_str(&format!("  Models:       {}\n", metadata.models.join(", ")));
            }
        }
        let names = |items: Vec<&str>| items.join(", ");
        if !self.phases.is_empty() {
            out.push_str(&format!(
                "  Phases:       {}\n",
                names(self.phases.iter().map(|p| p.name.as_str()).collect())
            ));
        }
        if !self.guards.is_empty() {
            out.push_str(&format!(
                "  Guards:       {}\n",
                names(self.guards.iter().map(|g| g.name.as_str()).collect())
            ));
        }
        if !self.effects.is_empty() {
            out.push_str(&format!(
                "  Effects:      {}\n",
                names(self.effects.iter().map(|e| e.name.as_str()).collect())
            ));
        }
        for warning in &self.warnings {
            out.push_str(&format!("  WARNING: {warning}\n"));
        }
        out.trim_end().to_string()
    }
}

async fn check(ctx: &CommandContext, name: &str) -> Result<(), CliError> {
    let registry = Registry::new(plugin_discovery(ctx));
    registry.set_configs(ctx.config.plugins.config.clone());

    let cancel = CancellationToken::new();
    registry.discover_and_load(&cancel).await?;

    let enabled = registry.enable(&cancel, name).await;
    let report = enabled.map(|()| check_report(&registry, name));
    if let Err(e) = registry.shutdown().await {
        warn!(plugin = %name, error = %e, "plugin did not stop cleanly");
    }

    match report {
        Ok(report) => print_output(ctx, &report?),
        Err(PluginError::NotFound(_)) => Err(not_found(
            name,
            registry.list().into_iter().map(|info| info.manifest.name.clone()),
        )),
        Err(e) => Err(e.into()),
    }
}

fn check_report(registry: &Registry, name: &str) -> Result<CheckReport, CliError> {
    let info = registry
        .get(name)
        .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
    let manifest = &info.manifest;

    let mut report = CheckReport {
        name: manifest.name.clone(),
        plugin_type: manifest.plugin_type,
        version: manifest.version.clone(),
        pid: info.process.as_ref().and_then(|p| p.pid()),
        warnings: manifest
            .missing_env()
            .into_iter()
            .map(|var| format!("required environment variable {var} is not set"))
            .collect(),
        ..CheckReport::default()
    };

    match &info.init {
        Some(InitOutcome::Provider(result)) => report.capabilities = result.capabilities.clone(),
        Some(InitOutcome::Agent(result)) => {
            report.capabilities = result.capabilities.clone();
            report.metadata = result.metadata.clone();
        }
        Some(InitOutcome::Workflow(result)) => {
            report.phases = result.phases.clone();
            report.guards = result.guards.clone();
            report.effects = result.effects.clone();
        }
        Some(InitOutcome::Generic(value)) => debug!(plugin = %name, init = %value, "untyped init reply"),
        None => {}
    }

    Ok(report)
}

// -- install / remove ---------------------------------------------------------

fn is_git_url(source: &str) -> bool {
    const PREFIXES: [&str; 5] = ["http://", "https://", "git@", "ssh://", "git://"];
    PREFIXES.iter().any(|p| source.starts_with(p))
        || (source.ends_with(".git") && !Path::new(source).is_dir())
}

/// Clear `target` for a new installation.
fn prepare_target(target: &Path, name: &str, force: bool) -> Result<(), CliError> {
    if !target.exists() {
        return Ok(());
    }
    if !force {
        return Err(CliError::user_with_hint(
            format!("plugin '{name}' already installed at {}", target.display()),
            "Use --force to replace it",
        ));
    }
    info!(plugin = %name, dir = %target.display(), "replacing installed plugin");
    std::fs::remove_dir_all(target)
        .map_err(|e| CliError::io_with_path("failed to remove existing plugin", e, target))
}

/// Recursively copy `src` into `dst`, skipping version control metadata.
fn copy_dir(src: &Path, dst: &Path) -> Result<(), CliError> {
    let walker = WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| CliError::Other(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CliError::Other(e.into()))?;
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| CliError::io_with_path("failed to create directory", e, &target))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| CliError::io_with_path("failed to copy file", e, entry.path()))?;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(())
}

fn install_from_local(source: &Path, base: &Path, force: bool) -> Result<Manifest, CliError> {
    let source = std::fs::canonicalize(source)
        .map_err(|e| CliError::io_with_path("plugin source not found", e, source))?;
    let manifest = Manifest::load(&source.join(MANIFEST_FILE_NAME))?;

    let target = discovery::install_path(base, &manifest.name)?;
    if target == source {
        return Err(CliError::validation(format!(
            "plugin '{}' is already installed at {}",
            manifest.name,
            source.display()
        )));
    }
    prepare_target(&target, &manifest.name, force)?;

    info!(plugin = %manifest.name, from = %source.display(), "installing plugin");
    copy_dir(&source, &target)?;
    Ok(Manifest::load(&target.join(MANIFEST_FILE_NAME))?)
}

async fn install_from_git(url: &str, base: &Path, force: bool) -> Result<Manifest, CliError> {
    let staging = base.join(format!(".install-{}", std::process::id()));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .map_err(|e| CliError::io_with_path("failed to clear staging directory", e, &staging))?;
    }

    info!(url, "cloning plugin");
    let output = tokio::process::Command::new("git")
        .args(["clone", "--depth", "1", "--quiet", url])
        .arg(&staging)
        .output()
        .await
        .map_err(|e| CliError::Git {
            message: format!("failed to run git: {e}"),
        })?;
    if !output.status.success() {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(CliError::Git {
            message: format!(
                "git clone failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let installed = place_clone(&staging, base, force);
    if installed.is_err() && staging.exists() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    installed
}

fn place_clone(staging: &Path, base: &Path, force: bool) -> Result<Manifest, CliError> {
    let manifest = Manifest::load(&staging.join(MANIFEST_FILE_NAME))?;
    let target = discovery::install_path(base, &manifest.name)?;
    prepare_target(&target, &manifest.name, force)?;
    std::fs::rename(staging, &target)
        .map_err(|e| CliError::io_with_path("failed to move cloned plugin", e, &target))?;
    Ok(Manifest::load(&target.join(MANIFEST_FILE_NAME))?)
}

async fn install(ctx: &CommandContext, source: &str, global: bool, force: bool) -> Result<(), CliError> {
    let base = base_dir(&plugin_discovery(ctx), global)?;
    discovery::ensure_dir(&base)?;

    let manifest = if is_git_url(source) {
        install_from_git(source, &base, force).await?
    } else {
        install_from_local(Path::new(source), &base, force)?
    };

    let status = StatusOutput::success(format!(
        "Plugin '{}' installed to {}",
        manifest.name,
        manifest.dir.display()
    ));
    let status = if ctx.config.plugins.is_enabled(&manifest.name) {
        status
    } else {
        status.with_hint(format!("Enable it by adding '{}' to {ENABLE_HINT}", manifest.name))
    };
    print_output(ctx, &status)
}

fn remove_plugin(discovery: &Discovery, name: &str, global: bool) -> Result<PathBuf, CliError> {
    let base = base_dir(discovery, global)?;
    let dir = discovery::install_path(&base, name)?;

    if !dir.join(MANIFEST_FILE_NAME).is_file() {
        let (scope, other, hint) = if global {
            (Scope::Global, Scope::Project, "Omit --global")
        } else {
            (Scope::Project, Scope::Global, "Use --global")
        };
        let elsewhere = discovery
            .dir_for(other)
            .is_some_and(|d| d.join(name).join(MANIFEST_FILE_NAME).is_file());
        if elsewhere {
            return Err(CliError::user_with_hint(
                format!("plugin '{name}' is not installed in the {scope} directory (found in {other})"),
                hint,
            ));
        }
        return Err(not_found(name, discovery.discover()?.into_keys()));
    }

    std::fs::remove_dir_all(&dir)
        .map_err(|e| CliError::io_with_path("failed to remove plugin directory", e, &dir))?;
    info!(plugin = %name, dir = %dir.display(), "plugin removed");
    Ok(dir)
}

fn remove(ctx: &CommandContext, name: &str, global: bool) -> Result<(), CliError> {
    let dir = remove_plugin(&plugin_discovery(ctx), name, global)?;

    let status = StatusOutput::success(format!("Plugin '{name}' removed from {}", dir.display()));
    let status = if ctx.config.plugins.is_enabled(name) {
        status.with_hint(format!("Remove it from {ENABLE_HINT}"))
    } else {
        status
    };
    print_output(ctx, &status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::OutputFormat;
    use tachikoma_common_config::TachikomaConfig;
    use tempfile::TempDir;

    const PROVIDER_YAML: &str = r#"
version: "1.0.0"
name: jira
type: provider
protocol: "1"
description: Jira issues
requires: ">=0.1"
executable:
  command: ["sh", "plugin.sh"]
provider:
  name: jira
  schemes: [jira]
  capabilities: [read, comment]
env:
  TACHIKOMA_TEST_UNSET_TOKEN:
    description: API token
    required: true
"#;

    struct Fixture {
        root: TempDir,
        global: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: TempDir::new().unwrap(),
                global: TempDir::new().unwrap(),
            }
        }

        fn ctx(&self) -> CommandContext {
            let mut config = TachikomaConfig::default();
            config.plugins.global_dir = Some(self.global.path().to_path_buf());
            CommandContext {
                config,
                project_root: self.root.path().to_path_buf(),
                format: OutputFormat::Json,
            }
        }

        fn project_dir(&self) -> PathBuf {
            discovery::default_project_dir(self.root.path())
        }
    }

    fn write_plugin(dir: &Path, yaml: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), yaml).unwrap();
        std::fs::write(dir.join("plugin.sh"), "exit 0\n").unwrap();
    }

    #[test]
    fn test_discovery_uses_config_overrides() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.config.plugins.project_dir = Some(PathBuf::from("plugins"));

        let discovery = plugin_discovery(&ctx);

        assert_eq!(discovery.global_dir(), Some(fixture.global.path()));
        assert_eq!(
            discovery.project_dir(),
            Some(fixture.root.path().join("plugins").as_path())
        );
    }

    #[test]
    fn test_git_url_detection() {
        assert!(is_git_url("https://github.com/acme/tachikoma-jira"));
        assert!(is_git_url("git@github.com:acme/jira.git"));
        assert!(is_git_url("ssh://git@host/jira"));
        assert!(is_git_url("../jira.git"));
        assert!(!is_git_url("./plugins/jira"));
        assert!(!is_git_url("/opt/jira"));
    }

    #[test]
    fn test_validate_reports_warnings_but_stays_valid() {
        let fixture = Fixture::new();
        let dir = fixture.project_dir().join("jira");
        write_plugin(&dir, PROVIDER_YAML);

        let entry = validate_manifest(
            &dir.join(MANIFEST_FILE_NAME),
            Some(Scope::Project),
            &semver::Version::new(0, 0, 9),
        );

        assert!(entry.valid);
        assert_eq!(entry.name, "jira");
        assert!(entry.errors.is_empty());
        assert!(entry
            .warnings
            .iter()
            .any(|w| w.contains("TACHIKOMA_TEST_UNSET_TOKEN")));
        assert!(entry.warnings.iter().any(|w| w.contains("requires host >=0.1")));
    }

    #[test]
    fn test_validate_marks_broken_manifest_invalid() {
        let fixture = Fixture::new();
        write_plugin(&fixture.project_dir().join("broken"), "name: broken\ntype: robot\n");
        write_plugin(&fixture.project_dir().join("jira"), PROVIDER_YAML);
        let ctx = fixture.ctx();

        let err = validate(&ctx, None).unwrap_err();
        assert!(matches!(err, CliError::Validation { .. }));
        assert_eq!(err.to_string(), "1 plugin manifest(s) invalid");

        assert!(validate(&ctx, Some("jira")).is_ok());
        assert!(matches!(
            validate(&ctx, Some("jir")).unwrap_err(),
            CliError::UnknownPlugin { ref suggestions, .. } if suggestions == &["jira".to_string()]
        ));
    }

    #[test]
    fn test_validate_accepts_a_directory() {
        let fixture = Fixture::new();
        write_plugin(&fixture.root.path().join("dev/jira"), PROVIDER_YAML);

        assert!(validate(&fixture.ctx(), Some("dev/jira")).is_ok());
    }

    #[test]
    fn test_validation_report_text() {
        let report = ValidationReport {
            plugins: vec![
                ValidationEntry {
                    name: "jira".to_string(),
                    scope: Some(Scope::Global),
                    path: PathBuf::from("/p/jira/plugin.yaml"),
                    valid: true,
                    errors: Vec::new(),
                    warnings: Vec::new(),
                },
                ValidationEntry {
                    name: "broken".to_string(),
                    scope: Some(Scope::Project),
                    path: PathBuf::from("/p/broken/plugin.yaml"),
                    valid: false,
                    errors: vec!["invalid plugin manifest: version is required".to_string()],
                    warnings: Vec::new(),
                },
            ],
        };

        let text = report.format_text();
        assert!(text.contains("Validating 'jira'...\n  OK\n"));
        assert!(text.contains("  ERROR: invalid plugin manifest: version is required"));
        assert!(text.ends_with("1 plugin manifest(s) invalid."));
    }

    #[test]
    fn test_install_from_local_copies_without_git_metadata() {
        let fixture = Fixture::new();
        let source = fixture.root.path().join("src-jira");
        write_plugin(&source, PROVIDER_YAML);
        std::fs::create_dir_all(source.join(".git")).unwrap();
        std::fs::write(source.join(".git/HEAD"), "ref: main").unwrap();
        std::fs::create_dir_all(source.join("lib")).unwrap();
        std::fs::write(source.join("lib/helper.sh"), "true").unwrap();
        let base = fixture.project_dir();
        discovery::ensure_dir(&base).unwrap();

        let manifest = install_from_local(&source, &base, false).unwrap();

        let target = base.join("jira");
        assert_eq!(manifest.dir, target);
        assert!(target.join("plugin.sh").is_file());
        assert!(target.join("lib/helper.sh").is_file());
        assert!(!target.join(".git").exists());
    }

    #[test]
    fn test_install_requires_force_to_replace() {
        let fixture = Fixture::new();
        let source = fixture.root.path().join("src-jira");
        write_plugin(&source, PROVIDER_YAML);
        let base = fixture.project_dir();
        discovery::ensure_dir(&base).unwrap();
        install_from_local(&source, &base, false).unwrap();
        std::fs::write(base.join("jira/stale.txt"), "old").unwrap();

        let err = install_from_local(&source, &base, false).unwrap_err();
        assert!(matches!(err, CliError::User { .. }));
        assert_eq!(err.hint(), Some("Use --force to replace it"));

        install_from_local(&source, &base, true).unwrap();
        assert!(!base.join("jira/stale.txt").exists());
    }

    #[test]
    fn test_install_rejects_invalid_source() {
        let fixture = Fixture::new();
        let source = fixture.root.path().join("src");
        write_plugin(&source, "name: nope\n");

        let err = install_from_local(&source, &fixture.project_dir(), false).unwrap_err();
        assert!(matches!(err, CliError::Plugin(PluginError::InvalidManifest(_))));
        assert!(!fixture.project_dir().join("nope").exists());
    }

    #[test]
    fn test_remove_respects_scope() {
        let fixture = Fixture::new();
        write_plugin(&fixture.global.path().join("jira"), PROVIDER_YAML);
        let discovery = plugin_discovery(&fixture.ctx());

        let err = remove_plugin(&discovery, "jira", false).unwrap_err();
        assert_eq!(err.hint(), Some("Use --global"));
        assert!(matches!(
            remove_plugin(&discovery, "ghost", false).unwrap_err(),
            CliError::UnknownPlugin { .. }
        ));
        assert!(remove_plugin(&discovery, "../jira", true).is_err());

        let removed = remove_plugin(&discovery, "jira", true).unwrap();
        assert_eq!(removed, fixture.global.path().join("jira"));
        assert!(!removed.exists());
    }

    #[test]
    fn test_info_text_lists_sections() {
        let fixture = Fixture::new();
        let dir = fixture.project_dir().join("jira");
        write_plugin(&dir, PROVIDER_YAML);
        let manifest = Manifest::load(&dir.join(MANIFEST_FILE_NAME)).unwrap();

        let details = PluginDetails {
            scope: Some(Scope::Project),
            dir: manifest.dir.clone(),
            enabled: true,
            manifest,
        };
        let text = details.format_text();

        assert!(text.contains("Name:        jira"));
        assert!(text.contains("Enabled:     yes"));
        assert!(text.contains("Executable:  sh plugin.sh"));
        assert!(text.contains("Capabilities: read, comment"));
        assert!(text.contains("TACHIKOMA_TEST_UNSET_TOKEN (required)"));

        let json: serde_json::Value =
            serde_json::from_str(&details.format_json().unwrap()).unwrap();
        assert_eq!(json["name"], "jira");
        assert_eq!(json["type"], "provider");
        assert_eq!(json["scope"], "project");
    }

    #[tokio::test]
    async fn test_check_unknown_plugin_is_not_found() {
        let fixture = Fixture::new();
        let err = check(&fixture.ctx(), "ghost").await.unwrap_err();
        assert!(matches!(err, CliError::UnknownPlugin { .. }));
    }
}
