//! Plugin registry
//!
//! Combines discovery, process launch and init into the lifecycle of every
//! plugin: discovered, then either left alone, loaded and initialized, or
//! skipped after a failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{AgentInitResult, InitParams, InitResult, PluginConfig, WorkflowInitResult};
use crate::{
    AgentAdapter, Discovery, Manifest, PluginError, PluginType, Process, ProviderAdapter, Result,
    WorkflowAdapter,
};

/// Starts a plugin process for a manifest.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, manifest: &Manifest) -> Result<Process>;
}

/// Spawns the manifest's executable as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawnLauncher;

#[async_trait]
impl Launcher for SpawnLauncher {
    async fn launch(&self, manifest: &Manifest) -> Result<Process> {
        Process::spawn(manifest)
    }
}

/// What a plugin answered to its init call.
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    Provider(InitResult),
    Agent(AgentInitResult),
    Workflow(WorkflowInitResult),
    /// Reply to the bare `init` of an untyped plugin
    Generic(Value),
}

impl InitOutcome {
    fn decode(plugin_type: Option<PluginType>, value: Value) -> std::result::Result<Self, serde_json::Error> {
        Ok(match plugin_type {
            Some(PluginType::Provider) => InitOutcome::Provider(decode_or_default(value)?),
            Some(PluginType::Agent) => InitOutcome::Agent(decode_or_default(value)?),
            Some(PluginType::Workflow) => InitOutcome::Workflow(decode_or_default(value)?),
            None => InitOutcome::Generic(value),
        })
    }

    /// Capabilities the plugin reported at init.
    pub fn capabilities(&self) -> &[String] {
        match self {
            InitOutcome::Provider(result) => &result.capabilities,
            InitOutcome::Agent(result) => &result.capabilities,
            InitOutcome::Workflow(_) | InitOutcome::Generic(_) => &[],
        }
    }
}

fn decode_or_default<T: DeserializeOwned + Default>(value: Value) -> std::result::Result<T, serde_json::Error> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value)
}

/// Runtime record of one discovered plugin
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Validated manifest
    pub manifest: Arc<Manifest>,

    /// Live process while the plugin is loaded
    pub process: Option<Arc<Process>>,

    /// Init reply while the plugin is loaded
    pub init: Option<InitOutcome>,

    /// Loaded and initialized
    pub enabled: bool,
}

impl PluginInfo {
    fn discovered(manifest: Manifest) -> Self {
        Self {
            manifest: Arc::new(manifest),
            process: None,
            init: None,
            enabled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn plugin_type(&self) -> Option<PluginType> {
        self.manifest.plugin_type
    }

    /// Enabled and holding a process.
    pub fn is_loaded(&self) -> bool {
        self.enabled && self.process.is_some()
    }

    fn is_loaded_type(&self, plugin_type: PluginType) -> bool {
        self.is_loaded() && self.plugin_type() == Some(plugin_type)
    }
}

/// A started and initialized plugin, not yet committed to the table.
struct Loaded {
    process: Arc<Process>,
    init: InitOutcome,
}

/// Owns the lifecycle of every discovered plugin.
///
/// Each registry is independent; nothing is shared between instances.
pub struct Registry {
    discovery: Discovery,
    launcher: Arc<dyn Launcher>,
    plugins: RwLock<HashMap<String, PluginInfo>>,
    enabled: RwLock<HashSet<String>>,
    config: RwLock<HashMap<String, PluginConfig>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("discovery", &self.discovery)
            .field("plugins", &read(&self.plugins).len())
            .finish()
    }
}

impl Registry {
    /// Registry that spawns plugin executables.
    pub fn new(discovery: Discovery) -> Self {
        Self::with_launcher(discovery, Arc::new(SpawnLauncher))
    }

    /// Registry with a custom way to start plugin processes.
    pub fn with_launcher(discovery: Discovery, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            discovery,
            launcher,
            plugins: RwLock::new(HashMap::new()),
            enabled: RwLock::new(HashSet::new()),
            config: RwLock::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Replace the set of plugins loaded by [`Registry::discover_and_load`].
    pub fn set_enabled<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *write(&self.enabled) = names.into_iter().map(Into::into).collect();
    }

    /// Whether `name` is in the enabled set, loaded or not.
    pub fn is_marked_enabled(&self, name: &str) -> bool {
        read(&self.enabled).contains(name)
    }

    /// Configuration sent to `name` at init.
    pub fn set_config(&self, name: impl Into<String>, config: PluginConfig) {
        write(&self.config).insert(name.into(), config);
    }

    pub fn set_configs(&self, configs: HashMap<String, PluginConfig>) {
        *write(&self.config) = configs;
    }

    pub fn get_config(&self, name: &str) -> Option<PluginConfig> {
        read(&self.config).get(name).cloned()
    }

    /// Discover every plugin and load the enabled ones.
    ///
    /// A plugin that fails to start or initialize is logged and left
    /// disabled; the others are unaffected.
    pub async fn discover_and_load(&self, cancel: &CancellationToken) -> Result<()> {
        let manifests = self.discovery.discover()?;
        let enabled = read(&self.enabled).clone();

        let mut infos = HashMap::with_capacity(manifests.len());
        for (name, manifest) in manifests {
            let mut info = PluginInfo::discovered(manifest);
            if enabled.contains(&name) {
                match self.load(cancel, &info.manifest).await {
                    Ok(loaded) => {
                        info.process = Some(loaded.process);
                        info.init = Some(loaded.init);
                        info.enabled = true;
                        info!(plugin = %name, "plugin loaded");
                    }
                    Err(e) => warn!(plugin = %name, error = %e, "failed to load plugin"),
                }
            }
            infos.insert(name, info);
        }

        let replaced: Vec<PluginInfo> = {
            let mut plugins = write(&self.plugins);
            let previous = std::mem::replace(&mut *plugins, infos);
            previous.into_values().collect()
        };
        stop_all(replaced).await;

        Ok(())
    }

    /// Load and initialize a discovered plugin.
    ///
    /// Unknown names are an error; an already enabled plugin is left as is.
    pub async fn enable(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let manifest = {
            let plugins = read(&self.plugins);
            let info = plugins
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            if info.enabled {
                return Ok(());
            }
            Arc::clone(&info.manifest)
        };

        let loaded = self.load(cancel, &manifest).await?;

        let rejected = {
            let mut plugins = write(&self.plugins);
            match plugins.get_mut(name) {
                Some(info) if !info.enabled => {
                    info.process = Some(loaded.process);
                    info.init = Some(loaded.init);
                    info.enabled = true;
                    None
                }
                // Enabled concurrently or removed by a reload meanwhile.
                _ => Some(loaded.process),
            }
        };
        if let Some(process) = rejected {
            stop_quietly(&process).await;
        }

        write(&self.enabled).insert(name.to_string());
        info!(plugin = %name, "plugin enabled");
        Ok(())
    }

    /// Stop a plugin's process and keep its record.
    pub async fn disable(&self, name: &str) -> Result<()> {
        let process = {
            let mut plugins = write(&self.plugins);
            let info = plugins
                .get_mut(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            info.enabled = false;
            info.init = None;
            info.process.take()
        };
        write(&self.enabled).remove(name);

        if let Some(process) = process {
            process.stop().await?;
            info!(plugin = %name, "plugin disabled");
        }
        Ok(())
    }

    /// Stop everything, forget all records and discover again.
    pub async fn reload(&self, cancel: &CancellationToken) -> Result<()> {
        let previous: Vec<PluginInfo> = write(&self.plugins).drain().map(|(_, info)| info).collect();
        stop_all(previous).await;
        self.discover_and_load(cancel).await
    }

    /// Stop every running plugin, reporting all failures together.
    pub async fn shutdown(&self) -> Result<()> {
        let running: Vec<(String, Arc<Process>)> = {
            let mut plugins = write(&self.plugins);
            plugins
                .values_mut()
                .filter_map(|info| {
                    info.enabled = false;
                    info.init = None;
                    info.process.take().map(|p| (info.manifest.name.clone(), p))
                })
                .collect()
        };

        let mut failures = Vec::new();
        for (name, process) in running {
            if let Err(e) = process.stop().await {
                warn!(plugin = %name, error = %e, "plugin did not stop cleanly");
                failures.push((name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PluginError::Shutdown(failures))
        }
    }

    async fn load(&self, cancel: &CancellationToken, manifest: &Manifest) -> Result<Loaded> {
        let process = Arc::new(self.launcher.launch(manifest).await?);

        match self.initialize(cancel, manifest, &process).await {
            Ok(init) => Ok(Loaded { process, init }),
            Err(e) => {
                stop_quietly(&process).await;
                Err(PluginError::Init {
                    plugin: manifest.name.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn initialize(
        &self,
        cancel: &CancellationToken,
        manifest: &Manifest,
        process: &Process,
    ) -> Result<InitOutcome> {
        let method = PluginType::init_method_for(manifest.plugin_type);
        let params = InitParams {
            config: self.get_config(&manifest.name).unwrap_or_default(),
        };
        debug!(plugin = %manifest.name, method, "initializing plugin");

        let value = process.call_raw(cancel, method, &params).await?;
        InitOutcome::decode(manifest.plugin_type, value).map_err(|source| {
            PluginError::InvalidResponse {
                method: method.to_string(),
                source,
            }
        })
    }

    // -- queries -------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<PluginInfo> {
        read(&self.plugins).get(name).cloned()
    }

    pub fn get_process(&self, name: &str) -> Option<Arc<Process>> {
        read(&self.plugins).get(name).and_then(|info| info.process.clone())
    }

    /// Every discovered plugin, sorted by name.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.collect(|_| true)
    }

    /// Plugins that are enabled and hold a process.
    pub fn list_enabled(&self) -> Vec<PluginInfo> {
        self.collect(PluginInfo::is_loaded)
    }

    pub fn list_by_type(&self, plugin_type: PluginType) -> Vec<PluginInfo> {
        self.collect(|info| info.plugin_type() == Some(plugin_type))
    }

    pub fn list_enabled_by_type(&self, plugin_type: PluginType) -> Vec<PluginInfo> {
        self.collect(|info| info.is_loaded_type(plugin_type))
    }

    pub fn providers(&self) -> Vec<PluginInfo> {
        self.list_enabled_by_type(PluginType::Provider)
    }

    pub fn agents(&self) -> Vec<PluginInfo> {
        self.list_enabled_by_type(PluginType::Agent)
    }

    pub fn workflows(&self) -> Vec<PluginInfo> {
        self.list_enabled_by_type(PluginType::Workflow)
    }

    fn collect(&self, filter: impl Fn(&PluginInfo) -> bool) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = read(&self.plugins)
            .values()
            .filter(|info| filter(info))
            .cloned()
            .collect();
        infos.sort_by(|a, b| a.name().cmp(b.name()));
        infos
    }

    // -- adapters ------------------------------------------------------------

    /// Adapters for every loaded provider plugin.
    pub fn provider_adapters(&self) -> Vec<ProviderAdapter> {
        self.providers()
            .into_iter()
            .filter_map(|info| Some(ProviderAdapter::new(info.manifest, info.process?)))
            .collect()
    }

    /// Adapters for every loaded agent plugin.
    pub fn agent_adapters(&self) -> Vec<AgentAdapter> {
        self.agents()
            .into_iter()
            .filter_map(|info| Some(AgentAdapter::new(info.manifest, info.process?)))
            .collect()
    }

    /// Adapters for every loaded workflow plugin, carrying their init reply.
    pub fn workflow_adapters(&self) -> Vec<WorkflowAdapter> {
        self.workflows()
            .into_iter()
            .filter_map(|info| {
                let adapter = WorkflowAdapter::new(info.manifest, info.process?);
                Some(match info.init {
                    Some(InitOutcome::Workflow(init)) => adapter.with_extensions(init),
                    _ => adapter,
                })
            })
            .collect()
    }
}

async fn stop_quietly(process: &Process) {
    if let Err(e) = process.stop().await {
        warn!(plugin = %process.name(), error = %e, "failed to stop plugin");
    }
}

async fn stop_all(infos: Vec<PluginInfo>) {
    for process in infos.into_iter().filter_map(|info| info.process) {
        stop_quietly(&process).await;
    }
}
