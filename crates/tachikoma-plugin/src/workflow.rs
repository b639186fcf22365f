//! Workflow plugins
//!
//! A workflow plugin contributes phases, guards and effects to the host's
//! workflow state machine. Guards and effects run inside the plugin; this
//! module turns them into callables the state machine can hold.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{
    methods, EffectInfo, EvaluateGuardParams, EvaluateGuardResult, ExecuteEffectParams,
    ExecuteEffectResult, GuardInfo, InitParams, PhaseInfo, PluginConfig, WorkflowInitResult,
};
use crate::{Manifest, PluginError, Process, Result};

/// Where a workflow work unit came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Source {
    pub reference: String,
    pub content: String,
}

/// The work unit as seen by the workflow engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkUnit {
    pub id: String,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub source: Option<Source>,
    pub specifications: Vec<String>,
    pub checkpoints: Vec<String>,
}

impl WorkUnit {
    /// Key/value form sent to plugins.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".into(), json!(self.id));
        map.insert("externalId".into(), json!(self.external_id));
        map.insert("title".into(), json!(self.title));
        map.insert("description".into(), json!(self.description));
        map.insert("specifications".into(), json!(self.specifications));
        map.insert("checkpoints".into(), json!(self.checkpoints));
        if let Some(source) = &self.source {
            map.insert(
                "source".into(),
                json!({"reference": source.reference, "content": source.content}),
            );
        }
        map
    }
}

/// Guard callable; `false` blocks the transition.
pub type GuardFn = Arc<dyn Fn(CancellationToken, WorkUnit) -> BoxFuture<'static, bool> + Send + Sync>;

/// Effect callable run on a transition.
pub type EffectFn =
    Arc<dyn Fn(CancellationToken, WorkUnit) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// An effect tagged with whether its failure blocks the transition
#[derive(Clone)]
pub struct CriticalEffect {
    pub name: String,
    pub critical: bool,
    pub effect: EffectFn,
}

impl fmt::Debug for CriticalEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalEffect")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .finish()
    }
}

/// A plugin phase ready to be registered with the state machine
#[derive(Clone)]
pub struct PhaseDefinition {
    pub name: String,
    pub description: String,
    /// Unique state name, `plugin_<plugin>_<phase>`
    pub state: String,
    /// Insert after this state
    pub after: Option<String>,
    /// Insert before this state
    pub before: Option<String>,
    pub entry_event: String,
    pub exit_event: String,
    pub guards: Vec<GuardFn>,
    pub effects: Vec<CriticalEffect>,
}

impl fmt::Debug for PhaseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseDefinition")
            .field("state", &self.state)
            .field("after", &self.after)
            .field("before", &self.before)
            .field("guards", &self.guards.len())
            .field("effects", &self.effects)
            .finish()
    }
}

/// Workflow extensions provided by one plugin
#[derive(Debug, Clone)]
pub struct WorkflowAdapter {
    manifest: Arc<Manifest>,
    process: Arc<Process>,
    phases: Vec<PhaseInfo>,
    guards: Vec<GuardInfo>,
    effects: Vec<EffectInfo>,
}

impl WorkflowAdapter {
    pub fn new(manifest: Arc<Manifest>, process: Arc<Process>) -> Self {
        Self {
            manifest,
            process,
            phases: Vec::new(),
            guards: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Use extensions from an init reply received elsewhere.
    pub fn with_extensions(mut self, init: WorkflowInitResult) -> Self {
        self.set_extensions(init);
        self
    }

    /// Call `workflow.init` and record the extensions it declares.
    pub async fn initialize(&mut self, cancel: &CancellationToken, config: PluginConfig) -> Result<()> {
        let init: Option<WorkflowInitResult> = self
            .process
            .call(cancel, methods::WORKFLOW_INIT, InitParams { config })
            .await?;
        self.set_extensions(init.unwrap_or_default());
        Ok(())
    }

    fn set_extensions(&mut self, init: WorkflowInitResult) {
        debug!(
            plugin = %self.manifest.name,
            phases = init.phases.len(),
            guards = init.guards.len(),
            effects = init.effects.len(),
            "workflow extensions registered"
        );
        self.phases = init.phases;
        self.guards = init.guards;
        self.effects = init.effects;
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn phases(&self) -> &[PhaseInfo] {
        &self.phases
    }

    pub fn guards(&self) -> &[GuardInfo] {
        &self.guards
    }

    pub fn effects(&self) -> &[EffectInfo] {
        &self.effects
    }

    pub fn effect_info(&self, name: &str) -> Option<&EffectInfo> {
        self.effects.iter().find(|e| e.name == name)
    }

    /// Ask the plugin whether a guard passes, with its reason.
    pub async fn evaluate_guard(
        &self,
        cancel: &CancellationToken,
        name: &str,
        work_unit: &WorkUnit,
    ) -> Result<(bool, String)> {
        evaluate_guard(&self.process, cancel, name, work_unit).await
    }

    /// Run an effect in the plugin.
    pub async fn execute_effect(
        &self,
        cancel: &CancellationToken,
        name: &str,
        work_unit: &WorkUnit,
        data: Map<String, Value>,
    ) -> Result<()> {
        execute_effect(&self.process, cancel, name, work_unit, data).await
    }

    /// A guard callable; evaluation errors count as not passed.
    pub fn guard_fn(&self, name: &str) -> GuardFn {
        let process = Arc::clone(&self.process);
        let name = name.to_string();
        Arc::new(move |cancel: CancellationToken, work_unit: WorkUnit| -> BoxFuture<'static, bool> {
            let process = Arc::clone(&process);
            let name = name.clone();
            Box::pin(async move {
                match evaluate_guard(&process, &cancel, &name, &work_unit).await {
                    Ok((passed, reason)) => {
                        if !passed {
                            debug!(plugin = %process.name(), guard = %name, %reason, "guard rejected");
                        }
                        passed
                    }
                    Err(e) => {
                        warn!(plugin = %process.name(), guard = %name, error = %e, "guard evaluation failed");
                        false
                    }
                }
            })
        })
    }

    /// An effect callable sending `data` with every run.
    pub fn effect_fn(&self, name: &str, data: Map<String, Value>) -> EffectFn {
        let process = Arc::clone(&self.process);
        let name = name.to_string();
        Arc::new(move |cancel: CancellationToken, work_unit: WorkUnit| -> BoxFuture<'static, Result<()>> {
            let process = Arc::clone(&process);
            let name = name.clone();
            let data = data.clone();
            Box::pin(async move { execute_effect(&process, &cancel, &name, &work_unit, data).await })
        })
    }

    /// Wrap an effect, marking it critical if the init reply or the manifest
    /// says so.
    pub fn critical_effect(&self, info: &EffectInfo, data: Map<String, Value>) -> CriticalEffect {
        let declared_critical = self
            .manifest
            .workflow
            .as_ref()
            .is_some_and(|w| w.effects.iter().any(|e| e.name == info.name && e.critical));

        CriticalEffect {
            name: info.name.clone(),
            critical: info.critical || declared_critical,
            effect: self.effect_fn(&info.name, data),
        }
    }

    /// Phases with their guards and effects attached.
    ///
    /// A guard or effect belongs to a phase when its name starts with the
    /// phase name and is longer than it.
    pub fn build_phase_definitions(&self) -> Vec<PhaseDefinition> {
        let plugin = &self.manifest.name;
        self.phases
            .iter()
            .map(|phase| {
                let state = format!("plugin_{plugin}_{}", phase.name);
                let belongs = |name: &str| name.len() > phase.name.len() && name.starts_with(&phase.name);

                PhaseDefinition {
                    name: phase.name.clone(),
                    description: phase.description.clone(),
                    after: non_empty(&phase.after),
                    before: non_empty(&phase.before),
                    entry_event: format!("{state}_start"),
                    exit_event: format!("{state}_done"),
                    guards: self
                        .guards
                        .iter()
                        .filter(|g| belongs(&g.name))
                        .map(|g| self.guard_fn(&g.name))
                        .collect(),
                    effects: self
                        .effects
                        .iter()
                        .filter(|e| belongs(&e.name))
                        .map(|e| self.critical_effect(e, Map::new()))
                        .collect(),
                    state,
                }
            })
            .collect()
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

async fn evaluate_guard(
    process: &Process,
    cancel: &CancellationToken,
    name: &str,
    work_unit: &WorkUnit,
) -> Result<(bool, String)> {
    let params = EvaluateGuardParams {
        name: name.to_string(),
        work_unit: work_unit.to_wire(),
    };
    let result: EvaluateGuardResult = process
        .call(cancel, methods::WORKFLOW_EVALUATE_GUARD, params)
        .await?;
    Ok((result.passed, result.reason))
}

async fn execute_effect(
    process: &Process,
    cancel: &CancellationToken,
    name: &str,
    work_unit: &WorkUnit,
    data: Map<String, Value>,
) -> Result<()> {
    let params = ExecuteEffectParams {
        name: name.to_string(),
        work_unit: work_unit.to_wire(),
        data,
    };
    let result: ExecuteEffectResult = process
        .call(cancel, methods::WORKFLOW_EXECUTE_EFFECT, params)
        .await?;
    if result.success {
        return Ok(());
    }
    let message = if result.error.is_empty() {
        "effect reported failure".to_string()
    } else {
        result.error
    };
    Err(PluginError::EffectFailed {
        name: name.to_string(),
        message,
    })
}

/// Run effects in order.
///
/// A failing critical effect stops the run and is returned. Other failures
/// are logged and the run continues.
pub async fn run_effects(
    cancel: &CancellationToken,
    effects: &[CriticalEffect],
    work_unit: &WorkUnit,
) -> Result<()> {
    for effect in effects {
        let result = (effect.effect)(cancel.clone(), work_unit.clone()).await;
        match result {
            Ok(()) => debug!(effect = %effect.name, "effect completed"),
            Err(e) if effect.critical => {
                return Err(PluginError::CriticalEffect {
                    name: effect.name.clone(),
                    source: Box::new(e),
                });
            }
            Err(e) => warn!(effect = %effect.name, error = %e, "non-critical effect failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, reply, request_method, FakeHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manifest() -> Arc<Manifest> {
        let yaml = r#"
version: "1.0.0"
name: review
type: workflow
protocol: "1"
executable:
  path: ./review
workflow:
  effects:
    - name: review_notify
      critical: true
"#;
        Arc::new(Manifest::parse(yaml).unwrap())
    }

    fn init() -> WorkflowInitResult {
        serde_json::from_value(json!({
            "phases": [
                {"name": "review", "after": "implementing"},
                {"name": "audit", "before": "done"},
            ],
            "guards": [{"name": "review_ready"}, {"name": "review"}, {"name": "lint_ok"}],
            "effects": [
                {"name": "review_notify"},
                {"name": "review_log"},
                {"name": "audit_report", "critical": true},
            ],
        }))
        .unwrap()
    }

    fn adapter<F>(handler: F) -> (WorkflowAdapter, FakeHandle)
    where
        F: FnMut(&Value) -> Vec<Value> + Send + 'static,
    {
        let (process, handle) = testing::connect("review", handler);
        (
            WorkflowAdapter::new(manifest(), Arc::new(process)).with_extensions(init()),
            handle,
        )
    }

    fn work_unit() -> WorkUnit {
        WorkUnit {
            id: "wu-1".to_string(),
            title: "Add login".to_string(),
            specifications: vec!["spec-1.md".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_to_wire() {
        let mut unit = work_unit();
        let wire = unit.to_wire();
        assert_eq!(wire["externalId"], "");
        assert_eq!(wire["specifications"], json!(["spec-1.md"]));
        assert!(!wire.contains_key("source"));

        unit.source = Some(Source {
            reference: "file:task.md".to_string(),
            content: "# Task".to_string(),
        });
        assert_eq!(unit.to_wire()["source"]["content"], "# Task");
    }

    #[tokio::test]
    async fn test_phase_definitions() {
        let (adapter, _handle) = adapter(|request| vec![reply(request, Value::Null)]);

        let phases = adapter.build_phase_definitions();

        assert_eq!(phases.len(), 2);
        let review = &phases[0];
        assert_eq!(review.state, "plugin_review_review");
        assert_eq!(review.entry_event, "plugin_review_review_start");
        assert_eq!(review.exit_event, "plugin_review_review_done");
        assert_eq!(review.after.as_deref(), Some("implementing"));
        assert_eq!(review.before, None);
        // "review" itself is not longer than the phase name.
        assert_eq!(review.guards.len(), 1);
        assert_eq!(
            review
                .effects
                .iter()
                .map(|e| (e.name.as_str(), e.critical))
                .collect::<Vec<_>>(),
            vec![("review_notify", true), ("review_log", false)]
        );

        let audit = &phases[1];
        assert!(audit.guards.is_empty());
        assert!(audit.effects[0].critical);
    }

    #[tokio::test]
    async fn test_guard_fn() {
        let (adapter, handle) = adapter(|request| {
            let passed = request["params"]["name"] == "review_ready";
            vec![reply(request, json!({"passed": passed, "reason": "checked"}))]
        });
        let cancel = CancellationToken::new();

        assert!(adapter.guard_fn("review_ready")(cancel.clone(), work_unit()).await);
        assert!(!adapter.guard_fn("lint_ok")(cancel.clone(), work_unit()).await);

        let request = &handle.requests()[0];
        assert_eq!(request["method"], "workflow.evaluateGuard");
        assert_eq!(request["params"]["workUnit"]["title"], "Add login");
    }

    #[tokio::test]
    async fn test_guard_error_is_false() {
        let (adapter, _handle) = adapter(|request| {
            vec![json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32000, "message": "guard crashed"},
            })]
        });

        let cancel = CancellationToken::new();
        assert!(adapter
            .evaluate_guard(&cancel, "review_ready", &work_unit())
            .await
            .is_err());
        assert!(!adapter.guard_fn("review_ready")(cancel, work_unit()).await);
    }

    #[tokio::test]
    async fn test_effect_failure_reported() {
        let (adapter, handle) = adapter(|request| {
            let result = match request["params"]["name"].as_str() {
                Some("review_log") => json!({"success": true}),
                Some("review_notify") => json!({"success": false, "error": "smtp down"}),
                _ => json!({"success": false}),
            };
            vec![reply(request, result)]
        });
        let cancel = CancellationToken::new();
        let mut data = Map::new();
        data.insert("channel".into(), json!("#dev"));

        adapter
            .execute_effect(&cancel, "review_log", &work_unit(), data)
            .await
            .unwrap();
        let err = adapter
            .execute_effect(&cancel, "review_notify", &work_unit(), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::EffectFailed { ref message, .. } if message == "smtp down"));

        let requests = handle.requests();
        assert_eq!(requests[0]["params"]["data"], json!({"channel": "#dev"}));
        assert!(requests[1]["params"].get("data").is_none());
    }

    fn local_effect(name: &str, critical: bool, fail: bool, runs: Arc<AtomicUsize>) -> CriticalEffect {
        let name_owned = name.to_string();
        CriticalEffect {
            name: name.to_string(),
            critical,
            effect: Arc::new(move |_cancel: CancellationToken, _unit: WorkUnit| -> BoxFuture<'static, Result<()>> {
                let runs = Arc::clone(&runs);
                let name = name_owned.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(PluginError::EffectFailed {
                            name,
                            message: "nope".to_string(),
                        })
                    } else {
                        Ok(())
                    }
                })
            }),
        }
    }

    #[tokio::test]
    async fn test_run_effects_blocking_and_advisory() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let advisory = [
            local_effect("a", false, true, runs.clone()),
            local_effect("b", false, false, runs.clone()),
        ];
        run_effects(&cancel, &advisory, &work_unit()).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let blocking = [
            local_effect("c", true, true, runs.clone()),
            local_effect("d", false, false, runs.clone()),
        ];
        let err = run_effects(&cancel, &blocking, &work_unit())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::CriticalEffect { ref name, .. } if name == "c"));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_initialize_replaces_extensions() {
        let (process, handle) = testing::connect("review", |request| {
            let result = match request_method(request) {
                "workflow.init" => json!({"phases": [{"name": "qa"}]}),
                _ => Value::Null,
            };
            vec![reply(request, result)]
        });
        let mut adapter = WorkflowAdapter::new(manifest(), Arc::new(process)).with_extensions(init());

        let mut config = PluginConfig::new();
        config.insert("strict".into(), json!(true));
        adapter
            .initialize(&CancellationToken::new(), config)
            .await
            .unwrap();

        assert_eq!(adapter.phases().len(), 1);
        assert!(adapter.guards().is_empty());
        assert!(adapter.effect_info("review_notify").is_none());
        assert_eq!(handle.requests()[0]["params"]["config"]["strict"], true);
    }
}
