//! Agent plugins
//!
//! Agents run a prompt and stream events while they work. [`AgentAdapter`]
//! drives an agent plugin through a single `agent.run` stream and converts
//! its wire events into the host's [`Event`] model.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::{methods, AgentAvailableResult, AgentRunParams, StreamEvent};
use crate::{Manifest, PluginError, Process, Result};

/// Kind of agent event; unknown tags are kept as [`EventType::Other`].
pub use crate::protocol::StreamEventType as EventType;

/// Stream of events from one agent run
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Callback invoked for every event of [`Agent::run_with_callback`]
pub type EventCallback<'a> = &'a mut (dyn FnMut(&Event) -> anyhow::Result<()> + Send);

/// A tool invocation reported by the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCall {
    pub name: String,
    pub description: String,
    pub input: Map<String, Value>,
}

/// One event of an agent run
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Structured payload for result, file, usage, error and unknown events
    pub data: Map<String, Value>,
    /// The event's `data` exactly as received
    pub raw: Value,
    pub tool_call: Option<ToolCall>,
    /// Extracted text of a `text` event
    pub text: String,
}

impl Event {
    fn new(event_type: EventType, raw: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data: Map::new(),
            raw,
            tool_call: None,
            text: String::new(),
        }
    }

    /// Convert a wire event by its type tag.
    pub fn from_wire(wire: StreamEvent) -> Self {
        let mut event = Self::new(wire.event_type, wire.data);
        match event.event_type {
            EventType::Text => {
                event.text = match &event.raw {
                    Value::String(text) => text.clone(),
                    Value::Object(obj) => obj
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    _ => String::new(),
                };
            }
            EventType::ToolUse => {
                event.tool_call = serde_json::from_value(event.raw.clone()).ok();
            }
            EventType::Complete => {}
            EventType::Error => {
                event.data = match &event.raw {
                    Value::String(message) => {
                        Map::from_iter([("error".to_string(), Value::from(message.as_str()))])
                    }
                    other => object(other),
                };
            }
            EventType::ToolResult | EventType::File | EventType::Usage | EventType::Other(_) => {
                event.data = object(&event.raw);
            }
        }
        event
    }

    /// Error text carried by an `error` event.
    pub fn error_message(&self) -> Option<String> {
        if self.event_type != EventType::Error {
            return None;
        }
        let message = ["error", "message"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(self.data.clone()).to_string());
        Some(message)
    }
}

fn object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Create,
    Update,
    Delete,
}

/// A file the agent created, changed or removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub operation: FileOp,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

/// Token accounting for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost_usd: f64,
}

impl UsageStats {
    fn add(&mut self, other: UsageStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// Aggregated result of an agent run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub messages: Vec<String>,
    pub summary: String,
    pub tool_calls: Vec<ToolCall>,
    pub files: Vec<FileChange>,
    pub usage: Option<UsageStats>,
    pub duration: Duration,
}

/// Turns the events of a run into a response.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, events: &[Event]) -> Result<AgentResponse>;
}

/// Concatenates text events into a single message.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextResponseParser;

impl ResponseParser for TextResponseParser {
    fn parse(&self, events: &[Event]) -> Result<AgentResponse> {
        let mut response = AgentResponse::default();
        let mut text = String::new();

        for event in events {
            match &event.event_type {
                EventType::Text => text.push_str(&event.text),
                EventType::ToolUse => response.tool_calls.extend(event.tool_call.clone()),
                EventType::Usage => {
                    match serde_json::from_value::<UsageStats>(Value::Object(event.data.clone())) {
                        Ok(usage) => response.usage.get_or_insert_with(UsageStats::default).add(usage),
                        Err(e) => debug!(error = %e, "ignoring malformed usage event"),
                    }
                }
                EventType::File => {
                    match serde_json::from_value::<FileChange>(Value::Object(event.data.clone())) {
                        Ok(file) => response.files.push(file),
                        Err(e) => debug!(error = %e, "ignoring malformed file event"),
                    }
                }
                _ => {}
            }
        }

        if !text.is_empty() {
            response.summary = text.trim().to_string();
            response.messages.push(text);
        }
        Ok(response)
    }
}

/// Feature flags derived from an agent manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub tool_use: bool,
    pub file_operations: bool,
    pub code_execution: bool,
    pub multi_turn: bool,
    pub system_prompt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub capabilities: AgentCapabilities,
}

/// The host's view of an AI agent.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Ok if the agent can accept runs.
    async fn available(&self, cancel: &CancellationToken) -> Result<()>;

    /// Run `prompt` to completion and parse the collected events.
    async fn run(&self, cancel: &CancellationToken, prompt: &str) -> Result<AgentResponse>;

    /// Run `prompt` and yield events as they arrive.
    async fn run_stream(&self, cancel: &CancellationToken, prompt: &str) -> Result<EventStream>;

    /// Run `prompt`, handing every event to `callback` before parsing.
    async fn run_with_callback(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        callback: EventCallback<'_>,
    ) -> Result<AgentResponse>;
}

/// An agent plugin behind the [`Agent`] interface
#[derive(Clone)]
pub struct AgentAdapter {
    manifest: Arc<Manifest>,
    process: Arc<Process>,
    env: HashMap<String, String>,
    parser: Arc<dyn ResponseParser>,
}

impl std::fmt::Debug for AgentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentAdapter")
            .field("plugin", &self.manifest.name)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentAdapter {
    pub fn new(manifest: Arc<Manifest>, process: Arc<Process>) -> Self {
        Self {
            manifest,
            process,
            env: HashMap::new(),
            parser: Arc::new(TextResponseParser),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Environment sent with every run.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// A copy of this adapter with one more environment variable.
    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut adapter = self.clone();
        adapter.env.insert(key.into(), value.into());
        adapter
    }

    /// Plugin agents take no command-line arguments; returns an unchanged copy.
    pub fn with_args<I, S>(&self, _args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clone()
    }

    pub fn with_parser(&self, parser: Arc<dyn ResponseParser>) -> Self {
        Self {
            parser,
            ..self.clone()
        }
    }

    pub fn metadata(&self) -> AgentMetadata {
        let mut capabilities = AgentCapabilities::default();
        if let Some(agent) = &self.manifest.agent {
            capabilities.streaming = agent.streaming;
            for name in &agent.capabilities {
                match name.as_str() {
                    "streaming" => capabilities.streaming = true,
                    "tool_use" => capabilities.tool_use = true,
                    "file_operations" => capabilities.file_operations = true,
                    "code_execution" => capabilities.code_execution = true,
                    "multi_turn" => capabilities.multi_turn = true,
                    "system_prompt" => capabilities.system_prompt = true,
                    _ => {}
                }
            }
        }

        AgentMetadata {
            name: self.name().to_string(),
            version: self.manifest.version.clone(),
            description: self.manifest.description.clone(),
            capabilities,
        }
    }

    async fn collect(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        mut callback: Option<EventCallback<'_>>,
    ) -> Result<AgentResponse> {
        let started = Instant::now();
        let mut stream = self.run_stream(cancel, prompt).await?;

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            let event = event?;
            if let Some(callback) = callback.as_mut() {
                callback(&event).map_err(PluginError::Callback)?;
            }
            events.push(event);
        }

        if let Some(message) = events.iter().find_map(Event::error_message) {
            return Err(PluginError::AgentRun(message));
        }

        let mut response = self.parser.parse(&events)?;
        response.duration = started.elapsed();
        info!(
            plugin = %self.manifest.name,
            events = events.len(),
            duration_ms = response.duration.as_millis() as u64,
            "agent run finished"
        );
        Ok(response)
    }
}

#[async_trait]
impl Agent for AgentAdapter {
    fn name(&self) -> &str {
        self.manifest
            .agent
            .as_ref()
            .map(|a| a.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.manifest.name)
    }

    async fn available(&self, cancel: &CancellationToken) -> Result<()> {
        let result: AgentAvailableResult = self
            .process
            .call(cancel, methods::AGENT_AVAILABLE, ())
            .await?;
        if result.available {
            return Ok(());
        }
        let message = if result.error.is_empty() {
            "agent not available".to_string()
        } else {
            result.error
        };
        Err(PluginError::Plugin {
            plugin: self.manifest.name.clone(),
            message,
        })
    }

    async fn run(&self, cancel: &CancellationToken, prompt: &str) -> Result<AgentResponse> {
        self.collect(cancel, prompt, None).await
    }

    async fn run_stream(&self, cancel: &CancellationToken, prompt: &str) -> Result<EventStream> {
        let params = AgentRunParams {
            prompt: prompt.to_string(),
            env: self.env.clone(),
            options: Map::new(),
        };
        let mut events = self
            .process
            .stream(cancel.clone(), methods::AGENT_RUN, params)
            .await?;

        let cancel = cancel.clone();
        let plugin = self.manifest.name.clone();
        let stream = stream! {
            let mut finished = false;
            while let Some(raw) = events.recv().await {
                let wire: StreamEvent = match serde_json::from_value(raw) {
                    Ok(wire) => wire,
                    Err(e) => {
                        debug!(plugin = %plugin, error = %e, "skipping malformed stream event");
                        continue;
                    }
                };
                let terminal = wire.event_type.is_terminal();
                yield Ok(Event::from_wire(wire));
                if terminal {
                    finished = true;
                    break;
                }
            }

            if !finished {
                if cancel.is_cancelled() {
                    yield Err(PluginError::Cancelled);
                } else {
                    yield Err(PluginError::ProcessExited(plugin.clone()));
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn run_with_callback(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        callback: EventCallback<'_>,
    ) -> Result<AgentResponse> {
        self.collect(cancel, prompt, Some(callback)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, notification, pair, reply, request_method, FakeHandle};
    use serde_json::json;

    fn manifest() -> Arc<Manifest> {
        let yaml = r#"
version: "0.3.0"
name: coder-plugin
type: agent
protocol: "1"
description: Writes code
executable:
  command: ["coder"]
agent:
  name: coder
  streaming: false
  capabilities: [tool_use, streaming, multi_turn]
"#;
        Arc::new(Manifest::parse(yaml).unwrap())
    }

    fn scripted(events: Vec<Value>) -> (AgentAdapter, FakeHandle) {
        let (process, handle) = testing::connect("coder-plugin", move |request| {
            match request_method(request) {
                "agent.run" => {
                    let mut lines = vec![reply(request, Value::Null)];
                    lines.extend(events.iter().cloned().map(notification));
                    lines
                }
                _ => vec![reply(request, json!({"available": true}))],
            }
        });
        (AgentAdapter::new(manifest(), Arc::new(process)), handle)
    }

    fn ev(kind: &str, data: Value) -> Value {
        json!({"type": kind, "data": data})
    }

    #[tokio::test]
    async fn test_run_collects_text_and_tools() {
        let (agent, handle) = scripted(vec![
            ev("text", json!("Hello ")),
            ev("tool_use", json!({"name": "Read", "description": "read file", "input": {"path": "a.rs"}})),
            ev("text", json!({"text": "world"})),
            ev("usage", json!({"input_tokens": 10, "output_tokens": 4})),
            ev("file", json!({"path": "a.rs", "operation": "update"})),
            ev("complete", Value::Null),
            ev("text", json!("after complete")),
        ]);

        let response = agent
            .with_env("API_KEY", "secret")
            .run(&CancellationToken::new(), "do it")
            .await
            .unwrap();

        assert_eq!(response.messages, vec!["Hello world".to_string()]);
        assert_eq!(response.summary, "Hello world");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "Read");
        assert_eq!(response.tool_calls[0].input["path"], "a.rs");
        assert_eq!(response.usage.unwrap().input_tokens, 10);
        assert_eq!(response.files[0].operation, FileOp::Update);

        let request = &handle.requests()[0];
        assert_eq!(request["method"], "agent.run");
        assert_eq!(
            request["params"],
            json!({"prompt": "do it", "env": {"API_KEY": "secret"}})
        );
    }

    #[tokio::test]
    async fn test_stream_skips_malformed_and_keeps_unknown() {
        let (agent, _handle) = scripted(vec![
            json!({"no_type": true}),
            ev("thinking", json!({"step": 1})),
            ev("complete", Value::Null),
        ]);

        let events: Vec<Event> = agent
            .run_stream(&CancellationToken::new(), "x")
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Other("thinking".to_string()));
        assert_eq!(events[0].data["step"], 1);
        assert_eq!(events[1].event_type, EventType::Complete);
    }

    #[tokio::test]
    async fn test_error_event_fails_run() {
        let (agent, _handle) = scripted(vec![
            ev("text", json!("partial")),
            ev("error", json!("rate limited")),
        ]);

        let err = agent
            .run(&CancellationToken::new(), "x")
            .await
            .unwrap_err();

        match err {
            PluginError::AgentRun(message) => assert_eq!(message, "rate limited"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_error_reply_to_run_request() {
        let (process, _handle) = testing::connect("coder-plugin", |request| {
            vec![json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32603, "message": "model offline"},
            })]
        });
        let agent = AgentAdapter::new(manifest(), Arc::new(process));

        let err = agent.run(&CancellationToken::new(), "x").await.unwrap_err();
        assert!(matches!(err, PluginError::AgentRun(m) if m == "model offline"));
    }

    #[tokio::test]
    async fn test_callback_error_aborts() {
        let (agent, _handle) = scripted(vec![
            ev("text", json!("one")),
            ev("text", json!("two")),
            ev("complete", Value::Null),
        ]);
        let mut seen = 0;
        let mut callback = |_: &Event| -> anyhow::Result<()> {
            seen += 1;
            anyhow::bail!("stop here")
        };

        let err = agent
            .run_with_callback(&CancellationToken::new(), "x", &mut callback)
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Callback(_)));
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_callback_sees_every_event() {
        let (agent, _handle) = scripted(vec![
            ev("text", json!("a")),
            ev("usage", json!({"output_tokens": 3})),
            ev("complete", Value::Null),
        ]);
        let mut types = Vec::new();
        let mut callback = |event: &Event| -> anyhow::Result<()> {
            types.push(event.event_type.to_string());
            Ok(())
        };

        let response = agent
            .run_with_callback(&CancellationToken::new(), "x", &mut callback)
            .await
            .unwrap();

        assert_eq!(types, vec!["text", "usage", "complete"]);
        assert_eq!(response.usage.unwrap().output_tokens, 3);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_with_error() {
        let (process, mut plugin) = pair("coder-plugin");
        let agent = AgentAdapter::new(manifest(), Arc::new(process));
        let cancel = CancellationToken::new();

        let mut stream = agent.run_stream(&cancel, "x").await.unwrap();
        plugin.next_request().await;
        plugin.send(&notification(ev("text", json!("hi")))).await;
        assert_eq!(stream.next().await.unwrap().unwrap().text, "hi");

        cancel.cancel();
        assert!(matches!(
            stream.next().await,
            Some(Err(PluginError::Cancelled))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_exit_ends_stream_with_error() {
        let (process, mut plugin) = pair("coder-plugin");
        let agent = AgentAdapter::new(manifest(), Arc::new(process));

        let mut stream = agent
            .run_stream(&CancellationToken::new(), "x")
            .await
            .unwrap();
        plugin.next_request().await;
        drop(plugin);

        assert!(matches!(
            stream.next().await,
            Some(Err(PluginError::ProcessExited(_)))
        ));
    }

    #[tokio::test]
    async fn test_available() {
        let (process, _handle) = testing::connect("coder-plugin", |request| {
            vec![reply(request, json!({"available": false, "error": "missing API key"}))]
        });
        let agent = AgentAdapter::new(manifest(), Arc::new(process));

        let err = agent.available(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("missing API key"));

        let (ok_agent, handle) = scripted(vec![]);
        ok_agent.available(&CancellationToken::new()).await.unwrap();
        assert!(handle.requests()[0].get("params").is_none());
    }

    #[tokio::test]
    async fn test_with_env_copies() {
        let (agent, _handle) = scripted(vec![]);

        let extended = agent.with_env("A", "1").with_env("B", "2");
        let same = extended.with_args(["--verbose"]);

        assert!(agent.env().is_empty());
        assert_eq!(extended.env().len(), 2);
        assert_eq!(same.env(), extended.env());
    }

    #[test]
    fn test_event_conversion() {
        let error = Event::from_wire(serde_json::from_value(ev("error", json!("boom"))).unwrap());
        assert_eq!(error.data["error"], "boom");
        assert_eq!(error.error_message().as_deref(), Some("boom"));

        let structured = Event::from_wire(
            serde_json::from_value(ev("error", json!({"message": "bad", "code": -32000}))).unwrap(),
        );
        assert_eq!(structured.error_message().as_deref(), Some("bad"));

        let tool = Event::from_wire(serde_json::from_value(ev("tool_use", json!("not an object"))).unwrap());
        assert!(tool.tool_call.is_none());
        assert_eq!(tool.raw, json!("not an object"));

        let text = Event::from_wire(serde_json::from_value(ev("text", json!(42))).unwrap());
        assert!(text.text.is_empty());
        assert!(text.error_message().is_none());
    }

    #[tokio::test]
    async fn test_metadata_from_manifest() {
        let (agent, _handle) = scripted(vec![]);

        let metadata = agent.metadata();

        assert_eq!(agent.name(), "coder");
        assert_eq!(metadata.version, "0.3.0");
        assert_eq!(metadata.description, "Writes code");
        assert!(metadata.capabilities.streaming);
        assert!(metadata.capabilities.tool_use);
        assert!(metadata.capabilities.multi_turn);
        assert!(!metadata.capabilities.code_execution);
    }

    #[test]
    fn test_parser_without_text() {
        let response = TextResponseParser.parse(&[]).unwrap();
        assert!(response.messages.is_empty());
        assert!(response.usage.is_none());
    }
}
