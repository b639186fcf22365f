//! Wire protocol
//!
//! Plugins speak JSON-RPC 2.0 with one JSON object per line. Every method has
//! its own params and result type; the only open-ended payload is the
//! configuration object handed to the init method.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

// Reserved JSON-RPC codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application codes
pub const PLUGIN_ERROR: i64 = -32000;
pub const NOT_IMPLEMENTED: i64 = -32001;
pub const CAPABILITY_ERROR: i64 = -32002;

/// Method names
pub mod methods {
    pub const INIT: &str = "init";
    pub const SHUTDOWN: &str = "shutdown";

    pub const PROVIDER_INIT: &str = "provider.init";
    pub const AGENT_INIT: &str = "agent.init";
    pub const WORKFLOW_INIT: &str = "workflow.init";

    pub const PROVIDER_MATCH: &str = "provider.match";
    pub const PROVIDER_PARSE: &str = "provider.parse";
    pub const PROVIDER_FETCH: &str = "provider.fetch";
    pub const PROVIDER_LIST: &str = "provider.list";
    pub const PROVIDER_ADD_COMMENT: &str = "provider.addComment";
    pub const PROVIDER_UPDATE_STATUS: &str = "provider.updateStatus";
    pub const PROVIDER_ADD_LABELS: &str = "provider.addLabels";
    pub const PROVIDER_REMOVE_LABELS: &str = "provider.removeLabels";
    pub const PROVIDER_CREATE_PR: &str = "provider.createPR";
    pub const PROVIDER_LINK_BRANCH: &str = "provider.linkBranch";
    pub const PROVIDER_UNLINK_BRANCH: &str = "provider.unlinkBranch";
    pub const PROVIDER_GET_LINKED_BRANCH: &str = "provider.getLinkedBranch";
    pub const PROVIDER_DOWNLOAD_ATTACHMENT: &str = "provider.downloadAttachment";
    pub const PROVIDER_SNAPSHOT: &str = "provider.snapshot";
    pub const PROVIDER_FETCH_COMMENTS: &str = "provider.fetchComments";

    pub const AGENT_AVAILABLE: &str = "agent.available";
    pub const AGENT_RUN: &str = "agent.run";

    pub const WORKFLOW_EVALUATE_GUARD: &str = "workflow.evaluateGuard";
    pub const WORKFLOW_EXECUTE_EFFECT: &str = "workflow.executeEffect";
}

/// Open key/value configuration passed to a plugin at init time.
pub type PluginConfig = Map<String, Value>;

/// Outgoing call
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    /// A `null` params value is left off the wire.
    pub fn new(id: i64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params: (!params.is_null()).then_some(params),
        }
    }
}

/// Reply to a [`Request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: i64, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// The result value, or the error the plugin sent. A missing result is `null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Message without an id; never answered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error object sent by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Any line read from a plugin, before classification.
///
/// Whether it is a response depends on the pending-call table, not on its
/// shape: only an `id` that is currently awaited makes a response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl IncomingMessage {
    /// Convert to a response for `id`.
    pub fn into_response(self, id: i64) -> Response {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: self.result,
            error: self.error,
        }
    }
}

/// Type tag of an agent stream event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StreamEventType {
    Text,
    ToolUse,
    ToolResult,
    File,
    Usage,
    Complete,
    Error,
    /// Tag outside the fixed vocabulary
    Other(String),
}

impl StreamEventType {
    pub fn as_str(&self) -> &str {
        match self {
            StreamEventType::Text => "text",
            StreamEventType::ToolUse => "tool_use",
            StreamEventType::ToolResult => "tool_result",
            StreamEventType::File => "file",
            StreamEventType::Usage => "usage",
            StreamEventType::Complete => "complete",
            StreamEventType::Error => "error",
            StreamEventType::Other(tag) => tag,
        }
    }

    /// `complete` and `error` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEventType::Complete | StreamEventType::Error)
    }
}

impl From<String> for StreamEventType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "text" => StreamEventType::Text,
            "tool_use" => StreamEventType::ToolUse,
            "tool_result" => StreamEventType::ToolResult,
            "file" => StreamEventType::File,
            "usage" => StreamEventType::Usage,
            "complete" => StreamEventType::Complete,
            "error" => StreamEventType::Error,
            _ => StreamEventType::Other(tag),
        }
    }
}

impl From<StreamEventType> for String {
    fn from(t: StreamEventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One streamed notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    /// True if `value` is a stream event with a terminal type.
    pub fn is_terminal_value(value: &Value) -> bool {
        value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| StreamEventType::from(t.to_string()).is_terminal())
    }
}

// -- init ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitParams {
    #[serde(default)]
    pub config: PluginConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitResult {
    pub capabilities: Vec<String>,
}

// -- provider -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchParams {
    pub input: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchResult {
    pub matches: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseParams {
    pub input: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseResult {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchParams {
    pub id: String,
}

/// A work unit as sent by a provider plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkUnitResult {
    pub id: String,
    pub external_id: String,
    pub provider: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: i64,
    pub labels: Option<Vec<String>>,
    pub assignees: Option<Vec<PersonResult>>,
    pub comments: Option<Vec<CommentResult>>,
    pub attachments: Option<Vec<AttachmentResult>>,
    pub subtasks: Option<Vec<String>>,
    pub external_key: String,
    pub task_type: String,
    pub slug: String,
    pub source: Option<SourceInfoResult>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonResult {
    pub id: String,
    pub name: String,
    pub email: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommentResult {
    pub id: String,
    pub body: String,
    pub author: Option<PersonResult>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttachmentResult {
    pub id: String,
    pub name: String,
    pub url: String,
    pub mime_type: String,
    pub size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceInfoResult {
    pub reference: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCommentParams {
    pub work_unit_id: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusParams {
    pub work_unit_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelsParams {
    pub work_unit_id: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnitRef {
    pub work_unit_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchParams {
    pub work_unit_id: String,
    pub branch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkedBranchResult {
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentParams {
    pub work_unit_id: String,
    pub attachment_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentContentResult {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrParams {
    pub work_unit_id: String,
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestResult {
    pub id: String,
    pub number: i64,
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotParams {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotResult {
    pub content: String,
    pub metadata: Option<Map<String, Value>>,
}

// -- agent --------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInitResult {
    pub capabilities: Vec<String>,
    pub metadata: Option<AgentMetadataResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentMetadataResult {
    pub name: String,
    pub version: String,
    pub description: String,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentAvailableResult {
    pub available: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRunParams {
    pub prompt: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

// -- workflow -----------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowInitResult {
    pub phases: Vec<PhaseInfo>,
    pub guards: Vec<GuardInfo>,
    pub effects: Vec<EffectInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseInfo {
    pub name: String,
    pub description: String,
    pub after: String,
    pub before: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectInfo {
    pub name: String,
    pub description: String,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateGuardParams {
    pub name: String,
    pub work_unit: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluateGuardResult {
    pub passed: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteEffectParams {
    pub name: String,
    pub work_unit: Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteEffectResult {
    pub success: bool,
    pub error: String,
    pub data: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope() {
        let params = FetchParams {
            id: "PROJ-1".to_string(),
        };
        let params = serde_json::to_value(params).unwrap();
        let line = serde_json::to_value(Request::new(7, methods::PROVIDER_FETCH, params)).unwrap();
        assert_eq!(
            line,
            json!({"jsonrpc": "2.0", "id": 7, "method": "provider.fetch", "params": {"id": "PROJ-1"}})
        );

        let bare = serde_json::to_value(Request::new(8, methods::SHUTDOWN, Value::Null)).unwrap();
        assert!(bare.get("params").is_none());
    }

    #[test]
    fn test_response_into_result() {
        let ok: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"matches":true}}"#).unwrap();
        assert_eq!(ok.into_result().unwrap(), json!({"matches": true}));

        let empty: Response = serde_json::from_str(r#"{"jsonrpc":"2.0","id":2}"#).unwrap();
        assert_eq!(empty.into_result().unwrap(), Value::Null);

        let err: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        assert_eq!(err.into_result().unwrap_err().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_stream_event_types() {
        let event: StreamEvent =
            serde_json::from_value(json!({"type": "tool_use", "data": {"name": "bash"}})).unwrap();
        assert_eq!(event.event_type, StreamEventType::ToolUse);

        let custom: StreamEvent = serde_json::from_value(json!({"type": "thinking"})).unwrap();
        assert_eq!(custom.event_type, StreamEventType::Other("thinking".to_string()));
        assert_eq!(custom.data, Value::Null);

        assert!(StreamEvent::is_terminal_value(&json!({"type": "complete"})));
        assert!(StreamEvent::is_terminal_value(&json!({"type": "error", "data": "x"})));
        assert!(!StreamEvent::is_terminal_value(&json!({"type": "text"})));
        assert!(!StreamEvent::is_terminal_value(&json!("complete")));
    }

    #[test]
    fn test_work_unit_wire_names() {
        let wu: WorkUnitResult = serde_json::from_value(json!({
            "id": "1",
            "externalId": "PROJ-1",
            "taskType": "bug",
            "createdAt": "2024-01-02T03:04:05Z",
        }))
        .unwrap();
        assert_eq!(wu.external_id, "PROJ-1");
        assert_eq!(wu.task_type, "bug");
        assert!(wu.labels.is_none());
    }
}
