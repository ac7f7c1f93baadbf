//! Wire types for the workflow service socket protocol.
//!
//! Client events are externally tagged single-key JSON objects. Service
//! actions arrive the same way, with an optional top-level `requestID`
//! alongside the payload key. Frames that parse as JSON but carry an
//! unrecognized key are dropped by the session at debug level; only
//! non-JSON frames are decode errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client -> service event frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientEvent {
    #[serde(rename = "startRequest")]
    StartRequest(StartRequest),
    #[serde(rename = "actionResponse")]
    ActionResponse(ActionResponse),
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),
    #[serde(rename = "stopWorkflow")]
    StopWorkflow(StopWorkflow),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopWorkflow {
    pub reason: String,
}

/// Start (or approval-resume) request for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartRequest {
    #[serde(rename = "workflowID")]
    pub workflow_id: String,
    #[serde(rename = "clientVersion")]
    pub client_version: String,
    #[serde(rename = "workflowDefinition")]
    pub workflow_definition: String,
    pub goal: String,
    #[serde(rename = "workflowMetadata")]
    pub workflow_metadata: String,
    #[serde(rename = "clientCapabilities")]
    pub client_capabilities: Vec<String>,
    #[serde(rename = "mcpTools")]
    pub mcp_tools: Vec<McpTool>,
    pub additional_context: Vec<AdditionalContext>,
    pub preapproved_tools: Vec<String>,
    #[serde(rename = "flowConfig", skip_serializing_if = "Option::is_none")]
    pub flow_config: Option<Value>,
    #[serde(rename = "flowConfigSchemaVersion", skip_serializing_if = "Option::is_none")]
    pub flow_config_schema_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ToolApproval>,
}

/// The approval handshake payload: the service expects a nested empty
/// `approval` object on the resume start request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolApproval {
    pub approval: serde_json::Map<String, Value>,
}

/// MCP tool advertised to the service on start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Extra context item attached to a start request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdditionalContext {
    pub category: String,
    pub content: String,
}

/// Reply to a service action: exactly one of the response payloads is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "plainTextResponse", skip_serializing_if = "Option::is_none")]
    pub plain_text_response: Option<PlainTextResponse>,
    #[serde(rename = "httpResponse", skip_serializing_if = "Option::is_none")]
    pub http_response: Option<HttpResponse>,
}

impl ActionResponse {
    pub fn plain_text(request_id: impl Into<String>, response: String, error: String) -> Self {
        Self {
            request_id: request_id.into(),
            plain_text_response: Some(PlainTextResponse { response, error }),
            http_response: None,
        }
    }

    pub fn http(request_id: impl Into<String>, response: HttpResponse) -> Self {
        Self {
            request_id: request_id.into(),
            plain_text_response: None,
            http_response: Some(response),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlainTextResponse {
    pub response: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub error: String,
}

impl HttpResponse {
    /// The shape reported back when the passthrough request itself failed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status_code: 0,
            headers: HashMap::new(),
            body: String::new(),
            error: error.into(),
        }
    }
}

/// Service -> client action frame.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Action {
    #[serde(rename = "requestID", default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub payload: ActionPayload,
}

/// The single payload key carried by an action frame.
///
/// Tool payloads stay as raw JSON here; the action mapper extracts fields
/// liberally (the service has shipped several spellings of path fields).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub enum ActionPayload {
    #[serde(rename = "newCheckpoint")]
    NewCheckpoint(NewCheckpoint),
    #[serde(rename = "runHTTPRequest")]
    RunHttpRequest(HttpRequestPayload),
    #[serde(rename = "runReadFile")]
    RunReadFile(Value),
    #[serde(rename = "runReadFiles")]
    RunReadFiles(Value),
    #[serde(rename = "runWriteFile")]
    RunWriteFile(Value),
    #[serde(rename = "runEditFile")]
    RunEditFile(Value),
    #[serde(rename = "runShellCommand")]
    RunShellCommand(Value),
    #[serde(rename = "runCommand")]
    RunCommand(Value),
    #[serde(rename = "runGitCommand")]
    RunGitCommand(Value),
    #[serde(rename = "listDirectory")]
    ListDirectory(Value),
    #[serde(rename = "grep")]
    Grep(Value),
    #[serde(rename = "findFiles")]
    FindFiles(Value),
    #[serde(rename = "runMCPTool")]
    RunMcpTool(Value),
    #[serde(rename = "mkdir")]
    Mkdir(Value),
}

/// Checkpoint snapshot pushed by the service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NewCheckpoint {
    pub status: CheckpointStatus,
    /// The cumulative checkpoint document, JSON-encoded as a string.
    #[serde(default)]
    pub checkpoint: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub errors: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "INPUT_REQUIRED")]
    InputRequired,
    #[serde(rename = "PLAN_APPROVAL_REQUIRED")]
    PlanApprovalRequired,
    #[serde(rename = "TOOL_CALL_APPROVAL_REQUIRED")]
    ToolCallApprovalRequired,
    /// Forward compatibility with statuses this client does not know.
    #[serde(other)]
    Unknown,
}

impl CheckpointStatus {
    /// The workflow is done; the connection will not produce further turns.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }

    /// The workflow is waiting for the next user turn.
    pub fn is_turn_boundary(self) -> bool {
        matches!(self, Self::InputRequired | Self::PlanApprovalRequired)
    }

    /// The service wants the approval-reconnect handshake before running a
    /// protected tool.
    pub fn requires_tool_approval(self) -> bool {
        matches!(self, Self::ToolCallApprovalRequired)
    }
}

/// Payload of a `runHTTPRequest` action.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HttpRequestPayload {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}
