//! Bridge engine between a turn-based coding-agent host and a
//! checkpoint-oriented remote workflow service.
//!
//! The host drives turns: each `stream` call carries the user goal plus any
//! accumulated tool results and expects text deltas followed by zero or
//! more tool calls. The service speaks a different protocol: a long-lived
//! socket pushing cumulative checkpoint snapshots and standalone tool
//! actions. The bridge owns the translation: session lifecycle, socket
//! persistence, checkpoint diffing, tool-call mapping and correlation, and
//! the approval-reconnect handshake.

use std::time::Duration;

/// Timeout for the workflow-service socket handshake.
pub const DEFAULT_SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between protocol-level heartbeat events.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Interval between websocket keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(45);

/// Timeout for HTTP passthrough requests executed on the service's behalf.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for the default REST client.
pub(crate) const DEFAULT_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request timeout for the default REST client.
pub(crate) const DEFAULT_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Workflow definition requested when none is configured.
pub const DEFAULT_WORKFLOW_DEFINITION: &str = "software_development";

/// Execution environment advertised on workflow creation.
pub const DEFAULT_ENVIRONMENT: &str = "web";

/// Request header carrying the host session id.
pub(crate) const HOST_SESSION_HEADER: &str = "x-opencode-session";

mod action_map;
mod adapter;
mod checkpoint;
mod config;
mod errors;
mod host;
mod prompt;
mod protocol;
mod queue;
mod registry;
mod session;
mod shell;
mod socket;
mod store;
mod token;
mod tool_map;

pub use action_map::{map_action, ToolRequest};
pub use adapter::{AbortSignal, ModelAdapter, StreamOptions, TurnStream};
pub use checkpoint::{ChatEntry, CheckpointState, EntryType, ToolInfo};
pub use config::BridgeConfig;
pub use errors::{Error, Result};
pub use host::{FinishReason, HostEvent, Usage};
pub use prompt::{
    extract_agent_reminders, extract_goal, extract_system_prompt, extract_tool_results,
    sanitize_system_prompt, ContentPart, ExtractedToolResult, MessageContent, PromptMessage, Role,
    TextPart, ToolOutput, ToolResultPart,
};
pub use protocol::{
    Action, ActionPayload, ActionResponse, AdditionalContext, CheckpointStatus, ClientEvent,
    Heartbeat, HttpRequestPayload, HttpResponse, McpTool, NewCheckpoint, PlainTextResponse,
    StartRequest, StopWorkflow, ToolApproval,
};
pub use queue::EventQueue;
pub use registry::SessionRegistry;
pub use session::{SessionEvent, SessionKey, WorkflowSession};
pub use shell::{shell_join, shell_quote};
pub use socket::{SocketClient, SocketConfig, SocketEvent};
pub use store::{FileWorkflowIdStore, MemoryWorkflowIdStore, WorkflowIdStore};
pub use token::TokenService;
pub use tool_map::{map_tool, HostToolCall, MappedTool};
