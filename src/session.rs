//! Per-session workflow connection and state machine.
//!
//! A session owns at most one socket and the event queue paired with it.
//! The socket's event channel is drained by a spawned task that feeds the
//! queue; the host-facing stream takes from the queue. Checkpoint statuses
//! drive the lifecycle: terminal and turn-boundary statuses tear the
//! connection down, the tool-approval status arms a reconnect that the
//! service triggers by closing the socket.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::action_map::{map_action, ToolRequest};
use crate::checkpoint::CheckpointState;
use crate::config::BridgeConfig;
use crate::errors::{Error, Result};
use crate::protocol::{
    Action, ActionPayload, ActionResponse, ClientEvent, HttpRequestPayload, HttpResponse,
    NewCheckpoint, StartRequest, StopWorkflow, ToolApproval,
};
use crate::queue::EventQueue;
use crate::socket::{SocketClient, SocketConfig, SocketEvent};
use crate::store::WorkflowIdStore;
use crate::token::TokenService;

/// Literal metadata blob attached to every start request.
const WORKFLOW_METADATA: &str = "{\"extended_logging\":false}";

const CLIENT_CAPABILITIES: [&str; 1] = ["shell_command"];

/// Identity of one bridge session: instance, model, and host session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub instance_url: String,
    pub model_id: String,
    pub host_session_id: String,
}

impl SessionKey {
    pub fn new(
        instance_url: impl AsRef<str>,
        model_id: impl Into<String>,
        host_session_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_url: instance_url.as_ref().trim().trim_end_matches('/').to_string(),
            model_id: model_id.into(),
            host_session_id: host_session_id.into(),
        }
    }

    /// Rendering used as the key in the workflow-ID store.
    pub fn storage_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.instance_url, self.model_id, self.host_session_id
        )
    }
}

/// Event delivered to the host-facing stream consumer.
#[derive(Debug)]
pub enum SessionEvent {
    TextDelta(String),
    ToolRequest(ToolRequest),
    Error(String),
}

pub struct WorkflowSession {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    key: SessionKey,
    config: Arc<BridgeConfig>,
    http: reqwest::Client,
    tokens: Arc<TokenService>,
    store: Arc<dyn WorkflowIdStore>,
    state: Mutex<SessionState>,
}

struct SessionState {
    workflow_id: Option<String>,
    socket: Option<SocketClient>,
    queue: Option<Arc<EventQueue<SessionEvent>>>,
    checkpoints: CheckpointState,
    flow_config: Option<Value>,
    flow_config_schema_version: Option<String>,
    start_request_sent: bool,
    pending_approval: bool,
    /// True from construction-with-existing-ID until the first checkpoint
    /// after reconnect has been absorbed. While set, replayed history is
    /// fed to the differ but its deltas are discarded.
    resumed: bool,
    /// Monotonic connection counter; stale drain tasks compare against it
    /// before mutating state.
    connection_seq: u64,
}

impl WorkflowSession {
    pub(crate) fn new(
        key: SessionKey,
        config: Arc<BridgeConfig>,
        http: reqwest::Client,
        tokens: Arc<TokenService>,
        store: Arc<dyn WorkflowIdStore>,
    ) -> Self {
        let workflow_id = store.load(&key);
        let resumed = workflow_id.is_some();
        if resumed {
            debug!(session = %key.host_session_id, workflow_id = ?workflow_id, "resuming persisted workflow");
        }
        Self {
            shared: Arc::new(SessionShared {
                key,
                config,
                http,
                tokens,
                store,
                state: Mutex::new(SessionState {
                    workflow_id,
                    socket: None,
                    queue: None,
                    checkpoints: CheckpointState::new(),
                    flow_config: None,
                    flow_config_schema_version: None,
                    start_request_sent: false,
                    pending_approval: false,
                    resumed,
                    connection_seq: 0,
                }),
            }),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.shared.key
    }

    pub async fn workflow_id(&self) -> Option<String> {
        self.shared.state.lock().await.workflow_id.clone()
    }

    pub async fn start_request_sent(&self) -> bool {
        self.shared.state.lock().await.start_request_sent
    }

    /// Installs the flow config sent with the next start request.
    pub async fn set_flow_config(&self, flow_config: Option<Value>, schema_version: Option<String>) {
        let mut state = self.shared.state.lock().await;
        state.flow_config = flow_config;
        state.flow_config_schema_version = schema_version;
    }

    /// Creates the remote workflow if none exists yet and opens the socket
    /// with a fresh event queue. A no-op when already connected.
    pub async fn ensure_connected(&self, goal: &str) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if state.socket.is_some() && state.queue.is_some() {
            return Ok(());
        }

        if state.workflow_id.is_none() {
            let workflow_id = create_workflow(shared, goal).await?;
            info!(workflow_id = %workflow_id, "workflow created");
            shared.store.save(&shared.key, &workflow_id);
            state.workflow_id = Some(workflow_id);
        }

        let queue = Arc::new(EventQueue::new());
        let token = shared
            .tokens
            .get(shared.config.root_namespace_id.as_deref())
            .await;
        let (socket, events) = SocketClient::connect(
            &shared.config.socket_url(),
            token.as_deref(),
            socket_config(&shared.config),
        )
        .await?;

        state.connection_seq += 1;
        let connection = state.connection_seq;
        state.socket = Some(socket);
        state.queue = Some(queue.clone());
        tokio::spawn(drain_socket(shared.clone(), events, queue, connection));
        Ok(())
    }

    /// Sends the initial start request for a goal. Requires an open socket
    /// and a created workflow.
    pub async fn send_start_request(
        &self,
        goal: &str,
        additional_context: Vec<crate::protocol::AdditionalContext>,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let socket = state.socket.clone().ok_or(Error::NotConnected)?;
        let workflow_id = state.workflow_id.clone().ok_or(Error::NotConnected)?;

        let request = start_request_base(shared, &state, workflow_id);
        let request = StartRequest {
            goal: goal.to_string(),
            additional_context,
            ..request
        };
        if !socket.send(&ClientEvent::StartRequest(request)) {
            return Err(Error::NotConnected);
        }
        debug!(session = %shared.key.host_session_id, "start request sent");
        state.start_request_sent = true;
        Ok(())
    }

    /// Forwards a tool result to the service.
    pub async fn send_tool_result(
        &self,
        request_id: &str,
        output: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let state = self.shared.state.lock().await;
        let socket = state.socket.clone().ok_or(Error::NotConnected)?;
        let response = ActionResponse::plain_text(
            request_id,
            output.to_string(),
            error.unwrap_or("").to_string(),
        );
        if !socket.send(&ClientEvent::ActionResponse(response)) {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Takes the next event, suspending until one arrives or the queue
    /// closes. `None` means the turn's event source is exhausted.
    pub async fn wait_for_event(&self) -> Option<SessionEvent> {
        let queue = { self.shared.state.lock().await.queue.clone() };
        match queue {
            Some(queue) => queue.take().await,
            None => None,
        }
    }

    /// Sends `stopWorkflow` best-effort and tears the connection down.
    /// Idempotent.
    pub async fn abort(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(socket) = &state.socket {
            socket.send(&ClientEvent::StopWorkflow(StopWorkflow {
                reason: "ABORTED".to_string(),
            }));
        }
        close_connection_locked(&mut state);
    }

    /// Tears down the connection without stopping the remote workflow.
    pub(crate) async fn close_connection(&self) {
        let mut state = self.shared.state.lock().await;
        close_connection_locked(&mut state);
    }
}

fn socket_config(config: &BridgeConfig) -> SocketConfig {
    SocketConfig {
        connect_timeout: config.connect_timeout,
        heartbeat_interval: config.heartbeat_interval,
        keepalive_interval: config.keepalive_interval,
    }
}

fn start_request_base(
    shared: &SessionShared,
    state: &SessionState,
    workflow_id: String,
) -> StartRequest {
    StartRequest {
        workflow_id,
        client_version: shared.config.client_version.clone(),
        workflow_definition: shared.config.workflow_definition.clone(),
        goal: String::new(),
        workflow_metadata: WORKFLOW_METADATA.to_string(),
        client_capabilities: CLIENT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        mcp_tools: shared.config.mcp_tools.clone(),
        additional_context: Vec::new(),
        preapproved_tools: shared
            .config
            .mcp_tools
            .iter()
            .map(|tool| tool.name.clone())
            .collect(),
        flow_config: state.flow_config.clone(),
        flow_config_schema_version: state.flow_config_schema_version.clone(),
        approval: None,
    }
}

fn close_connection_locked(state: &mut SessionState) {
    if let Some(socket) = state.socket.take() {
        socket.close();
    }
    if let Some(queue) = state.queue.take() {
        queue.close();
    }
    state.start_request_sent = false;
    state.pending_approval = false;
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn create_workflow(shared: &SessionShared, goal: &str) -> Result<String> {
    let url = shared.config.rest_url("ai/duo_workflows/workflows");
    let mut body = serde_json::json!({
        "goal": goal,
        "workflow_definition": shared.config.workflow_definition,
        "environment": shared.config.environment,
        "allow_agent_to_request_user": true,
    });
    if let Some(project_id) = &shared.config.project_id {
        body["project_id"] = Value::String(project_id.clone());
    }

    let response = shared
        .http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|err| Error::WorkflowCreate(err.to_string()))?;
    let status = response.status();
    let payload: CreateWorkflowResponse = response
        .json()
        .await
        .map_err(|err| Error::WorkflowCreate(err.to_string()))?;

    let detail = payload
        .message
        .clone()
        .or(payload.error.clone())
        .unwrap_or_else(|| format!("status {status}"));
    if !status.is_success() {
        return Err(Error::WorkflowCreate(detail));
    }
    match payload.id {
        Some(Value::String(id)) if !id.is_empty() => Ok(id),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(Error::WorkflowCreate(detail)),
    }
}

/// Drains one connection's socket events into the session queue.
fn drain_socket(
    shared: Arc<SessionShared>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    queue: Arc<EventQueue<SessionEvent>>,
    connection: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Frame(value) => handle_frame(&shared, &queue, value).await,
                SocketEvent::Error(message) => {
                    queue.push(SessionEvent::Error(message));
                }
                SocketEvent::Closed { code, reason } => {
                    handle_closed(&shared, &queue, connection, code, reason).await;
                    break;
                }
            }
        }
    })
}

async fn handle_frame(shared: &Arc<SessionShared>, queue: &Arc<EventQueue<SessionEvent>>, value: Value) {
    let action: Action = match serde_json::from_value(value) {
        Ok(action) => action,
        Err(err) => {
            debug!(error = %err, "dropping unrecognized action frame");
            return;
        }
    };

    match &action.payload {
        ActionPayload::NewCheckpoint(checkpoint) => {
            handle_checkpoint(shared, queue, checkpoint).await;
        }
        ActionPayload::RunHttpRequest(request) => {
            let Some(request_id) = action.request_id.clone() else {
                debug!("http request action without request id dropped");
                return;
            };
            let socket = { shared.state.lock().await.socket.clone() };
            let shared = shared.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let response = execute_http_request(&shared, &request).await;
                if let Some(socket) = socket {
                    socket.send(&ClientEvent::ActionResponse(ActionResponse::http(
                        request_id, response,
                    )));
                }
            });
        }
        _ => match map_action(&action) {
            Some(request) => queue.push(SessionEvent::ToolRequest(request)),
            None => debug!("tool action without request id dropped"),
        },
    }
}

async fn handle_checkpoint(
    shared: &Arc<SessionShared>,
    queue: &Arc<EventQueue<SessionEvent>>,
    checkpoint: &NewCheckpoint,
) {
    let mut state = shared.state.lock().await;
    let deltas = state.checkpoints.extract_agent_text_deltas(&checkpoint.checkpoint);
    if state.resumed {
        state.resumed = false;
        debug!(discarded = deltas.len(), "absorbed replayed checkpoint after resume");
    } else {
        for delta in deltas {
            queue.push(SessionEvent::TextDelta(delta));
        }
    }

    let status = checkpoint.status;
    if status.requires_tool_approval() {
        // The service closes the socket next; the close callback drives the
        // reconnect on this same queue.
        state.pending_approval = true;
        return;
    }
    if status.is_terminal() || status.is_turn_boundary() {
        debug!(?status, "checkpoint ends the turn, closing connection");
        close_connection_locked(&mut state);
    }
}

async fn handle_closed(
    shared: &Arc<SessionShared>,
    queue: &Arc<EventQueue<SessionEvent>>,
    connection: u64,
    code: u16,
    reason: String,
) {
    let mut state = shared.state.lock().await;
    if state.connection_seq != connection {
        return;
    }

    if state.pending_approval {
        state.pending_approval = false;
        info!(code, "socket closed pending tool approval, reconnecting");
        if let Err(err) = reconnect_with_approval(shared, &mut state, queue.clone()).await {
            warn!(error = %err, "approval reconnect failed");
            close_connection_locked(&mut state);
        }
        return;
    }

    debug!(code, reason = %reason, "socket closed");
    if let Some(socket) = state.socket.take() {
        socket.close();
    }
    state.queue = None;
    state.start_request_sent = false;
    queue.close();
}

/// Opens a replacement socket wired to the same queue and sends the
/// approval start-request variant. The host-facing stream never notices
/// the reconnect.
async fn reconnect_with_approval(
    shared: &Arc<SessionShared>,
    state: &mut SessionState,
    queue: Arc<EventQueue<SessionEvent>>,
) -> Result<()> {
    let workflow_id = state.workflow_id.clone().ok_or(Error::NotConnected)?;
    let token = shared
        .tokens
        .get(shared.config.root_namespace_id.as_deref())
        .await;
    let (socket, events) = SocketClient::connect(
        &shared.config.socket_url(),
        token.as_deref(),
        socket_config(&shared.config),
    )
    .await?;

    let request = StartRequest {
        approval: Some(ToolApproval::default()),
        ..start_request_base(shared, state, workflow_id)
    };
    if !socket.send(&ClientEvent::StartRequest(request)) {
        socket.close();
        return Err(Error::NotConnected);
    }

    state.connection_seq += 1;
    let connection = state.connection_seq;
    state.socket = Some(socket);
    state.start_request_sent = true;
    tokio::spawn(drain_socket(shared.clone(), events, queue, connection));
    Ok(())
}

/// Executes a `runHTTPRequest` passthrough against the instance API.
/// Failures are encoded into the response, never raised.
async fn execute_http_request(
    shared: &Arc<SessionShared>,
    request: &HttpRequestPayload,
) -> HttpResponse {
    let url = shared.config.rest_url(&request.path);
    let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = shared
        .http
        .request(method, &url)
        .timeout(shared.config.http_timeout);
    if let Some(body) = &request.body {
        builder = builder
            .header("Content-Type", "application/json")
            .body(body.clone());
    }

    match builder.send().await {
        Ok(response) => {
            let status_code = response.status().as_u16();
            let mut headers = HashMap::new();
            for (name, value) in response.headers() {
                if let Ok(text) = value.to_str() {
                    headers
                        .entry(name.to_string())
                        .or_insert_with(|| text.to_string());
                }
            }
            let body = response.text().await.unwrap_or_default();
            HttpResponse {
                status_code,
                headers,
                body,
                error: String::new(),
            }
        }
        Err(err) => {
            warn!(error = %err, "http passthrough failed");
            HttpResponse::failed(err.to_string())
        }
    }
}
