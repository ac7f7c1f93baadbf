//! Host-facing model adapter.
//!
//! One `stream` call is one host turn: forward fresh tool results, start the
//! workflow on a new goal, then translate session events into the host's
//! stream vocabulary until a tool call or turn boundary ends the turn.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::errors::{Error, Result};
use crate::host::{FinishReason, HostEvent, Usage};
use crate::prompt::{self, PromptMessage};
use crate::protocol::AdditionalContext;
use crate::registry::SessionRegistry;
use crate::session::SessionEvent;
use crate::store::WorkflowIdStore;
use crate::tool_map::{map_tool, HostToolCall, MappedTool};
use crate::HOST_SESSION_HEADER;

const SUB_ID_SEPARATOR: &str = "_sub_";

const FLOW_CONFIG_SCHEMA_VERSION: &str = "v1";

/// Standing rules forwarded as the `user_rule` context item on every start
/// request.
const SYSTEM_RULES: &str = "Work inside the user's repository using the provided tools. \
Prefer minimal, focused changes and never fabricate file contents or command output. \
Surface destructive operations to the user before running them.";

/// System prompt used when the host supplies none.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a software engineering agent working in the \
user's repository. Inspect code with the available tools before changing it, and keep \
your answers concise.";

/// Cooperative cancellation handle for one turn.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once `abort` has been called.
    pub async fn cancelled(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        loop {
            if self.is_aborted() {
                return;
            }
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

/// Options for one host turn.
pub struct StreamOptions {
    pub prompt: Vec<PromptMessage>,
    pub model_id: String,
    /// Provider options document; the session id lives under
    /// `<provider_id>.workflowSessionID`.
    pub provider_options: Option<Value>,
    /// Request headers; the session id falls back to `x-opencode-session`.
    pub headers: HashMap<String, String>,
    pub abort: Option<AbortSignal>,
}

/// Tool-call bookkeeping, reset whenever the host session id changes.
#[derive(Default)]
struct ToolTracking {
    pending: HashSet<String>,
    groups: HashMap<String, MultiCallGroup>,
    sent: HashSet<String>,
    last_sent_goal: Option<String>,
    state_session_id: Option<String>,
}

impl ToolTracking {
    fn reset(&mut self, session_id: String) {
        self.pending.clear();
        self.groups.clear();
        self.sent.clear();
        self.last_sent_goal = None;
        self.state_session_id = Some(session_id);
    }
}

struct MultiCallGroup {
    sub_ids: Vec<String>,
    /// Path labels captured at expansion time, used as keys of the
    /// aggregated result object.
    labels: Vec<String>,
    collected: HashMap<String, String>,
}

/// Host-facing streaming surface over the session registry.
#[derive(Clone)]
pub struct ModelAdapter {
    inner: Arc<AdapterInner>,
}

struct AdapterInner {
    registry: Arc<SessionRegistry>,
    provider_id: String,
    tracking: Mutex<ToolTracking>,
}

impl ModelAdapter {
    pub fn new(config: BridgeConfig, store: Arc<dyn WorkflowIdStore>) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(config, store)?);
        Ok(Self::with_registry(registry))
    }

    /// Builds an adapter over an existing registry; test harnesses use this
    /// to isolate one registry per case.
    pub fn with_registry(registry: Arc<SessionRegistry>) -> Self {
        let provider_id = registry.config().provider_id.clone();
        Self {
            inner: Arc::new(AdapterInner {
                registry,
                provider_id,
                tracking: Mutex::new(ToolTracking::default()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Removes the session for the key and tears down its connection.
    pub async fn dispose_session(&self, model_id: &str, host_session_id: &str) {
        self.inner.registry.dispose(model_id, host_session_id).await;
    }

    /// Starts one turn. Fails synchronously when no session id can be
    /// resolved; every later failure is delivered on the stream as an
    /// `error` event followed by `finish(error)`.
    pub fn stream(&self, options: StreamOptions) -> Result<TurnStream> {
        let session_id = self.resolve_session_id(&options)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        tokio::spawn(run_turn(inner, options, session_id, tx));
        Ok(TurnStream { rx })
    }

    fn resolve_session_id(&self, options: &StreamOptions) -> Result<String> {
        if let Some(provider_options) = &options.provider_options {
            let id = provider_options
                .get(&self.inner.provider_id)
                .and_then(|ns| ns.get("workflowSessionID"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty());
            if let Some(id) = id {
                return Ok(id.to_string());
            }
        }
        for (name, value) in &options.headers {
            if name.eq_ignore_ascii_case(HOST_SESSION_HEADER) {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(value.to_string());
                }
            }
        }
        Err(Error::MissingSessionId)
    }
}

/// Stream of host events for one turn.
pub struct TurnStream {
    rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl TurnStream {
    pub async fn next_event(&mut self) -> Option<HostEvent> {
        self.rx.recv().await
    }

    /// Drains the stream to completion; useful in tests.
    pub async fn collect_events(mut self) -> Vec<HostEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for TurnStream {
    type Item = HostEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn run_turn(
    inner: Arc<AdapterInner>,
    options: StreamOptions,
    session_id: String,
    tx: mpsc::UnboundedSender<HostEvent>,
) {
    let emit = |event: HostEvent| {
        let _ = tx.send(event);
    };

    let goal = prompt::extract_goal(&options.prompt);
    let tool_results = prompt::extract_tool_results(&options.prompt);
    let session = inner.registry.resolve(&options.model_id, &session_id);

    {
        let mut tracking = inner.tracking.lock().await;
        if tracking.state_session_id.as_deref() != Some(session_id.as_str()) {
            debug!(session = %session_id, "host session changed, resetting tool tracking");
            tracking.reset(session_id.clone());
        }
    }

    emit(HostEvent::StreamStart { warnings: vec![] });

    // Before the first start request, results re-presented from a previous
    // process lifetime are unknown to us; mark them sent so phase 1 skips
    // them, and forget the goal suppression.
    if !session.start_request_sent().await {
        let mut tracking = inner.tracking.lock().await;
        for result in &tool_results {
            if !tracking.pending.contains(&result.tool_call_id) {
                tracking.sent.insert(result.tool_call_id.clone());
            }
        }
        tracking.last_sent_goal = None;
    }

    if let Err(err) = session.ensure_connected(&goal).await {
        fail_turn(&emit, err);
        return;
    }

    let abort_watch = options.abort.clone().map(|signal| {
        let session = session.clone();
        tokio::spawn(async move {
            signal.cancelled().await;
            session.abort().await;
        })
    });

    // Phase 1: forward fresh tool results.
    let mut forwarded_fresh = false;
    {
        let mut tracking = inner.tracking.lock().await;
        for result in &tool_results {
            let id = result.tool_call_id.as_str();
            if tracking.sent.contains(id) {
                continue;
            }

            if let Some(split) = id.rfind(SUB_ID_SEPARATOR) {
                let original = id[..split].to_string();
                let completed = match tracking.groups.get_mut(&original) {
                    Some(group) => {
                        let value = result
                            .error
                            .clone()
                            .unwrap_or_else(|| result.output.clone());
                        group.collected.insert(id.to_string(), value);
                        if group.collected.len() == group.sub_ids.len() {
                            Some(aggregate_group(group))
                        } else {
                            None
                        }
                    }
                    None => {
                        tracking.sent.insert(id.to_string());
                        continue;
                    }
                };
                tracking.sent.insert(id.to_string());
                tracking.pending.remove(id);
                forwarded_fresh = true;
                if let Some(aggregated) = completed {
                    if let Err(err) = session.send_tool_result(&original, &aggregated, None).await
                    {
                        stop_watch(&abort_watch);
                        fail_turn(&emit, err);
                        return;
                    }
                    tracking.groups.remove(&original);
                    tracking.pending.remove(&original);
                }
                continue;
            }

            if tracking.pending.contains(id) {
                if let Err(err) = session
                    .send_tool_result(id, &result.output, result.error.as_deref())
                    .await
                {
                    stop_watch(&abort_watch);
                    fail_turn(&emit, err);
                    return;
                }
                tracking.sent.insert(id.to_string());
                tracking.pending.remove(id);
                forwarded_fresh = true;
            } else {
                // Unknown result; consume silently.
                tracking.sent.insert(id.to_string());
            }
        }
    }

    // Phase 2: start the workflow on a new goal.
    if !forwarded_fresh && !goal.is_empty() && !session.start_request_sent().await {
        let suppressed = {
            let tracking = inner.tracking.lock().await;
            tracking.last_sent_goal.as_deref() == Some(goal.as_str())
        };
        if !suppressed {
            let context = build_additional_context(&options.prompt);
            let system_prompt = prompt::extract_system_prompt(&options.prompt);
            let system_prompt = if system_prompt.trim().is_empty() {
                DEFAULT_SYSTEM_PROMPT.to_string()
            } else {
                system_prompt
            };
            let sanitized = prompt::sanitize_system_prompt(&system_prompt);
            session
                .set_flow_config(
                    Some(json!({ "system_prompt": sanitized })),
                    Some(FLOW_CONFIG_SCHEMA_VERSION.to_string()),
                )
                .await;
            if let Err(err) = session.send_start_request(&goal, context).await {
                stop_watch(&abort_watch);
                fail_turn(&emit, err);
                return;
            }
            inner.tracking.lock().await.last_sent_goal = Some(goal.clone());
        }
    }

    // Phase 3: consume session events until the turn ends.
    let mut text_block: Option<String> = None;
    loop {
        match session.wait_for_event().await {
            Some(SessionEvent::TextDelta(delta)) => {
                let id = match &text_block {
                    Some(id) => id.clone(),
                    None => {
                        let id = Uuid::new_v4().to_string();
                        emit(HostEvent::TextStart { id: id.clone() });
                        text_block = Some(id.clone());
                        id
                    }
                };
                emit(HostEvent::TextDelta { id, delta });
            }
            Some(SessionEvent::ToolRequest(request)) => {
                if let Some(id) = text_block.take() {
                    emit(HostEvent::TextEnd { id });
                }
                emit_tool_calls(&inner, &emit, &request.request_id, &request.tool_name, &request.args)
                    .await;
                emit(HostEvent::Finish {
                    finish_reason: FinishReason::ToolCalls,
                    usage: Usage::default(),
                });
                break;
            }
            Some(SessionEvent::Error(message)) => {
                warn!(error = %message, "session error ends the turn");
                emit(HostEvent::Error { error: message });
                emit(HostEvent::Finish {
                    finish_reason: FinishReason::Error,
                    usage: Usage::default(),
                });
                break;
            }
            None => {
                if let Some(id) = text_block.take() {
                    emit(HostEvent::TextEnd { id });
                }
                emit(HostEvent::Finish {
                    finish_reason: FinishReason::Stop,
                    usage: Usage::default(),
                });
                break;
            }
        }
    }

    stop_watch(&abort_watch);
}

fn stop_watch(watch: &Option<tokio::task::JoinHandle<()>>) {
    if let Some(watch) = watch {
        watch.abort();
    }
}

fn fail_turn(emit: &impl Fn(HostEvent), err: Error) {
    warn!(error = %err, "turn failed");
    emit(HostEvent::Error {
        error: err.to_string(),
    });
    emit(HostEvent::Finish {
        finish_reason: FinishReason::Error,
        usage: Usage::default(),
    });
}

fn build_additional_context(messages: &[PromptMessage]) -> Vec<AdditionalContext> {
    let mut context = vec![
        AdditionalContext {
            category: "os_information".to_string(),
            content: os_information(),
        },
        AdditionalContext {
            category: "user_rule".to_string(),
            content: SYSTEM_RULES.to_string(),
        },
    ];
    let reminders = prompt::extract_agent_reminders(messages);
    if !reminders.is_empty() {
        context.push(AdditionalContext {
            category: "agent_context".to_string(),
            content: reminders.join("\n"),
        });
    }
    context
}

fn os_information() -> String {
    format!(
        "OS: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Emits the tool-call event group for one mapped request. Multi-call
/// expansions get derived sub ids and a tracking group for later
/// aggregation.
async fn emit_tool_calls(
    inner: &Arc<AdapterInner>,
    emit: &impl Fn(HostEvent),
    request_id: &str,
    tool_name: &str,
    args: &Value,
) {
    match map_tool(tool_name, args) {
        MappedTool::Many(calls) if !calls.is_empty() => {
            let sub_ids: Vec<String> = (0..calls.len())
                .map(|index| format!("{request_id}{SUB_ID_SEPARATOR}{index}"))
                .collect();
            let labels: Vec<String> = calls
                .iter()
                .map(|call| {
                    call.args
                        .get("filePath")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                })
                .collect();
            {
                let mut tracking = inner.tracking.lock().await;
                for sub_id in &sub_ids {
                    tracking.pending.insert(sub_id.clone());
                }
                tracking.pending.insert(request_id.to_string());
                tracking.groups.insert(
                    request_id.to_string(),
                    MultiCallGroup {
                        sub_ids: sub_ids.clone(),
                        labels,
                        collected: HashMap::new(),
                    },
                );
            }
            for (sub_id, call) in sub_ids.iter().zip(&calls) {
                emit_one_tool_call(emit, sub_id, call);
            }
        }
        MappedTool::Many(_) => {
            debug!(tool = tool_name, "multi-call expansion produced no calls");
        }
        MappedTool::Single(call) => {
            inner
                .tracking
                .lock()
                .await
                .pending
                .insert(request_id.to_string());
            emit_one_tool_call(emit, request_id, &call);
        }
    }
}

fn emit_one_tool_call(emit: &impl Fn(HostEvent), id: &str, call: &HostToolCall) {
    emit(HostEvent::ToolInputStart {
        id: id.to_string(),
        tool_name: call.name.clone(),
    });
    emit(HostEvent::ToolInputDelta {
        id: id.to_string(),
        delta: call.args.to_string(),
    });
    emit(HostEvent::ToolInputEnd { id: id.to_string() });
    emit(HostEvent::ToolCall {
        tool_call_id: id.to_string(),
        tool_name: call.name.clone(),
        input: call.args.clone(),
    });
}

fn aggregate_group(group: &MultiCallGroup) -> String {
    let mut object = Map::new();
    for (index, sub_id) in group.sub_ids.iter().enumerate() {
        let label = group
            .labels
            .get(index)
            .filter(|label| !label.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("file_{index}"));
        let content = group.collected.get(sub_id).cloned().unwrap_or_default();
        object.insert(label, json!({ "content": content }));
    }
    Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryWorkflowIdStore;

    fn adapter() -> ModelAdapter {
        ModelAdapter::new(
            BridgeConfig::new("https://gitlab.example.com"),
            Arc::new(MemoryWorkflowIdStore::new()),
        )
        .unwrap()
    }

    fn options() -> StreamOptions {
        StreamOptions {
            prompt: vec![],
            model_id: "duo-agent".to_string(),
            provider_options: None,
            headers: HashMap::new(),
            abort: None,
        }
    }

    #[tokio::test]
    async fn missing_session_id_fails_synchronously() {
        let adapter = adapter();
        match adapter.stream(options()) {
            Err(Error::MissingSessionId) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected MissingSessionId"),
        }
    }

    #[tokio::test]
    async fn session_id_from_provider_options() {
        let adapter = adapter();
        let mut opts = options();
        opts.provider_options = Some(json!({
            "flowbridge": {"workflowSessionID": "  session-7  "}
        }));
        assert_eq!(adapter.resolve_session_id(&opts).unwrap(), "session-7");
    }

    #[tokio::test]
    async fn session_id_from_header_is_case_insensitive() {
        let adapter = adapter();
        let mut opts = options();
        opts.headers
            .insert("X-OpenCode-Session".to_string(), "hdr-session".to_string());
        assert_eq!(adapter.resolve_session_id(&opts).unwrap(), "hdr-session");
    }

    #[tokio::test]
    async fn blank_provider_option_falls_back_to_header() {
        let adapter = adapter();
        let mut opts = options();
        opts.provider_options = Some(json!({"flowbridge": {"workflowSessionID": "   "}}));
        opts.headers
            .insert("x-opencode-session".to_string(), "fallback".to_string());
        assert_eq!(adapter.resolve_session_id(&opts).unwrap(), "fallback");
    }

    #[test]
    fn aggregate_uses_labels_with_index_fallback() {
        let group = MultiCallGroup {
            sub_ids: vec!["R_sub_0".into(), "R_sub_1".into()],
            labels: vec!["a.txt".into(), String::new()],
            collected: HashMap::from([
                ("R_sub_0".to_string(), "A".to_string()),
                ("R_sub_1".to_string(), "B".to_string()),
            ]),
        };
        let aggregated: Value = serde_json::from_str(&aggregate_group(&group)).unwrap();
        assert_eq!(
            aggregated,
            json!({"a.txt": {"content": "A"}, "file_1": {"content": "B"}})
        );
    }

    #[tokio::test]
    async fn abort_signal_wakes_waiters() {
        let signal = AbortSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        signal.abort();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
        assert!(signal.is_aborted());
        // Aborting again is a no-op.
        signal.abort();
    }

    #[test]
    fn tracking_reset_clears_all_maps() {
        let mut tracking = ToolTracking::default();
        tracking.pending.insert("a".into());
        tracking.sent.insert("b".into());
        tracking.groups.insert(
            "g".into(),
            MultiCallGroup {
                sub_ids: vec![],
                labels: vec![],
                collected: HashMap::new(),
            },
        );
        tracking.last_sent_goal = Some("goal".into());
        tracking.reset("s2".into());
        assert!(tracking.pending.is_empty());
        assert!(tracking.sent.is_empty());
        assert!(tracking.groups.is_empty());
        assert!(tracking.last_sent_goal.is_none());
        assert_eq!(tracking.state_session_id.as_deref(), Some("s2"));
    }
}
