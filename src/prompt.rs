//! Extraction utilities for structured prompt messages.
//!
//! The host hands over a turn as a sequence of messages whose parts arrive
//! as loosely-typed documents. Everything here normalizes that into the
//! strict shapes the adapter works with: the goal, the system prompt, tool
//! results, and agent reminders.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text(TextPart),
    ToolResult(ToolResultPart),
    ToolError(ToolResultPart),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextPart {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub synthetic: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolResultPart {
    #[serde(rename = "toolCallId", default)]
    pub tool_call_id: String,
    #[serde(default)]
    pub output: Option<ToolOutput>,
    /// Legacy single-field shape.
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolOutput {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

/// A tool result normalized across the two wire shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolResult {
    pub tool_call_id: String,
    pub output: String,
    pub error: Option<String>,
}

fn wrapped_user_reminder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)<system-reminder>The user sent the following message:\n(.*?)\nPlease address this message and continue with your tasks\.</system-reminder>",
        )
        .expect("wrapped reminder regex")
    })
}

fn any_reminder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<system-reminder>(.*?)</system-reminder>").expect("reminder regex")
    })
}

fn text_of(message: &PromptMessage) -> String {
    match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// The user goal for this turn: the text of the last user message with
/// reminder blocks removed, except the wrapped-user form whose inner text
/// is the actual message.
pub fn extract_goal(messages: &[PromptMessage]) -> String {
    let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) else {
        return String::new();
    };
    let text = text_of(last_user);
    let text = wrapped_user_reminder().replace_all(&text, "$1");
    let text = any_reminder().replace_all(&text, "");
    text.trim().to_string()
}

/// Concatenates the string content of system messages.
pub fn extract_system_prompt(messages: &[PromptMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == Role::System)
        .filter_map(|m| match &m.content {
            MessageContent::Text(text) => Some(text.as_str()),
            MessageContent::Parts(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reminders attached to the last user message: synthetic text parts count
/// whole, other parts contribute their embedded reminder blocks.
pub fn extract_agent_reminders(messages: &[PromptMessage]) -> Vec<String> {
    let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) else {
        return Vec::new();
    };
    let MessageContent::Parts(parts) = &last_user.content else {
        return Vec::new();
    };

    let mut reminders = Vec::new();
    for part in parts {
        let ContentPart::Text(text) = part else {
            continue;
        };
        if text.synthetic {
            let trimmed = text.text.trim();
            if !trimmed.is_empty() {
                reminders.push(trimmed.to_string());
            }
        } else {
            for capture in any_reminder().captures_iter(&text.text) {
                let inner = capture[1].trim();
                if !inner.is_empty() {
                    reminders.push(inner.to_string());
                }
            }
        }
    }
    reminders
}

/// Collects every tool result across the prompt, normalizing the
/// `output`-typed and legacy `result` shapes.
pub fn extract_tool_results(messages: &[PromptMessage]) -> Vec<ExtractedToolResult> {
    let mut results = Vec::new();
    for message in messages {
        let MessageContent::Parts(parts) = &message.content else {
            continue;
        };
        for part in parts {
            match part {
                ContentPart::ToolResult(part) => results.push(normalize_tool_result(part, false)),
                ContentPart::ToolError(part) => results.push(normalize_tool_result(part, true)),
                _ => {}
            }
        }
    }
    results
}

fn normalize_tool_result(part: &ToolResultPart, error_part: bool) -> ExtractedToolResult {
    let (output, error) = match &part.output {
        Some(output) => match output.kind.as_str() {
            "text" => (value_as_text(&output.value), None),
            "json" => (output.value.to_string(), None),
            "error-text" => (String::new(), Some(value_as_text(&output.value))),
            "error-json" => (String::new(), Some(output.value.to_string())),
            "content" => (join_content_parts(&output.value), None),
            _ => (value_as_text(&output.value), None),
        },
        None => {
            let text = part.result.as_ref().map(value_as_text).unwrap_or_default();
            if error_part {
                (String::new(), Some(text))
            } else {
                (text, None)
            }
        }
    };

    // A tool-error part is an error even when its output claims otherwise.
    let (output, error) = if error_part && error.is_none() {
        (String::new(), Some(output))
    } else {
        (output, error)
    };

    ExtractedToolResult {
        tool_call_id: part.tool_call_id.clone(),
        output,
        error,
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Joins the `text`-typed sub-parts of a `content` output with newlines.
fn join_content_parts(value: &Value) -> String {
    let Some(parts) = value.as_array() else {
        return value_as_text(value);
    };
    parts
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

const HOST_PRODUCT_NAME: &str = "opencode";
const SERVICE_PRODUCT_NAME: &str = "GitLab Duo Agent Platform";

fn host_identity_phrase() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)you are opencode[^.\n]*\.\s*").expect("identity regex")
    })
}

fn host_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://(?:www\.)?opencode\.ai[^\s)]*").expect("url regex"))
}

fn excess_blank_lines() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("blank line regex"))
}

/// Strips host identity phrasing and URLs from a system prompt and rewrites
/// the host product name to the service's.
pub fn sanitize_system_prompt(prompt: &str) -> String {
    let text = host_identity_phrase().replace_all(prompt, "");
    let text = host_url().replace_all(&text, "");
    let text = text
        .replace(HOST_PRODUCT_NAME, SERVICE_PRODUCT_NAME)
        .replace("OpenCode", SERVICE_PRODUCT_NAME);
    excess_blank_lines()
        .replace_all(&text, "\n\n")
        .trim()
        .to_string()
}
