//! Host-facing stream event types.
//!
//! One turn produces `stream-start`, zero or more text blocks, zero or one
//! tool-call group, and exactly one `finish`.

use serde::Serialize;
use serde_json::Value;

/// Event emitted on the host-facing turn stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostEvent {
    StreamStart {
        warnings: Vec<String>,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ToolInputStart {
        id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputEnd {
        id: String,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        usage: Usage,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Error,
}

/// Token usage attached to `finish`. The bridge does not do token-level
/// accounting, so all fields stay unset.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(rename = "inputTokens", skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(rename = "outputTokens", skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(rename = "totalTokens", skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let event = HostEvent::TextDelta {
            id: "t1".into(),
            delta: "Hel".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "text-delta", "id": "t1", "delta": "Hel"})
        );

        let event = HostEvent::Finish {
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::default(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "finish", "finishReason": "tool-calls", "usage": {}})
        );
    }

    #[test]
    fn tool_call_uses_camel_case_fields() {
        let event = HostEvent::ToolCall {
            tool_call_id: "r1".into(),
            tool_name: "read".into(),
            input: json!({"filePath": "a.txt"}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["toolCallId"], "r1");
        assert_eq!(value["toolName"], "read");
    }
}
