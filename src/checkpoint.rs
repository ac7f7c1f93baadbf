//! Checkpoint snapshot differ.
//!
//! Checkpoints are cumulative: each snapshot carries the whole UI chat log
//! observed so far, with agent entries growing by prefix. The differ keeps
//! the last seen log and emits only the text that is new, preserving
//! incremental streaming across snapshots.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use crate::action_map::ToolRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    User,
    Agent,
    Tool,
    Request,
}

/// One entry of the checkpoint's `ui_chat_log`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatEntry {
    pub message_type: EntryType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tool_info: Option<ToolInfo>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub tool_response: Option<Value>,
}

/// Log entries observed so far plus the request indices already handed out.
#[derive(Default)]
pub struct CheckpointState {
    log: Vec<ChatEntry>,
    processed_request_indices: HashSet<usize>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts the agent text that is new relative to the previous
    /// snapshot, then replaces the retained log with the new one.
    ///
    /// For each agent entry: a new index emits its full content, a pure
    /// prefix extension emits the suffix, and a prefix divergence restarts
    /// with the full new content. Non-agent entries are retained but never
    /// produce deltas. A snapshot that fails to parse leaves the state
    /// untouched and emits nothing.
    pub fn extract_agent_text_deltas(&mut self, raw: &str) -> Vec<String> {
        let Some(new_log) = parse_chat_log(raw) else {
            return Vec::new();
        };

        let mut deltas = Vec::new();
        for (index, entry) in new_log.iter().enumerate() {
            if entry.message_type != EntryType::Agent {
                continue;
            }
            let previous = self
                .log
                .get(index)
                .filter(|prev| prev.message_type == EntryType::Agent)
                .map(|prev| prev.content.as_str());
            match previous {
                None => {
                    if !entry.content.is_empty() {
                        deltas.push(entry.content.clone());
                    }
                }
                Some(prev) if entry.content == prev => {}
                Some(prev) if entry.content.starts_with(prev) => {
                    deltas.push(entry.content[prev.len()..].to_string());
                }
                Some(_) => {
                    if !entry.content.is_empty() {
                        deltas.push(entry.content.clone());
                    }
                }
            }
        }

        self.log = new_log;
        deltas
    }

    /// Extracts tool requests embedded in the chat log itself, one per
    /// `request` entry carrying `tool_info` at an index not yet handed out.
    ///
    /// The session currently drives tool flow from standalone actions and
    /// does not call this from its checkpoint handler; it is kept for the
    /// in-checkpoint request form of the protocol.
    pub fn extract_tool_requests(&mut self, raw: &str) -> Vec<ToolRequest> {
        let Some(new_log) = parse_chat_log(raw) else {
            return Vec::new();
        };

        let mut requests = Vec::new();
        for (index, entry) in new_log.iter().enumerate() {
            if entry.message_type != EntryType::Request {
                continue;
            }
            let Some(tool_info) = &entry.tool_info else {
                continue;
            };
            if !self.processed_request_indices.insert(index) {
                continue;
            }
            let request_id = entry
                .correlation_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(ToolRequest::fresh_id);
            requests.push(ToolRequest::new(
                request_id,
                tool_info.name.clone(),
                tool_info.args.clone(),
            ));
        }
        requests
    }
}

/// Parses a checkpoint document down to its chat log, dropping entries
/// that do not carry a valid `message_type`.
fn parse_chat_log(raw: &str) -> Option<Vec<ChatEntry>> {
    let document: Value = serde_json::from_str(raw).ok()?;
    let entries = document
        .get("channel_values")?
        .get("ui_chat_log")?
        .as_array()?;
    Some(
        entries
            .iter()
            .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(entries: Value) -> String {
        json!({"channel_values": {"ui_chat_log": entries}}).to_string()
    }

    #[test]
    fn new_agent_entry_emits_full_content() {
        let mut state = CheckpointState::new();
        let deltas = state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "Hel"}
        ])));
        assert_eq!(deltas, vec!["Hel"]);
    }

    #[test]
    fn prefix_growth_emits_suffixes() {
        let mut state = CheckpointState::new();
        state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "Hel"}
        ])));
        let deltas = state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "Hello."}
        ])));
        assert_eq!(deltas, vec!["lo."]);
    }

    #[test]
    fn unchanged_content_emits_nothing() {
        let mut state = CheckpointState::new();
        let raw = snapshot(json!([{"message_type": "agent", "content": "same"}]));
        state.extract_agent_text_deltas(&raw);
        assert!(state.extract_agent_text_deltas(&raw).is_empty());
    }

    #[test]
    fn prefix_divergence_restarts_with_full_content() {
        let mut state = CheckpointState::new();
        state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "first draft"}
        ])));
        let deltas = state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "rewritten"}
        ])));
        assert_eq!(deltas, vec!["rewritten"]);
    }

    #[test]
    fn concatenated_deltas_equal_final_content() {
        // Monotone prefix growth across many snapshots reconstructs the
        // final content exactly.
        let full = "The quick brown fox jumps over the lazy dog";
        let mut state = CheckpointState::new();
        let mut collected = String::new();
        for end in [4, 9, 19, 25, full.len()] {
            let deltas = state.extract_agent_text_deltas(&snapshot(json!([
                {"message_type": "user", "content": "hi"},
                {"message_type": "agent", "content": &full[..end]}
            ])));
            collected.extend(deltas);
        }
        assert_eq!(collected, full);
    }

    #[test]
    fn non_agent_entries_never_emit() {
        let mut state = CheckpointState::new();
        let deltas = state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "user", "content": "hi"},
            {"message_type": "tool", "content": "ran thing"},
            {"message_type": "request", "content": "pending"}
        ])));
        assert!(deltas.is_empty());
    }

    #[test]
    fn entry_replacing_non_agent_emits_full_content() {
        let mut state = CheckpointState::new();
        state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "tool", "content": "output"}
        ])));
        let deltas = state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "now text"}
        ])));
        assert_eq!(deltas, vec!["now text"]);
    }

    #[test]
    fn invalid_snapshot_leaves_state_untouched() {
        let mut state = CheckpointState::new();
        state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "kept"}
        ])));
        assert!(state.extract_agent_text_deltas("{not json").is_empty());
        // Prior log survives: identical content still diffs to nothing.
        let deltas = state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "kept"}
        ])));
        assert!(deltas.is_empty());
    }

    #[test]
    fn invalid_entries_are_dropped() {
        let mut state = CheckpointState::new();
        let deltas = state.extract_agent_text_deltas(&snapshot(json!([
            {"message_type": "agent", "content": "ok"},
            {"no_type": true},
            "not even an object"
        ])));
        assert_eq!(deltas, vec!["ok"]);
    }

    #[test]
    fn tool_requests_emit_once_per_index() {
        let mut state = CheckpointState::new();
        let raw = snapshot(json!([
            {"message_type": "request", "content": "", "correlation_id": "c1",
             "tool_info": {"name": "read_file", "args": {"file_path": "a.txt"}}}
        ]));
        let requests = state.extract_tool_requests(&raw);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id, "c1");
        assert_eq!(requests[0].tool_name, "read_file");

        // Same snapshot again: index already processed.
        assert!(state.extract_tool_requests(&raw).is_empty());
    }

    #[test]
    fn tool_request_without_correlation_gets_fresh_id() {
        let mut state = CheckpointState::new();
        let requests = state.extract_tool_requests(&snapshot(json!([
            {"message_type": "request", "content": "",
             "tool_info": {"name": "grep", "args": {"pattern": "x"}}}
        ])));
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].request_id.is_empty());
    }

    #[test]
    fn request_entry_without_tool_info_is_skipped() {
        let mut state = CheckpointState::new();
        let requests = state.extract_tool_requests(&snapshot(json!([
            {"message_type": "request", "content": "no tool info"}
        ])));
        assert!(requests.is_empty());
    }
}
