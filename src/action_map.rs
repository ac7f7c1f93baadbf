//! Standalone service action -> normalized tool request translation.
//!
//! The inverse vocabulary of the tool mapper: each `run*` action key maps
//! back to the service tool name the mapper understands, with field
//! spellings normalized along the way. Checkpoints and HTTP passthrough are
//! not tool requests and the session handles them directly.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::protocol::{Action, ActionPayload};
use crate::tool_map::str_field;

/// A normalized tool request ready for the tool mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub request_id: String,
    pub tool_name: String,
    pub args: Value,
}

impl ToolRequest {
    pub fn new(request_id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }

    /// A request id for log entries that never carried one.
    pub fn fresh_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Translates a standalone tool action into a normalized request.
/// Actions without a `requestID`, checkpoints, and HTTP passthrough all
/// return `None` without side effects.
pub fn map_action(action: &Action) -> Option<ToolRequest> {
    let request_id = action.request_id.as_deref()?;
    if request_id.is_empty() {
        return None;
    }

    let (tool_name, args) = match &action.payload {
        ActionPayload::NewCheckpoint(_) | ActionPayload::RunHttpRequest(_) => return None,
        ActionPayload::RunReadFile(value) => ("read_file", value.clone()),
        ActionPayload::RunReadFiles(value) => {
            let paths = value
                .get("file_paths")
                .or_else(|| value.get("filepaths"))
                .cloned()
                .unwrap_or(Value::Array(vec![]));
            ("read_files", json!({ "file_paths": paths }))
        }
        ActionPayload::RunWriteFile(value) => {
            let path = str_field(value, &["file_path", "filepath", "filePath"])?;
            let contents = str_field(value, &["contents", "content"]).unwrap_or("");
            (
                "create_file_with_contents",
                json!({ "file_path": path, "contents": contents }),
            )
        }
        ActionPayload::RunEditFile(value) => {
            let path = str_field(value, &["file_path", "filepath", "filePath"])?;
            let old = str_field(value, &["old_str", "old_string", "oldString"]).unwrap_or("");
            let new = str_field(value, &["new_str", "new_string", "newString"]).unwrap_or("");
            (
                "edit_file",
                json!({ "file_path": path, "old_str": old, "new_str": new }),
            )
        }
        ActionPayload::RunShellCommand(value) => ("shell_command", value.clone()),
        ActionPayload::RunCommand(value) => ("run_command", value.clone()),
        ActionPayload::RunGitCommand(value) => ("run_git_command", value.clone()),
        ActionPayload::ListDirectory(value) => ("list_dir", value.clone()),
        ActionPayload::Grep(value) => ("grep", value.clone()),
        ActionPayload::FindFiles(value) => ("find_files", value.clone()),
        ActionPayload::Mkdir(value) => ("mkdir", value.clone()),
        ActionPayload::RunMcpTool(value) => {
            let name = str_field(value, &["name"])?.to_string();
            let args = match value.get("args") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or(Value::Object(Default::default()))
                }
                Some(other) => other.clone(),
                None => Value::Object(Default::default()),
            };
            return Some(ToolRequest::new(request_id, name, args));
        }
    };

    Some(ToolRequest::new(request_id, tool_name, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(frame: Value) -> Action {
        serde_json::from_value(frame).unwrap()
    }

    #[test]
    fn read_files_normalizes_filepaths_spelling() {
        let request = map_action(&action(json!({
            "requestID": "R",
            "runReadFiles": {"filepaths": ["a.txt", "b.txt"]}
        })))
        .unwrap();
        assert_eq!(request.request_id, "R");
        assert_eq!(request.tool_name, "read_files");
        assert_eq!(request.args, json!({"file_paths": ["a.txt", "b.txt"]}));
    }

    #[test]
    fn read_file_maps_to_service_tool_name() {
        let request = map_action(&action(json!({
            "requestID": "r1",
            "runReadFile": {"filepath": "src/main.rs"}
        })))
        .unwrap();
        assert_eq!(request.tool_name, "read_file");
        assert_eq!(request.args["filepath"], "src/main.rs");
    }

    #[test]
    fn write_and_edit_normalize_field_names() {
        let request = map_action(&action(json!({
            "requestID": "r2",
            "runWriteFile": {"filepath": "x.txt", "contents": "body"}
        })))
        .unwrap();
        assert_eq!(request.tool_name, "create_file_with_contents");
        assert_eq!(request.args, json!({"file_path": "x.txt", "contents": "body"}));

        let request = map_action(&action(json!({
            "requestID": "r3",
            "runEditFile": {"filepath": "x.txt", "old_string": "a", "new_string": "b"}
        })))
        .unwrap();
        assert_eq!(request.tool_name, "edit_file");
        assert_eq!(
            request.args,
            json!({"file_path": "x.txt", "old_str": "a", "new_str": "b"})
        );
    }

    #[test]
    fn mcp_tool_decodes_stringified_args() {
        let request = map_action(&action(json!({
            "requestID": "r4",
            "runMCPTool": {"name": "jira_search", "args": "{\"query\":\"bug\"}"}
        })))
        .unwrap();
        assert_eq!(request.tool_name, "jira_search");
        assert_eq!(request.args, json!({"query": "bug"}));
    }

    #[test]
    fn missing_request_id_yields_none() {
        assert!(map_action(&action(json!({
            "runReadFile": {"filepath": "a.txt"}
        })))
        .is_none());
        assert!(map_action(&action(json!({
            "requestID": "",
            "runReadFile": {"filepath": "a.txt"}
        })))
        .is_none());
    }

    #[test]
    fn checkpoint_and_http_are_not_tool_requests() {
        assert!(map_action(&action(json!({
            "requestID": "r5",
            "newCheckpoint": {"status": "RUNNING", "checkpoint": "{}", "goal": ""}
        })))
        .is_none());
        assert!(map_action(&action(json!({
            "requestID": "r6",
            "runHTTPRequest": {"method": "GET", "path": "projects/1"}
        })))
        .is_none());
    }
}
