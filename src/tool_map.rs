//! Service tool name -> host tool call translation.
//!
//! The service speaks its own tool vocabulary (`read_file`, `shell_command`,
//! ...); the host speaks another (`read`, `bash`, ...). Mapping is pure:
//! one service call becomes one host call, or several for `read_files`.
//! Five sentinel program names route through `run_command` to dedicated
//! host tools; their JSON payloads are validated here and failures are
//! signalled as a synthetic `invalid` tool call instead of an error.

use serde_json::{json, Map, Value};

use crate::shell::{shell_join, shell_quote};

/// A single host-native tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct HostToolCall {
    pub name: String,
    pub args: Value,
}

impl HostToolCall {
    fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Result of mapping one service tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum MappedTool {
    Single(HostToolCall),
    Many(Vec<HostToolCall>),
}

const BRIDGE_PROGRAMS: [(&str, &str); 5] = [
    ("__todo_read__", "todoread"),
    ("__todo_write__", "todowrite"),
    ("__webfetch__", "webfetch"),
    ("__question__", "question"),
    ("__skill__", "skill"),
];

const TODO_STATUSES: [&str; 4] = ["pending", "in_progress", "completed", "cancelled"];
const TODO_PRIORITIES: [&str; 3] = ["high", "medium", "low"];
const WEBFETCH_FORMATS: [&str; 3] = ["text", "markdown", "html"];

/// Maps a service tool invocation to one or more host tool calls.
/// Unrecognized names pass through unchanged.
pub fn map_tool(service_name: &str, args: &Value) -> MappedTool {
    match service_name {
        "list_dir" => {
            let directory = str_field(args, &["directory"])
                .filter(|d| !d.is_empty())
                .unwrap_or(".");
            single("read", json!({ "filePath": directory }))
        }
        "read_file" => {
            let Some(path) = str_field(args, &["file_path", "filepath", "filePath", "path"])
            else {
                return passthrough(service_name, args);
            };
            let mut read_args = Map::new();
            read_args.insert("filePath".into(), Value::String(path.to_string()));
            for field in ["offset", "limit"] {
                if let Some(value) = args.get(field).filter(|v| v.is_number()) {
                    read_args.insert(field.into(), value.clone());
                }
            }
            single("read", Value::Object(read_args))
        }
        "read_files" => {
            let paths: Vec<&str> = args
                .get("file_paths")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if paths.is_empty() {
                return passthrough(service_name, args);
            }
            MappedTool::Many(
                paths
                    .into_iter()
                    .map(|path| HostToolCall::new("read", json!({ "filePath": path })))
                    .collect(),
            )
        }
        "create_file_with_contents" => {
            let (Some(path), Some(contents)) = (
                str_field(args, &["file_path"]),
                str_field(args, &["contents"]),
            ) else {
                return passthrough(service_name, args);
            };
            single("write", json!({ "filePath": path, "content": contents }))
        }
        "edit_file" => {
            let (Some(path), Some(old), Some(new)) = (
                str_field(args, &["file_path"]),
                str_field(args, &["old_str"]),
                str_field(args, &["new_str"]),
            ) else {
                return passthrough(service_name, args);
            };
            single(
                "edit",
                json!({ "filePath": path, "oldString": old, "newString": new }),
            )
        }
        "find_files" => {
            let Some(pattern) = str_field(args, &["name_pattern"]) else {
                return passthrough(service_name, args);
            };
            single("glob", json!({ "pattern": pattern }))
        }
        "grep" => {
            let Some(pattern) = str_field(args, &["pattern"]) else {
                return passthrough(service_name, args);
            };
            let case_insensitive = args
                .get("case_insensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let pattern = if case_insensitive && !pattern.starts_with("(?i)") {
                format!("(?i){pattern}")
            } else {
                pattern.to_string()
            };
            let mut grep_args = Map::new();
            grep_args.insert("pattern".into(), Value::String(pattern));
            if let Some(dir) = str_field(args, &["search_directory"]).filter(|d| !d.is_empty()) {
                grep_args.insert("path".into(), Value::String(dir.to_string()));
            }
            single("grep", Value::Object(grep_args))
        }
        "mkdir" => {
            let Some(path) = str_field(args, &["directory_path"]) else {
                return passthrough(service_name, args);
            };
            single(
                "bash",
                json!({ "command": format!("mkdir -p {}", shell_quote(path)) }),
            )
        }
        "shell_command" => {
            let Some(command) = str_field(args, &["command"]) else {
                return passthrough(service_name, args);
            };
            single("bash", json!({ "command": command }))
        }
        "run_command" => map_run_command(args),
        "run_git_command" => {
            let Some(command) = str_field(args, &["command"]) else {
                return passthrough(service_name, args);
            };
            let mut tokens = vec!["git".to_string(), shell_quote(command)];
            if let Some(extra) = args
                .get("args")
                .or_else(|| args.get("arguments"))
                .and_then(Value::as_array)
            {
                tokens.extend(extra.iter().filter_map(Value::as_str).map(shell_quote));
            }
            single("bash", json!({ "command": tokens.join(" ") }))
        }
        "gitlab_api_request" => {
            let Some(path) = str_field(args, &["path"]) else {
                return passthrough(service_name, args);
            };
            let method = str_field(args, &["method"])
                .map(str::to_ascii_uppercase)
                .unwrap_or_else(|| "GET".to_string());
            let body = match args.get("body") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            };
            let url = format!("$GITLAB_URL/api/v4/{}", path.trim_start_matches('/'));
            let mut command = format!(
                "curl -s -X {} -H 'Authorization: Bearer $TOKEN' -H 'Content-Type: application/json'",
                shell_quote(&method)
            );
            if let Some(body) = body {
                command.push_str(" -d ");
                command.push_str(&shell_quote(&body));
            }
            command.push(' ');
            command.push_str(&shell_quote(&url));
            single("bash", json!({ "command": command }))
        }
        _ => passthrough(service_name, args),
    }
}

fn map_run_command(args: &Value) -> MappedTool {
    let program = str_field(args, &["program"]);
    let command = str_field(args, &["command"]);

    // Bridge form 1: the program field names a sentinel, arguments[0] is the
    // JSON payload.
    if let Some(program) = program {
        if let Some(host_tool) = bridge_tool_for(program) {
            let payload = args
                .get("arguments")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str);
            return MappedTool::Single(map_bridge_payload(program, host_tool, payload));
        }
    }

    // Bridge form 2: the sentinel is embedded in a shell command string.
    if let Some(command) = command {
        let trimmed = command.trim_start();
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, Some(rest.trim())),
            None => (trimmed, None),
        };
        if let Some(host_tool) = bridge_tool_for(head) {
            return MappedTool::Single(map_bridge_payload(head, host_tool, rest));
        }
        return single("bash", json!({ "command": command }));
    }

    let Some(program) = program else {
        return passthrough("run_command", args);
    };

    let mut tokens = vec![program.to_string()];
    for field in ["flags", "arguments"] {
        if let Some(values) = args.get(field).and_then(Value::as_array) {
            tokens.extend(values.iter().filter_map(Value::as_str).map(String::from));
        }
    }
    single("bash", json!({ "command": shell_join(&tokens) }))
}

fn bridge_tool_for(program: &str) -> Option<&'static str> {
    BRIDGE_PROGRAMS
        .iter()
        .find(|(sentinel, _)| *sentinel == program)
        .map(|(_, tool)| *tool)
}

/// Parses and validates a bridge tool payload. Every failure is reported as
/// a synthetic `invalid` tool call so the host sees structured errors.
fn map_bridge_payload(program: &str, tool: &'static str, raw: Option<&str>) -> HostToolCall {
    let raw = raw.map(str::trim).unwrap_or("");
    let raw = strip_wrapping_quotes(raw);

    if tool == "todoread" && raw.is_empty() {
        return HostToolCall::new(tool, json!({}));
    }

    let payload: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => {
            return invalid_tool(tool, format!("{program} payload is not valid JSON"));
        }
    };
    let Some(object) = payload.as_object() else {
        return invalid_tool(tool, format!("{program} payload must be a JSON object"));
    };

    match tool {
        "todoread" => HostToolCall::new(tool, json!({})),
        "todowrite" => match validate_todowrite(object) {
            Ok(()) => HostToolCall::new(tool, payload.clone()),
            Err(message) => invalid_tool(tool, message),
        },
        "webfetch" => match validate_webfetch(object) {
            Ok(()) => HostToolCall::new(tool, payload.clone()),
            Err(message) => invalid_tool(tool, message),
        },
        "question" => match validate_question(object) {
            Ok(()) => HostToolCall::new(tool, payload.clone()),
            Err(message) => invalid_tool(tool, message),
        },
        "skill" => match validate_skill(object) {
            Ok(()) => HostToolCall::new(tool, payload.clone()),
            Err(message) => invalid_tool(tool, message),
        },
        _ => invalid_tool(tool, format!("{program} is not a bridge program")),
    }
}

fn validate_todowrite(object: &Map<String, Value>) -> Result<(), String> {
    let Some(todos) = object.get("todos").and_then(Value::as_array) else {
        return Err("todos must be an array".into());
    };
    for (index, todo) in todos.iter().enumerate() {
        let Some(item) = todo.as_object() else {
            return Err(format!("todos[{index}] must be an object"));
        };
        if !item.get("content").is_some_and(Value::is_string) {
            return Err(format!("todos[{index}].content must be a string"));
        }
        let status = item.get("status").and_then(Value::as_str);
        if !status.is_some_and(|s| TODO_STATUSES.contains(&s)) {
            return Err(format!(
                "todos[{index}].status must be one of {}",
                TODO_STATUSES.join(", ")
            ));
        }
        let priority = item.get("priority").and_then(Value::as_str);
        if !priority.is_some_and(|p| TODO_PRIORITIES.contains(&p)) {
            return Err(format!(
                "todos[{index}].priority must be one of {}",
                TODO_PRIORITIES.join(", ")
            ));
        }
    }
    Ok(())
}

fn validate_webfetch(object: &Map<String, Value>) -> Result<(), String> {
    if !object
        .get("url")
        .and_then(Value::as_str)
        .is_some_and(|url| !url.is_empty())
    {
        return Err("url must be a non-empty string".into());
    }
    if let Some(format) = object.get("format") {
        let ok = format
            .as_str()
            .is_some_and(|f| WEBFETCH_FORMATS.contains(&f));
        if !ok {
            return Err(format!(
                "format must be one of {}",
                WEBFETCH_FORMATS.join(", ")
            ));
        }
    }
    if let Some(timeout) = object.get("timeout") {
        if !timeout.as_f64().is_some_and(|t| t > 0.0) {
            return Err("timeout must be a positive number".into());
        }
    }
    Ok(())
}

fn validate_question(object: &Map<String, Value>) -> Result<(), String> {
    let Some(questions) = object.get("questions").and_then(Value::as_array) else {
        return Err("questions must be an array".into());
    };
    if questions.is_empty() {
        return Err("questions must not be empty".into());
    }
    for (index, question) in questions.iter().enumerate() {
        let Some(item) = question.as_object() else {
            return Err(format!("questions[{index}] must be an object"));
        };
        if !item.get("question").is_some_and(Value::is_string) {
            return Err(format!("questions[{index}].question must be a string"));
        }
        if !item.get("header").is_some_and(Value::is_string) {
            return Err(format!("questions[{index}].header must be a string"));
        }
        let Some(options) = item.get("options").and_then(Value::as_array) else {
            return Err(format!("questions[{index}].options must be an array"));
        };
        if options.is_empty() {
            return Err(format!("questions[{index}].options must not be empty"));
        }
        for (opt_index, option) in options.iter().enumerate() {
            let valid = option.as_object().is_some_and(|o| {
                o.get("label").is_some_and(Value::is_string)
                    && o.get("description").is_some_and(Value::is_string)
            });
            if !valid {
                return Err(format!(
                    "questions[{index}].options[{opt_index}] must have label and description"
                ));
            }
        }
        if let Some(multiple) = item.get("multiple") {
            if !multiple.is_boolean() {
                return Err(format!("questions[{index}].multiple must be a boolean"));
            }
        }
    }
    Ok(())
}

fn validate_skill(object: &Map<String, Value>) -> Result<(), String> {
    let ok = object
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| !name.trim().is_empty());
    if ok {
        Ok(())
    } else {
        Err("name must be a non-empty string".into())
    }
}

fn invalid_tool(tool: &str, error: String) -> HostToolCall {
    HostToolCall::new("invalid", json!({ "tool": tool, "error": error }))
}

/// Strips a single layer of wrapping quotes from a raw bridge payload.
fn strip_wrapping_quotes(raw: &str) -> &str {
    if raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')))
    {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

fn single(name: &str, args: Value) -> MappedTool {
    MappedTool::Single(HostToolCall::new(name, args))
}

fn passthrough(name: &str, args: &Value) -> MappedTool {
    MappedTool::Single(HostToolCall::new(name, args.clone()))
}

pub(crate) fn str_field<'a>(args: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| args.get(name)?.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_single(mapped: MappedTool) -> HostToolCall {
        match mapped {
            MappedTool::Single(call) => call,
            MappedTool::Many(calls) => panic!("expected single call, got {calls:?}"),
        }
    }

    #[test]
    fn list_dir_defaults_to_current_directory() {
        let call = expect_single(map_tool("list_dir", &json!({})));
        assert_eq!(call.name, "read");
        assert_eq!(call.args, json!({"filePath": "."}));

        let call = expect_single(map_tool("list_dir", &json!({"directory": "src"})));
        assert_eq!(call.args, json!({"filePath": "src"}));
    }

    #[test]
    fn read_file_accepts_path_spellings() {
        for field in ["file_path", "filepath", "filePath", "path"] {
            let call = expect_single(map_tool("read_file", &json!({ field: "a.rs" })));
            assert_eq!(call.name, "read");
            assert_eq!(call.args["filePath"], "a.rs");
        }
    }

    #[test]
    fn read_file_carries_offset_and_limit() {
        let call = expect_single(map_tool(
            "read_file",
            &json!({"file_path": "a.rs", "offset": 10, "limit": 50}),
        ));
        assert_eq!(call.args, json!({"filePath": "a.rs", "offset": 10, "limit": 50}));
    }

    #[test]
    fn read_file_without_path_passes_through() {
        let call = expect_single(map_tool("read_file", &json!({"nonsense": true})));
        assert_eq!(call.name, "read_file");
    }

    #[test]
    fn read_files_expands_per_path() {
        let mapped = map_tool("read_files", &json!({"file_paths": ["a.txt", "b.txt"]}));
        let MappedTool::Many(calls) = mapped else {
            panic!("expected expansion");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args["filePath"], "a.txt");
        assert_eq!(calls[1].args["filePath"], "b.txt");
    }

    #[test]
    fn read_files_empty_list_passes_through() {
        let call = expect_single(map_tool("read_files", &json!({"file_paths": []})));
        assert_eq!(call.name, "read_files");
    }

    #[test]
    fn create_and_edit_map_to_write_and_edit() {
        let call = expect_single(map_tool(
            "create_file_with_contents",
            &json!({"file_path": "x.txt", "contents": "hi"}),
        ));
        assert_eq!(call.name, "write");
        assert_eq!(call.args, json!({"filePath": "x.txt", "content": "hi"}));

        let call = expect_single(map_tool(
            "edit_file",
            &json!({"file_path": "x.txt", "old_str": "a", "new_str": "b"}),
        ));
        assert_eq!(call.name, "edit");
        assert_eq!(
            call.args,
            json!({"filePath": "x.txt", "oldString": "a", "newString": "b"})
        );
    }

    #[test]
    fn grep_prefixes_case_insensitive_once() {
        let call = expect_single(map_tool(
            "grep",
            &json!({"pattern": "foo", "case_insensitive": true}),
        ));
        assert_eq!(call.args["pattern"], "(?i)foo");

        let call = expect_single(map_tool(
            "grep",
            &json!({"pattern": "(?i)foo", "case_insensitive": true}),
        ));
        assert_eq!(call.args["pattern"], "(?i)foo");

        let call = expect_single(map_tool(
            "grep",
            &json!({"pattern": "foo", "search_directory": "src"}),
        ));
        assert_eq!(call.args, json!({"pattern": "foo", "path": "src"}));
    }

    #[test]
    fn mkdir_quotes_the_path() {
        let call = expect_single(map_tool("mkdir", &json!({"directory_path": "my dir"})));
        assert_eq!(call.name, "bash");
        assert_eq!(call.args["command"], "mkdir -p 'my dir'");
    }

    #[test]
    fn run_command_builds_quoted_command_line() {
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "cargo", "flags": ["--quiet"], "arguments": ["test", "my filter"]}),
        ));
        assert_eq!(call.name, "bash");
        assert_eq!(call.args["command"], "cargo --quiet test 'my filter'");
    }

    #[test]
    fn run_git_command_quotes_subcommand_and_args() {
        let call = expect_single(map_tool(
            "run_git_command",
            &json!({"command": "commit", "args": ["-m", "two words"]}),
        ));
        assert_eq!(call.args["command"], "git commit -m 'two words'");
    }

    #[test]
    fn gitlab_api_request_builds_curl_literal() {
        let call = expect_single(map_tool(
            "gitlab_api_request",
            &json!({"path": "projects/1", "method": "get"}),
        ));
        assert_eq!(call.name, "bash");
        assert_eq!(
            call.args["command"],
            "curl -s -X GET -H 'Authorization: Bearer $TOKEN' -H 'Content-Type: application/json' '$GITLAB_URL/api/v4/projects/1'"
        );

        let call = expect_single(map_tool(
            "gitlab_api_request",
            &json!({"path": "/projects", "method": "POST", "body": "{\"name\":\"x\"}"}),
        ));
        let command = call.args["command"].as_str().unwrap();
        assert!(command.contains("-X POST"));
        assert!(command.contains("-d '{\"name\":\"x\"}'"));
    }

    #[test]
    fn unknown_tool_passes_through() {
        let call = expect_single(map_tool("mystery", &json!({"a": 1})));
        assert_eq!(call.name, "mystery");
        assert_eq!(call.args, json!({"a": 1}));
    }

    #[test]
    fn bridge_todowrite_from_arguments() {
        let payload = r#"{"todos":[{"content":"x","status":"pending","priority":"high"}]}"#;
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__todo_write__", "arguments": [payload]}),
        ));
        assert_eq!(call.name, "todowrite");
        assert_eq!(
            call.args,
            json!({"todos":[{"content":"x","status":"pending","priority":"high"}]})
        );
    }

    #[test]
    fn bridge_payload_unwraps_one_quote_layer() {
        let payload = r#"'{"name":"review"}'"#;
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__skill__", "arguments": [payload]}),
        ));
        assert_eq!(call.name, "skill");
        assert_eq!(call.args, json!({"name": "review"}));
    }

    #[test]
    fn bridge_embedded_in_command_string() {
        let call = expect_single(map_tool(
            "run_command",
            &json!({"command": "__webfetch__ {\"url\":\"https://example.com\"}"}),
        ));
        assert_eq!(call.name, "webfetch");
        assert_eq!(call.args["url"], "https://example.com");
    }

    #[test]
    fn bridge_invalid_json_signals_invalid_tool() {
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__todo_write__", "arguments": ["{not json"]}),
        ));
        assert_eq!(call.name, "invalid");
        assert_eq!(
            call.args,
            json!({"tool": "todowrite", "error": "__todo_write__ payload is not valid JSON"})
        );
    }

    #[test]
    fn bridge_non_object_payload_is_invalid() {
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__question__", "arguments": ["[1,2]"]}),
        ));
        assert_eq!(call.name, "invalid");
        assert_eq!(call.args["tool"], "question");
    }

    #[test]
    fn bridge_todowrite_rejects_bad_status() {
        let payload = r#"{"todos":[{"content":"x","status":"done","priority":"high"}]}"#;
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__todo_write__", "arguments": [payload]}),
        ));
        assert_eq!(call.name, "invalid");
        let error = call.args["error"].as_str().unwrap();
        assert!(error.contains("status"));
    }

    #[test]
    fn bridge_webfetch_validates_format_and_timeout() {
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__webfetch__", "arguments": [r#"{"url":"u","format":"pdf"}"#]}),
        ));
        assert_eq!(call.name, "invalid");

        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__webfetch__", "arguments": [r#"{"url":"u","timeout":-5}"#]}),
        ));
        assert_eq!(call.name, "invalid");

        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__webfetch__", "arguments": [r#"{"url":"u","format":"markdown","timeout":30}"#]}),
        ));
        assert_eq!(call.name, "webfetch");
    }

    #[test]
    fn bridge_question_requires_options() {
        let payload = r#"{"questions":[{"question":"q","header":"h","options":[]}]}"#;
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__question__", "arguments": [payload]}),
        ));
        assert_eq!(call.name, "invalid");

        let payload = r#"{"questions":[{"question":"q","header":"h","options":[{"label":"l","description":"d"}]}]}"#;
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__question__", "arguments": [payload]}),
        ));
        assert_eq!(call.name, "question");
    }

    #[test]
    fn bridge_skill_requires_nonblank_name() {
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__skill__", "arguments": [r#"{"name":"  "}"#]}),
        ));
        assert_eq!(call.name, "invalid");
    }

    #[test]
    fn bridge_todoread_accepts_missing_payload() {
        let call = expect_single(map_tool(
            "run_command",
            &json!({"program": "__todo_read__", "arguments": []}),
        ));
        assert_eq!(call.name, "todoread");
        assert_eq!(call.args, json!({}));
    }
}
