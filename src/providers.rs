//! Agent providers. Each provider drives its CLI inside the workspace over
//! an SSH exec channel and normalises the CLI's JSON-line output into the
//! common event vocabulary. Adding a provider means implementing
//! [`AgentProvider`] and registering it in [`registry`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ssh::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Complete,
    Error,
}

/// The normalised event vocabulary every provider maps into.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        content: String,
        streaming: bool,
    },
    Thinking {
        content: String,
        streaming: bool,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        status: ToolStatus,
    },
    ToolResult {
        tool_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub session_id: String,
    pub permission_mode: PermissionMode,
    pub resume: bool,
}

pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Env var that must be present in the workspace for this provider.
    fn required_env(&self) -> &'static str;

    /// Command line executed in the workspace for one turn.
    fn command(&self, prompt: &str, options: &QueryOptions) -> String;

    /// Map one line of CLI output into zero or more normalised events.
    fn map_line(&self, line: &str) -> Vec<AgentEvent>;

    /// A provider is usable when its key is present either in the composed
    /// workspace env or in the gateway's own environment.
    fn is_configured(&self, workspace_env: &BTreeMap<String, String>) -> bool {
        workspace_env.contains_key(self.required_env())
            || std::env::var(self.required_env()).is_ok()
    }
}

/// Canonical env var for a stored provider key.
pub fn env_var_for(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" | "claude" => Some("ANTHROPIC_API_KEY"),
        "openai" | "codex" => Some("OPENAI_API_KEY"),
        "opencode" => Some("OPENCODE_API_KEY"),
        "codebuff" => Some("CODEBUFF_API_KEY"),
        _ => None,
    }
}

pub fn registry() -> &'static [&'static dyn AgentProvider] {
    static PROVIDERS: [&'static dyn AgentProvider; 4] =
        [&ClaudeProvider, &CodexProvider, &OpencodeProvider, &CodebuffProvider];
    &PROVIDERS
}

pub fn provider_for(name: &str) -> Option<&'static dyn AgentProvider> {
    registry().iter().copied().find(|p| p.name() == name)
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

// ── claude ──────────────────────────────────────────────────────────────

pub struct ClaudeProvider;

impl AgentProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn required_env(&self) -> &'static str {
        "ANTHROPIC_API_KEY"
    }

    fn command(&self, prompt: &str, options: &QueryOptions) -> String {
        let mode = match options.permission_mode {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        };
        let mut cmd = format!(
            "cd {} && claude -p {} --output-format stream-json --verbose \
             --include-partial-messages --permission-mode {}",
            crate::files::WORKING_DIR,
            shell_quote(prompt),
            mode
        );
        if options.resume {
            cmd.push_str(&format!(" --resume {}", shell_quote(&options.session_id)));
        }
        cmd
    }

    fn map_line(&self, line: &str) -> Vec<AgentEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };
        match str_field(&value, "type") {
            Some("stream_event") => {
                let delta = value.pointer("/event/delta");
                match delta.and_then(|d| str_field(d, "type")) {
                    Some("text_delta") => delta
                        .and_then(|d| str_field(d, "text"))
                        .map(|text| {
                            vec![AgentEvent::Text {
                                content: text.to_string(),
                                streaming: true,
                            }]
                        })
                        .unwrap_or_default(),
                    Some("thinking_delta") => delta
                        .and_then(|d| str_field(d, "thinking"))
                        .map(|text| {
                            vec![AgentEvent::Thinking {
                                content: text.to_string(),
                                streaming: true,
                            }]
                        })
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            Some("assistant") => {
                let Some(blocks) = value.pointer("/message/content").and_then(Value::as_array)
                else {
                    return Vec::new();
                };
                let mut events = Vec::new();
                for block in blocks {
                    match str_field(block, "type") {
                        Some("text") => {
                            if let Some(text) = str_field(block, "text") {
                                events.push(AgentEvent::Text {
                                    content: text.to_string(),
                                    streaming: false,
                                });
                            }
                        }
                        Some("thinking") => {
                            if let Some(text) = str_field(block, "thinking") {
                                events.push(AgentEvent::Thinking {
                                    content: text.to_string(),
                                    streaming: false,
                                });
                            }
                        }
                        Some("tool_use") => {
                            if let (Some(id), Some(name)) =
                                (str_field(block, "id"), str_field(block, "name"))
                            {
                                events.push(AgentEvent::ToolUse {
                                    id: id.to_string(),
                                    name: name.to_string(),
                                    input: block.get("input").cloned().unwrap_or(Value::Null),
                                    status: ToolStatus::Running,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                events
            }
            Some("user") => {
                let Some(blocks) = value.pointer("/message/content").and_then(Value::as_array)
                else {
                    return Vec::new();
                };
                blocks
                    .iter()
                    .filter(|b| str_field(b, "type") == Some("tool_result"))
                    .filter_map(|b| {
                        let tool_id = str_field(b, "tool_use_id")?.to_string();
                        let is_error =
                            b.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                        let content = b.get("content").cloned();
                        Some(if is_error {
                            AgentEvent::ToolResult {
                                tool_id,
                                result: None,
                                error: content.map(|c| c.to_string()),
                            }
                        } else {
                            AgentEvent::ToolResult {
                                tool_id,
                                result: content,
                                error: None,
                            }
                        })
                    })
                    .collect()
            }
            Some("result") => {
                let usage = value.get("usage").cloned();
                if str_field(&value, "subtype") == Some("success") {
                    vec![AgentEvent::Done { usage }]
                } else {
                    let message = str_field(&value, "result")
                        .unwrap_or("agent turn failed")
                        .to_string();
                    vec![AgentEvent::Error { message }, AgentEvent::Done { usage }]
                }
            }
            _ => Vec::new(),
        }
    }
}

// ── codex ───────────────────────────────────────────────────────────────

pub struct CodexProvider;

impl AgentProvider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn required_env(&self) -> &'static str {
        "OPENAI_API_KEY"
    }

    fn command(&self, prompt: &str, options: &QueryOptions) -> String {
        // Permission modes are approximated onto codex sandbox levels.
        let sandbox = match options.permission_mode {
            PermissionMode::Plan => "read-only",
            PermissionMode::BypassPermissions => "danger-full-access",
            _ => "workspace-write",
        };
        if options.resume {
            format!(
                "cd {} && codex exec resume {} --json --sandbox {} {}",
                crate::files::WORKING_DIR,
                shell_quote(&options.session_id),
                sandbox,
                shell_quote(prompt)
            )
        } else {
            format!(
                "cd {} && codex exec --json --sandbox {} {}",
                crate::files::WORKING_DIR,
                sandbox,
                shell_quote(prompt)
            )
        }
    }

    fn map_line(&self, line: &str) -> Vec<AgentEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };
        let item = value.get("item");
        match str_field(&value, "type") {
            Some("item.updated") => match item.and_then(|i| str_field(i, "type")) {
                Some("agent_message") => item
                    .and_then(|i| str_field(i, "text"))
                    .map(|text| {
                        vec![AgentEvent::Text {
                            content: text.to_string(),
                            streaming: true,
                        }]
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            },
            Some("item.started") => match item.and_then(|i| str_field(i, "type")) {
                Some("command_execution") => {
                    let item = item.unwrap_or(&Value::Null);
                    vec![AgentEvent::ToolUse {
                        id: str_field(item, "id").unwrap_or_default().to_string(),
                        name: "command_execution".to_string(),
                        input: serde_json::json!({
                            "command": str_field(item, "command").unwrap_or_default(),
                        }),
                        status: ToolStatus::Running,
                    }]
                }
                _ => Vec::new(),
            },
            Some("item.completed") => {
                let item = item.unwrap_or(&Value::Null);
                match str_field(item, "type") {
                    Some("agent_message") => str_field(item, "text")
                        .map(|text| {
                            vec![AgentEvent::Text {
                                content: text.to_string(),
                                streaming: false,
                            }]
                        })
                        .unwrap_or_default(),
                    Some("reasoning") => str_field(item, "text")
                        .map(|text| {
                            vec![AgentEvent::Thinking {
                                content: text.to_string(),
                                streaming: false,
                            }]
                        })
                        .unwrap_or_default(),
                    Some("command_execution") => {
                        let exit_code =
                            item.get("exit_code").and_then(Value::as_i64).unwrap_or(0);
                        let output = str_field(item, "aggregated_output")
                            .unwrap_or_default()
                            .to_string();
                        let tool_id = str_field(item, "id").unwrap_or_default().to_string();
                        vec![if exit_code == 0 {
                            AgentEvent::ToolResult {
                                tool_id,
                                result: Some(Value::String(output)),
                                error: None,
                            }
                        } else {
                            AgentEvent::ToolResult {
                                tool_id,
                                result: None,
                                error: Some(output),
                            }
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            Some("turn.completed") => vec![AgentEvent::Done {
                usage: value.get("usage").cloned(),
            }],
            Some("turn.failed") => {
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("codex turn failed")
                    .to_string();
                vec![AgentEvent::Error { message }, AgentEvent::Done { usage: None }]
            }
            _ => Vec::new(),
        }
    }
}

// ── opencode ────────────────────────────────────────────────────────────

pub struct OpencodeProvider;

impl AgentProvider for OpencodeProvider {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn required_env(&self) -> &'static str {
        "OPENCODE_API_KEY"
    }

    fn command(&self, prompt: &str, options: &QueryOptions) -> String {
        let mut cmd = format!(
            "cd {} && opencode run --format json {}",
            crate::files::WORKING_DIR,
            shell_quote(prompt)
        );
        if options.permission_mode == PermissionMode::Plan {
            cmd.push_str(" --mode plan");
        }
        if options.resume {
            cmd.push_str(&format!(" --session {}", shell_quote(&options.session_id)));
        }
        cmd
    }

    fn map_line(&self, line: &str) -> Vec<AgentEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };
        match str_field(&value, "type") {
            Some("part") => {
                let Some(part) = value.get("part") else {
                    return Vec::new();
                };
                match str_field(part, "type") {
                    Some("text") => str_field(part, "text")
                        .map(|text| {
                            vec![AgentEvent::Text {
                                content: text.to_string(),
                                streaming: true,
                            }]
                        })
                        .unwrap_or_default(),
                    Some("reasoning") => str_field(part, "text")
                        .map(|text| {
                            vec![AgentEvent::Thinking {
                                content: text.to_string(),
                                streaming: true,
                            }]
                        })
                        .unwrap_or_default(),
                    Some("tool") => {
                        let id = str_field(part, "callID").unwrap_or_default().to_string();
                        let name = str_field(part, "tool").unwrap_or_default().to_string();
                        let state = part.get("state").cloned().unwrap_or(Value::Null);
                        let status = str_field(&state, "status").unwrap_or("running");
                        let input = state.get("input").cloned().unwrap_or(Value::Null);
                        match status {
                            "completed" => vec![
                                AgentEvent::ToolUse {
                                    id: id.clone(),
                                    name,
                                    input,
                                    status: ToolStatus::Complete,
                                },
                                AgentEvent::ToolResult {
                                    tool_id: id,
                                    result: state.get("output").cloned(),
                                    error: None,
                                },
                            ],
                            "error" => vec![
                                AgentEvent::ToolUse {
                                    id: id.clone(),
                                    name,
                                    input,
                                    status: ToolStatus::Error,
                                },
                                AgentEvent::ToolResult {
                                    tool_id: id,
                                    result: None,
                                    error: state
                                        .get("error")
                                        .map(|e| e.to_string())
                                        .or(Some("tool failed".into())),
                                },
                            ],
                            _ => vec![AgentEvent::ToolUse {
                                id,
                                name,
                                input,
                                status: ToolStatus::Running,
                            }],
                        }
                    }
                    _ => Vec::new(),
                }
            }
            Some("done") => vec![AgentEvent::Done {
                usage: value.get("usage").cloned(),
            }],
            Some("error") => vec![AgentEvent::Error {
                message: value
                    .get("error")
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "opencode error".into()),
            }],
            _ => Vec::new(),
        }
    }
}

// ── codebuff ────────────────────────────────────────────────────────────

pub struct CodebuffProvider;

impl AgentProvider for CodebuffProvider {
    fn name(&self) -> &'static str {
        "codebuff"
    }

    fn required_env(&self) -> &'static str {
        "CODEBUFF_API_KEY"
    }

    fn command(&self, prompt: &str, options: &QueryOptions) -> String {
        let mut cmd = format!(
            "cd {} && codebuff --print --json {}",
            crate::files::WORKING_DIR,
            shell_quote(prompt)
        );
        if options.resume {
            cmd.push_str(" --continue");
        }
        cmd
    }

    fn map_line(&self, line: &str) -> Vec<AgentEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };
        match str_field(&value, "type") {
            Some("assistant_message_delta") => str_field(&value, "delta")
                .map(|text| {
                    vec![AgentEvent::Text {
                        content: text.to_string(),
                        streaming: true,
                    }]
                })
                .unwrap_or_default(),
            Some("assistant_message") => str_field(&value, "content")
                .map(|text| {
                    vec![AgentEvent::Text {
                        content: text.to_string(),
                        streaming: false,
                    }]
                })
                .unwrap_or_default(),
            Some("tool_call") => vec![AgentEvent::ToolUse {
                id: str_field(&value, "id").unwrap_or_default().to_string(),
                name: str_field(&value, "name").unwrap_or_default().to_string(),
                input: value.get("params").cloned().unwrap_or(Value::Null),
                status: ToolStatus::Running,
            }],
            Some("tool_result") => vec![AgentEvent::ToolResult {
                tool_id: str_field(&value, "id").unwrap_or_default().to_string(),
                result: value.get("result").cloned(),
                error: None,
            }],
            Some("finish") => vec![AgentEvent::Done {
                usage: value.get("credits_used").cloned().map(|c| {
                    serde_json::json!({ "credits_used": c })
                }),
            }],
            Some("error") => vec![AgentEvent::Error {
                message: str_field(&value, "message")
                    .unwrap_or("codebuff error")
                    .to_string(),
            }],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> QueryOptions {
        QueryOptions {
            session_id: "sess-1".into(),
            permission_mode: PermissionMode::Default,
            resume: false,
        }
    }

    #[test]
    fn registry_holds_all_four_providers() {
        let names: Vec<_> = registry().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["claude", "codex", "opencode", "codebuff"]);
        assert!(provider_for("claude").is_some());
        assert!(provider_for("cursor").is_none());
    }

    #[test]
    fn configured_checks_workspace_env() {
        let mut env = BTreeMap::new();
        assert!(!ClaudeProvider.is_configured(&env));
        env.insert("ANTHROPIC_API_KEY".to_string(), "sk-ant".to_string());
        assert!(ClaudeProvider.is_configured(&env));
    }

    #[test]
    fn claude_maps_stream_deltas() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"hel"}}}"#;
        assert_eq!(
            ClaudeProvider.map_line(line),
            vec![AgentEvent::Text {
                content: "hel".into(),
                streaming: true
            }]
        );
        let thinking = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"thinking_delta","thinking":"hmm"}}}"#;
        assert_eq!(
            ClaudeProvider.map_line(thinking),
            vec![AgentEvent::Thinking {
                content: "hmm".into(),
                streaming: true
            }]
        );
    }

    #[test]
    fn claude_maps_tool_use_and_result() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let events = ClaudeProvider.map_line(line);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::ToolUse { id, name, status: ToolStatus::Running, .. }
                if id == "t1" && name == "Bash"
        ));

        let result = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        let events = ClaudeProvider.map_line(result);
        assert!(matches!(
            &events[0],
            AgentEvent::ToolResult { tool_id, result: Some(_), error: None } if tool_id == "t1"
        ));
    }

    #[test]
    fn claude_maps_result_to_done() {
        let line = r#"{"type":"result","subtype":"success","usage":{"output_tokens":10}}"#;
        let events = ClaudeProvider.map_line(line);
        assert!(matches!(&events[0], AgentEvent::Done { usage: Some(_) }));

        let failed = r#"{"type":"result","subtype":"error_during_execution","result":"boom"}"#;
        let events = ClaudeProvider.map_line(failed);
        assert!(matches!(&events[0], AgentEvent::Error { message } if message == "boom"));
        assert!(matches!(&events[1], AgentEvent::Done { .. }));
    }

    #[test]
    fn garbage_lines_map_to_nothing() {
        for provider in registry() {
            assert!(provider.map_line("not json").is_empty());
            assert!(provider.map_line(r#"{"type":"unknown"}"#).is_empty());
        }
    }

    #[test]
    fn codex_maps_command_execution_lifecycle() {
        let started = r#"{"type":"item.started","item":{"id":"c1","type":"command_execution","command":"cargo test"}}"#;
        let events = CodexProvider.map_line(started);
        assert!(matches!(
            &events[0],
            AgentEvent::ToolUse { id, status: ToolStatus::Running, .. } if id == "c1"
        ));

        let failed = r#"{"type":"item.completed","item":{"id":"c1","type":"command_execution","aggregated_output":"no","exit_code":1}}"#;
        let events = CodexProvider.map_line(failed);
        assert!(matches!(
            &events[0],
            AgentEvent::ToolResult { tool_id, error: Some(_), .. } if tool_id == "c1"
        ));
    }

    #[test]
    fn codex_turn_completed_carries_usage() {
        let line = r#"{"type":"turn.completed","usage":{"input_tokens":5,"output_tokens":9}}"#;
        let events = CodexProvider.map_line(line);
        assert!(matches!(&events[0], AgentEvent::Done { usage: Some(_) }));
    }

    #[test]
    fn opencode_tool_completion_emits_use_and_result() {
        let line = r#"{"type":"part","part":{"type":"tool","callID":"o1","tool":"bash","state":{"status":"completed","input":{"cmd":"ls"},"output":"README.md"}}}"#;
        let events = OpencodeProvider.map_line(line);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::ToolUse { status: ToolStatus::Complete, .. }));
        assert!(matches!(
            &events[1],
            AgentEvent::ToolResult { tool_id, result: Some(_), .. } if tool_id == "o1"
        ));
    }

    #[test]
    fn codebuff_finish_wraps_credits_as_usage() {
        let events = CodebuffProvider.map_line(r#"{"type":"finish","credits_used":12}"#);
        match &events[0] {
            AgentEvent::Done { usage: Some(usage) } => {
                assert_eq!(usage["credits_used"], 12);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn commands_quote_prompts() {
        for provider in registry() {
            let cmd = provider.command("fix the 'bug'; rm -rf /", &options());
            assert!(cmd.contains(r"'fix the '\''bug'\''; rm -rf /'"), "{cmd}");
            assert!(cmd.starts_with(&format!("cd {} && ", crate::files::WORKING_DIR)));
        }
    }

    #[test]
    fn permission_mode_maps_to_codex_sandbox() {
        let mut opts = options();
        opts.permission_mode = PermissionMode::Plan;
        assert!(CodexProvider.command("hi", &opts).contains("--sandbox read-only"));
        opts.permission_mode = PermissionMode::BypassPermissions;
        assert!(CodexProvider
            .command("hi", &opts)
            .contains("--sandbox danger-full-access"));
    }
}
