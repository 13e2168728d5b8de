//! Agent session service: provider-polymorphic turn loop, history
//! persistence inside the workspace, tool lifecycle tracking.

use std::sync::Arc;

use russh::ChannelMsg;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppResult;
use crate::files;
use crate::mux::ServerMsg;
use crate::providers::{AgentEvent, AgentProvider, QueryOptions, ToolStatus};
use crate::sftp::SftpPool;

/// Workspace-local root for persisted agent state.
pub const STORAGE_DIR: &str = "/home/coder/.devgate";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredTool {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionLog {
    pub session_id: String,
    pub agent: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub tools: Vec<StoredTool>,
}

impl SessionLog {
    pub fn new(agent: &str) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    fn push_message(&mut self, role: &str, content: String) {
        if content.is_empty() {
            return;
        }
        self.messages.push(StoredMessage {
            role: role.to_string(),
            content,
            timestamp: chrono::Utc::now(),
        });
    }

    fn upsert_tool(&mut self, id: &str, name: &str, input: Value, status: ToolStatus) {
        match self.tools.iter_mut().find(|t| t.id == id) {
            Some(tool) => tool.status = status,
            None => self.tools.push(StoredTool {
                id: id.to_string(),
                name: name.to_string(),
                input,
                status,
                result: None,
                error: None,
            }),
        }
    }

    fn record_tool_result(&mut self, tool_id: &str, result: Option<Value>, error: Option<String>) {
        if let Some(tool) = self.tools.iter_mut().find(|t| t.id == tool_id) {
            tool.status = if error.is_some() {
                ToolStatus::Error
            } else {
                ToolStatus::Complete
            };
            tool.result = result;
            tool.error = error;
        }
    }
}

fn session_path(agent: &str, session_id: &str) -> String {
    format!("{STORAGE_DIR}/{agent}/{session_id}.json")
}

fn current_path(agent: &str) -> String {
    format!("{STORAGE_DIR}/{agent}/current")
}

pub async fn load_session(
    pool: &SftpPool,
    host: &str,
    port: u16,
    agent: &str,
    session_id: &str,
) -> AppResult<Option<SessionLog>> {
    let path = session_path(agent, session_id);
    let bytes = pool
        .with_session(host, port, |sftp| {
            let path = path.clone();
            async move {
                match files::read_raw(&sftp, &path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(crate::error::AppError::NotFound) => Ok(None),
                    Err(err) => Err(err),
                }
            }
        })
        .await?;
    match bytes {
        Some(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        None => Ok(None),
    }
}

/// Session pointed at by the `current` file, if any.
pub async fn load_current_session(
    pool: &SftpPool,
    host: &str,
    port: u16,
    agent: &str,
) -> AppResult<Option<SessionLog>> {
    let pointer = current_path(agent);
    let bytes = pool
        .with_session(host, port, |sftp| {
            let pointer = pointer.clone();
            async move {
                match files::read_raw(&sftp, &pointer).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(crate::error::AppError::NotFound) => Ok(None),
                    Err(err) => Err(err),
                }
            }
        })
        .await?;
    let Some(bytes) = bytes else { return Ok(None) };
    let session_id = String::from_utf8_lossy(&bytes).trim().to_string();
    if session_id.is_empty() {
        return Ok(None);
    }
    load_session(pool, host, port, agent, &session_id).await
}

pub async fn persist_session(
    pool: &SftpPool,
    host: &str,
    port: u16,
    log: &SessionLog,
) -> AppResult<()> {
    let path = session_path(&log.agent, &log.session_id);
    let pointer = current_path(&log.agent);
    let payload = serde_json::to_vec_pretty(log)
        .map_err(|e| crate::error::AppError::Internal(format!("serialize session: {e}")))?;
    let session_id = log.session_id.clone();
    pool.with_session(host, port, |sftp| {
        let path = path.clone();
        let pointer = pointer.clone();
        let payload = payload.clone();
        let session_id = session_id.clone();
        async move {
            files::write_raw(&sftp, &path, &payload).await?;
            files::write_raw(&sftp, &pointer, session_id.as_bytes()).await
        }
    })
    .await
}

/// A file reference the client attached to a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub path: String,
    #[serde(default = "default_include")]
    pub include: bool,
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub end_line: Option<usize>,
}

fn default_include() -> bool {
    true
}

pub fn clip_lines(content: &str, start_line: Option<usize>, end_line: Option<usize>) -> String {
    match (start_line, end_line) {
        (None, None) => content.to_string(),
        (start, end) => {
            let start = start.unwrap_or(1).max(1);
            let end = end.unwrap_or(usize::MAX);
            content
                .lines()
                .enumerate()
                .filter(|(i, _)| (start..=end).contains(&(i + 1)))
                .map(|(_, line)| line)
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

/// Provider-agnostic prompt envelope: history block, then file context,
/// then the user prompt.
pub fn compose_prompt(
    history: &[StoredMessage],
    file_context: &[(String, String)],
    prompt: &str,
) -> String {
    let mut out = String::new();
    if !history.is_empty() {
        out.push_str("Previous conversation:\n");
        for message in history {
            out.push_str(&format!("[{}] {}\n", message.role, message.content));
        }
        out.push('\n');
    }
    if !file_context.is_empty() {
        out.push_str("Relevant files:\n");
        for (path, content) in file_context {
            out.push_str(&format!("--- {path} ---\n{content}\n"));
        }
        out.push('\n');
    }
    out.push_str(prompt);
    out
}

/// Drive one agent turn: exec the provider CLI in the workspace, forward
/// normalised events, keep the log current, persist on completion.
#[allow(clippy::too_many_arguments)]
pub async fn run_turn(
    provider: &'static dyn AgentProvider,
    sftp: Arc<SftpPool>,
    host: String,
    port: u16,
    composed_prompt: String,
    user_prompt: String,
    options: QueryOptions,
    mut log: SessionLog,
    out: mpsc::Sender<ServerMsg>,
    cancel: CancellationToken,
) {
    log.push_message("user", user_prompt);

    let finished = drive_turn(
        provider,
        &host,
        port,
        &composed_prompt,
        &options,
        &mut log,
        &out,
        &cancel,
    )
    .await;

    if let Err(err) = &finished {
        let _ = out
            .send(ServerMsg::from(AgentEvent::Error {
                message: err.to_string(),
            }))
            .await;
    }
    if let Err(err) = persist_session(&sftp, &host, port, &log).await {
        tracing::warn!(?err, session_id = %log.session_id, "failed to persist agent session");
    }
    // Exactly one done per turn, even on abort or provider failure.
    if !matches!(finished, Ok(true)) {
        let _ = out
            .send(ServerMsg::from(AgentEvent::Done { usage: None }))
            .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_turn(
    provider: &'static dyn AgentProvider,
    host: &str,
    port: u16,
    composed_prompt: &str,
    options: &QueryOptions,
    log: &mut SessionLog,
    out: &mpsc::Sender<ServerMsg>,
    cancel: &CancellationToken,
) -> AppResult<bool> {
    let handle = crate::pty::connect_with_retry(host, port).await?;
    let mut channel = handle.channel_open_session().await?;
    let command = provider.command(composed_prompt, options);
    channel.exec(true, command.as_str()).await?;

    let mut text_buf = String::new();
    let mut pending = String::new();
    let mut sent_done = false;

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.close().await;
                break;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    pending.push_str(&String::from_utf8_lossy(data));
                    while let Some(idx) = pending.find('\n') {
                        let line: String = pending.drain(..=idx).collect();
                        for event in provider.map_line(line.trim()) {
                            let done = apply_event(&event, &mut text_buf, log);
                            if out.send(ServerMsg::from(event)).await.is_err() {
                                break 'outer;
                            }
                            if done {
                                sent_done = true;
                                break 'outer;
                            }
                        }
                    }
                }
                Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    tracing::debug!(
                        stderr = %String::from_utf8_lossy(data),
                        agent = provider.name(),
                        "agent cli stderr"
                    );
                }
                Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => break,
                Some(_) => {}
            },
        }
    }

    // Commit any streaming text the provider never terminated.
    let leftover = std::mem::take(&mut text_buf);
    log.push_message("assistant", leftover);
    Ok(sent_done)
}

/// Fold one event into the log. Streaming text accumulates until a done or
/// tool_use commits it. Returns true when the turn is over.
fn apply_event(event: &AgentEvent, text_buf: &mut String, log: &mut SessionLog) -> bool {
    match event {
        AgentEvent::Text { content, streaming } => {
            if *streaming {
                text_buf.push_str(content);
            } else {
                // The terminal non-streaming message supersedes the deltas.
                *text_buf = content.clone();
            }
            false
        }
        AgentEvent::Thinking { .. } => false,
        AgentEvent::ToolUse {
            id,
            name,
            input,
            status,
        } => {
            let committed = std::mem::take(text_buf);
            log.push_message("assistant", committed);
            log.upsert_tool(id, name, input.clone(), *status);
            false
        }
        AgentEvent::ToolResult {
            tool_id,
            result,
            error,
        } => {
            log.record_tool_result(tool_id, result.clone(), error.clone());
            false
        }
        AgentEvent::Done { .. } => {
            let committed = std::mem::take(text_buf);
            log.push_message("assistant", committed);
            true
        }
        AgentEvent::Error { message } => {
            log.push_message("error", message.clone());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clip_lines_bounds() {
        let content = "a\nb\nc\nd";
        assert_eq!(clip_lines(content, None, None), content);
        assert_eq!(clip_lines(content, Some(2), Some(3)), "b\nc");
        assert_eq!(clip_lines(content, Some(3), None), "c\nd");
        assert_eq!(clip_lines(content, None, Some(1)), "a");
        assert_eq!(clip_lines(content, Some(10), None), "");
    }

    #[test]
    fn compose_prompt_envelope_order() {
        let history = vec![StoredMessage {
            role: "user".into(),
            content: "earlier question".into(),
            timestamp: chrono::Utc::now(),
        }];
        let files = vec![("src/main.rs".to_string(), "fn main() {}".to_string())];
        let composed = compose_prompt(&history, &files, "do the thing");
        let history_at = composed.find("Previous conversation").unwrap();
        let files_at = composed.find("Relevant files").unwrap();
        let prompt_at = composed.find("do the thing").unwrap();
        assert!(history_at < files_at && files_at < prompt_at);
        assert!(composed.contains("--- src/main.rs ---"));
    }

    #[test]
    fn compose_prompt_without_context_is_bare() {
        assert_eq!(compose_prompt(&[], &[], "hello"), "hello");
    }

    #[test]
    fn streaming_text_commits_on_tool_use() {
        let mut log = SessionLog::new("claude");
        let mut buf = String::new();
        apply_event(
            &AgentEvent::Text { content: "part ".into(), streaming: true },
            &mut buf,
            &mut log,
        );
        apply_event(
            &AgentEvent::Text { content: "one".into(), streaming: true },
            &mut buf,
            &mut log,
        );
        assert!(log.messages.is_empty());
        apply_event(
            &AgentEvent::ToolUse {
                id: "t1".into(),
                name: "Bash".into(),
                input: json!({"command": "ls"}),
                status: ToolStatus::Running,
            },
            &mut buf,
            &mut log,
        );
        assert_eq!(log.messages.len(), 1);
        assert_eq!(log.messages[0].content, "part one");
        assert_eq!(log.tools.len(), 1);
    }

    #[test]
    fn terminal_text_supersedes_deltas() {
        let mut log = SessionLog::new("claude");
        let mut buf = String::new();
        apply_event(
            &AgentEvent::Text { content: "he".into(), streaming: true },
            &mut buf,
            &mut log,
        );
        apply_event(
            &AgentEvent::Text { content: "hello".into(), streaming: false },
            &mut buf,
            &mut log,
        );
        let done = apply_event(&AgentEvent::Done { usage: None }, &mut buf, &mut log);
        assert!(done);
        assert_eq!(log.messages.len(), 1);
        assert_eq!(log.messages[0].content, "hello");
    }

    #[test]
    fn tool_results_update_matching_entry() {
        let mut log = SessionLog::new("claude");
        let mut buf = String::new();
        apply_event(
            &AgentEvent::ToolUse {
                id: "t1".into(),
                name: "Read".into(),
                input: json!({}),
                status: ToolStatus::Running,
            },
            &mut buf,
            &mut log,
        );
        apply_event(
            &AgentEvent::ToolResult {
                tool_id: "t1".into(),
                result: Some(json!("contents")),
                error: None,
            },
            &mut buf,
            &mut log,
        );
        assert_eq!(log.tools[0].status, ToolStatus::Complete);
        assert_eq!(log.tools[0].result, Some(json!("contents")));

        apply_event(
            &AgentEvent::ToolResult {
                tool_id: "t1".into(),
                result: None,
                error: Some("denied".into()),
            },
            &mut buf,
            &mut log,
        );
        assert_eq!(log.tools[0].status, ToolStatus::Error);
    }

    #[test]
    fn session_paths_follow_layout() {
        assert_eq!(
            session_path("claude", "abc"),
            "/home/coder/.devgate/claude/abc.json"
        );
        assert_eq!(current_path("codex"), "/home/coder/.devgate/codex/current");
    }
}
