//! Unified workspace WebSocket: PTY, agent, file-op and port-watch channels
//! multiplexed over one client connection.
//!
//! All outbound messages funnel through a single queue, so FIFO within each
//! channel holds end-to-end; clients correlate across channels by ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{self, FileRef, SessionLog, StoredMessage, StoredTool};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::files::{self, FileRequest, FileResponse};
use crate::lifecycle::LifecycleManager;
use crate::providers::{self, AgentEvent, PermissionMode, QueryOptions, ToolStatus};
use crate::pty::{self, PtyInput};
use crate::sftp::SftpPool;
use crate::workspaces;

const OUT_QUEUE_DEPTH: usize = 256;
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    Init {
        workspace_id: Uuid,
        agents: Vec<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    History {
        session_id: String,
        messages: Vec<StoredMessage>,
        tools: Vec<StoredTool>,
    },
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
        error: String,
    },
    PtyOutput {
        pty_id: String,
        data: String,
    },
    PtyClosed {
        pty_id: String,
    },
    PortOpen {
        port: u16,
    },
    PortClose {
        port: u16,
    },
    FileResult {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<FileResponse>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl From<AgentEvent> for ServerMsg {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::Text { content, streaming } => ServerMsg::Text { content, streaming },
            AgentEvent::Thinking { content, streaming } => {
                ServerMsg::Thinking { content, streaming }
            }
            AgentEvent::ToolUse {
                id,
                name,
                input,
                status,
            } => ServerMsg::ToolUse {
                id,
                name,
                input,
                status,
            },
            AgentEvent::ToolResult {
                tool_id,
                result,
                error,
            } => ServerMsg::ToolResult {
                tool_id,
                result,
                error,
            },
            AgentEvent::Done { usage } => ServerMsg::Done { usage },
            AgentEvent::Error { message } => ServerMsg::Error { error: message },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMsg {
    Prompt {
        prompt: String,
        #[serde(default)]
        files: Vec<FileRef>,
        #[serde(default)]
        agent: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        settings: Option<AgentSettings>,
    },
    Settings {
        settings: AgentSettings,
    },
    Abort,
    Approve {
        tool_id: String,
    },
    Reject {
        tool_id: String,
    },
    OpenPty {
        pty_id: String,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    Stdin {
        pty_id: String,
        data: String,
    },
    Resize {
        pty_id: String,
        cols: u16,
        rows: u16,
    },
    ClosePty {
        pty_id: String,
    },
    FileOp {
        request_id: String,
        #[serde(flatten)]
        request: FileRequest,
    },
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

pub async fn workspace_ws(
    ws: WebSocketUpgrade,
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<LifecycleManager>>,
    Extension(sftp): Extension<Arc<SftpPool>>,
    AuthUser { user_id }: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    workspaces::get_owned_workspace(&pool, id, user_id).await?;
    // Boot the workspace if needed. The start runs as a detached task, so
    // it completes even if the client goes away mid-upgrade.
    Arc::clone(&manager).start(id).await?;
    manager.touch(id).await;
    let workspace = workspaces::get_workspace(&pool, id).await?;
    let (ssh_host, ssh_port) =
        crate::resolver::resolve(manager.backend(), &workspace, crate::resolver::Role::Ssh).await?;

    Ok(ws.protocols(["bearer"]).on_upgrade(move |socket| {
        session(socket, SessionContext {
            workspace_id: id,
            user_id,
            ssh_host,
            ssh_port,
            pool,
            sftp,
        })
    }))
}

struct SessionContext {
    workspace_id: Uuid,
    user_id: Uuid,
    ssh_host: String,
    ssh_port: u16,
    pool: PgPool,
    sftp: Arc<SftpPool>,
}

struct SessionState {
    ptys: HashMap<String, (mpsc::Sender<PtyInput>, CancellationToken)>,
    agent_turn: Option<(CancellationToken, tokio::task::JoinHandle<()>)>,
    settings: AgentSettings,
    active_session_id: Option<String>,
}

async fn session(socket: WebSocket, ctx: SessionContext) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMsg>(OUT_QUEUE_DEPTH);
    let root = CancellationToken::new();

    // Single writer preserves FIFO across everything we emit.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Port-watch channel runs for the life of the session.
    tokio::spawn(crate::ports::run(
        ctx.ssh_host.clone(),
        ctx.ssh_port,
        out_tx.clone(),
        root.child_token(),
    ));

    // File ops run on a dedicated worker so they stay FIFO without blocking
    // the other channels.
    let (file_tx, file_rx) = mpsc::channel::<(String, FileRequest)>(64);
    tokio::spawn(file_worker(
        file_rx,
        Arc::clone(&ctx.sftp),
        ctx.ssh_host.clone(),
        ctx.ssh_port,
        out_tx.clone(),
        root.child_token(),
    ));

    let mut state = SessionState {
        ptys: HashMap::new(),
        agent_turn: None,
        settings: AgentSettings::default(),
        active_session_id: None,
    };

    send_init(&ctx, &mut state, &out_tx).await;

    while let Some(frame) = ws_rx.next().await {
        let message = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let parsed: ClientMsg = match serde_json::from_str(&message) {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = out_tx
                    .send(ServerMsg::Error {
                        error: format!("unrecognised message: {err}"),
                    })
                    .await;
                continue;
            }
        };
        handle_client_msg(parsed, &ctx, &mut state, &out_tx, &file_tx, &root).await;
    }

    // Teardown closes every channel before the session is considered freed.
    root.cancel();
    drop(out_tx);
    drop(file_tx);
    state.ptys.clear();
    let _ = writer.await;
    tracing::debug!(workspace_id = %ctx.workspace_id, user_id = %ctx.user_id, "ws session closed");
}

async fn send_init(ctx: &SessionContext, state: &mut SessionState, out: &mpsc::Sender<ServerMsg>) {
    let workspace_env = crate::keys::unsealed_api_keys(&ctx.pool, ctx.user_id)
        .await
        .map(|keys| {
            keys.into_iter()
                .filter_map(|(provider, secret)| {
                    providers::env_var_for(&provider).map(|var| (var.to_string(), secret))
                })
                .collect()
        })
        .unwrap_or_default();
    let agents: Vec<&'static str> = providers::registry()
        .iter()
        .filter(|p| p.is_configured(&workspace_env))
        .map(|p| p.name())
        .collect();

    let default_agent = agents.first().copied().unwrap_or("claude");
    let history = agent::load_current_session(&ctx.sftp, &ctx.ssh_host, ctx.ssh_port, default_agent)
        .await
        .ok()
        .flatten();

    let session_id = history.as_ref().map(|log| log.session_id.clone());
    state.active_session_id = session_id.clone();
    let _ = out
        .send(ServerMsg::Init {
            workspace_id: ctx.workspace_id,
            agents,
            session_id,
        })
        .await;
    if let Some(log) = history {
        let _ = out
            .send(ServerMsg::History {
                session_id: log.session_id,
                messages: log.messages,
                tools: log.tools,
            })
            .await;
    }
}

async fn handle_client_msg(
    msg: ClientMsg,
    ctx: &SessionContext,
    state: &mut SessionState,
    out: &mpsc::Sender<ServerMsg>,
    file_tx: &mpsc::Sender<(String, FileRequest)>,
    root: &CancellationToken,
) {
    match msg {
        ClientMsg::Prompt {
            prompt,
            files,
            agent,
            session_id,
            settings,
        } => {
            if let Some(settings) = settings {
                merge_settings(&mut state.settings, settings);
            }
            if let Some((_, handle)) = &state.agent_turn {
                if !handle.is_finished() {
                    let _ = out
                        .send(ServerMsg::Error {
                            error: "an agent turn is already in flight".into(),
                        })
                        .await;
                    return;
                }
            }
            start_turn(ctx, state, out, root, prompt, files, agent, session_id).await;
        }
        ClientMsg::Settings { settings } => {
            merge_settings(&mut state.settings, settings);
        }
        ClientMsg::Abort => {
            if let Some((token, _)) = state.agent_turn.take() {
                token.cancel();
            }
        }
        // Providers run their own permission flow keyed off the session's
        // permission mode; approvals are acknowledged for the client log.
        ClientMsg::Approve { tool_id } => {
            tracing::debug!(%tool_id, "tool approved by client");
        }
        ClientMsg::Reject { tool_id } => {
            tracing::debug!(%tool_id, "tool rejected by client");
        }
        ClientMsg::OpenPty { pty_id, cols, rows } => {
            if state.ptys.contains_key(&pty_id) {
                let _ = out
                    .send(ServerMsg::Error {
                        error: format!("pty {pty_id} already open"),
                    })
                    .await;
                return;
            }
            let (input_tx, input_rx) = mpsc::channel::<PtyInput>(64);
            let token = root.child_token();
            state.ptys.insert(pty_id.clone(), (input_tx, token.clone()));
            tokio::spawn(pty::run(
                pty_id,
                ctx.ssh_host.clone(),
                ctx.ssh_port,
                cols,
                rows,
                input_rx,
                out.clone(),
                token,
            ));
        }
        ClientMsg::Stdin { pty_id, data } => {
            if let Some((input, _)) = state.ptys.get(&pty_id) {
                let _ = input.send(PtyInput::Data(data)).await;
            }
        }
        ClientMsg::Resize { pty_id, cols, rows } => {
            if let Some((input, _)) = state.ptys.get(&pty_id) {
                let _ = input.send(PtyInput::Resize { cols, rows }).await;
            }
        }
        ClientMsg::ClosePty { pty_id } => {
            if let Some((input, token)) = state.ptys.remove(&pty_id) {
                drop(input);
                token.cancel();
            }
        }
        ClientMsg::FileOp {
            request_id,
            request,
        } => {
            if file_tx.send((request_id.clone(), request)).await.is_err() {
                let _ = out
                    .send(ServerMsg::FileResult {
                        request_id,
                        result: None,
                        error: Some("file channel closed".into()),
                    })
                    .await;
            }
        }
    }
}

fn merge_settings(current: &mut AgentSettings, incoming: AgentSettings) {
    if incoming.agent.is_some() {
        current.agent = incoming.agent;
    }
    if incoming.permission_mode.is_some() {
        current.permission_mode = incoming.permission_mode;
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_turn(
    ctx: &SessionContext,
    state: &mut SessionState,
    out: &mpsc::Sender<ServerMsg>,
    root: &CancellationToken,
    prompt: String,
    file_refs: Vec<FileRef>,
    agent_override: Option<String>,
    session_override: Option<String>,
) {
    let agent_name = agent_override
        .or_else(|| state.settings.agent.clone())
        .unwrap_or_else(|| "claude".to_string());
    let Some(provider) = providers::provider_for(&agent_name) else {
        let _ = out
            .send(ServerMsg::Error {
                error: format!("unknown agent {agent_name:?}"),
            })
            .await;
        return;
    };

    // Resolve the session: explicit id, then the current pointer, else new.
    let requested = session_override.or_else(|| state.active_session_id.clone());
    let log = match requested {
        Some(session_id) => {
            match agent::load_session(&ctx.sftp, &ctx.ssh_host, ctx.ssh_port, provider.name(), &session_id)
                .await
            {
                Ok(Some(log)) if log.agent == provider.name() => Some(log),
                _ => None,
            }
        }
        None => None,
    };
    let (log, resume) = match log {
        Some(log) => (log, true),
        None => (SessionLog::new(provider.name()), false),
    };
    state.active_session_id = Some(log.session_id.clone());

    // File context for include=true refs, clipped when a range is given.
    let mut file_context = Vec::new();
    for file_ref in file_refs.iter().filter(|f| f.include) {
        let request = FileRequest::Read {
            path: file_ref.path.clone(),
        };
        match tokio::time::timeout(
            FILE_OP_TIMEOUT,
            files::execute(&ctx.sftp, &ctx.ssh_host, ctx.ssh_port, &request),
        )
        .await
        {
            Ok(Ok(FileResponse::Content { path, content })) => {
                let clipped = agent::clip_lines(&content, file_ref.start_line, file_ref.end_line);
                file_context.push((path, clipped));
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                let _ = out
                    .send(ServerMsg::Error {
                        error: format!("file context {}: {err}", file_ref.path),
                    })
                    .await;
            }
            Err(_) => {
                let _ = out
                    .send(ServerMsg::Error {
                        error: format!("file context {}: timed out", file_ref.path),
                    })
                    .await;
            }
        }
    }

    let composed = agent::compose_prompt(&log.messages, &file_context, &prompt);
    let options = QueryOptions {
        session_id: log.session_id.clone(),
        permission_mode: state.settings.permission_mode.unwrap_or_default(),
        resume,
    };

    let token = root.child_token();
    let handle = tokio::spawn(agent::run_turn(
        provider,
        Arc::clone(&ctx.sftp),
        ctx.ssh_host.clone(),
        ctx.ssh_port,
        composed,
        prompt,
        options,
        log,
        out.clone(),
        token.clone(),
    ));
    state.agent_turn = Some((token, handle));
}

async fn file_worker(
    mut rx: mpsc::Receiver<(String, FileRequest)>,
    sftp: Arc<SftpPool>,
    host: String,
    port: u16,
    out: mpsc::Sender<ServerMsg>,
    cancel: CancellationToken,
) {
    loop {
        let (request_id, request) = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            outcome = tokio::time::timeout(
                FILE_OP_TIMEOUT,
                files::execute(&sftp, &host, port, &request),
            ) => match outcome {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout("file operation".into())),
            },
        };
        let msg = match result {
            Ok(response) => ServerMsg::FileResult {
                request_id,
                result: Some(response),
                error: None,
            },
            Err(err) => ServerMsg::FileResult {
                request_id,
                result: None,
                error: Some(err.to_string()),
            },
        };
        if out.send(msg).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize() {
        let prompt: ClientMsg = serde_json::from_str(
            r#"{"type":"prompt","prompt":"hi","files":[{"path":"src/main.rs","start_line":1,"end_line":5}]}"#,
        )
        .unwrap();
        assert!(matches!(prompt, ClientMsg::Prompt { ref prompt, ref files, .. }
            if prompt == "hi" && files.len() == 1));

        let abort: ClientMsg = serde_json::from_str(r#"{"type":"abort"}"#).unwrap();
        assert!(matches!(abort, ClientMsg::Abort));

        let open: ClientMsg =
            serde_json::from_str(r#"{"type":"open_pty","pty_id":"p1"}"#).unwrap();
        assert!(matches!(open, ClientMsg::OpenPty { cols: 80, rows: 24, .. }));

        let file_op: ClientMsg = serde_json::from_str(
            r#"{"type":"file_op","request_id":"r1","op":"read","path":"src/lib.rs"}"#,
        )
        .unwrap();
        assert!(matches!(
            file_op,
            ClientMsg::FileOp { ref request_id, request: FileRequest::Read { .. } }
                if request_id == "r1"
        ));
    }

    #[test]
    fn server_messages_carry_type_tags() {
        let text = serde_json::to_value(ServerMsg::Text {
            content: "hello".into(),
            streaming: true,
        })
        .unwrap();
        assert_eq!(text["type"], "text");
        assert_eq!(text["streaming"], true);

        let err = serde_json::to_value(ServerMsg::Error {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["error"], "boom");

        let port = serde_json::to_value(ServerMsg::PortOpen { port: 5173 }).unwrap();
        assert_eq!(port["type"], "port_open");
    }

    #[test]
    fn agent_events_convert_to_server_messages() {
        let msg: ServerMsg = AgentEvent::Error {
            message: "provider exploded".into(),
        }
        .into();
        assert!(matches!(msg, ServerMsg::Error { ref error } if error == "provider exploded"));

        let done: ServerMsg = AgentEvent::Done { usage: None }.into();
        assert!(matches!(done, ServerMsg::Done { usage: None }));
    }

    #[test]
    fn settings_merge_keeps_unset_fields() {
        let mut current = AgentSettings {
            agent: Some("claude".into()),
            permission_mode: Some(PermissionMode::Plan),
        };
        merge_settings(
            &mut current,
            AgentSettings {
                agent: None,
                permission_mode: Some(PermissionMode::AcceptEdits),
            },
        );
        assert_eq!(current.agent.as_deref(), Some("claude"));
        assert_eq!(current.permission_mode, Some(PermissionMode::AcceptEdits));
    }
}
