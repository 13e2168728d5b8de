//! Interactive PTY channel: bridges websocket stdin/stdout to a shell in
//! the workspace over SSH.

use std::time::Duration;

use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::mux::ServerMsg;
use crate::ssh;

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum PtyInput {
    Data(String),
    Resize { cols: u16, rows: u16 },
}

/// Dial the workspace sshd with backoff; a freshly booted machine may not
/// be accepting connections yet.
pub(crate) async fn connect_with_retry(host: &str, port: u16) -> AppResult<ssh::SshHandle> {
    let mut backoff = Duration::from_millis(500);
    let mut last = None;
    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        match ssh::connect(host, port).await {
            Ok(handle) => return Ok(handle),
            Err(err) => {
                tracing::debug!(?err, attempt, host, port, "pty ssh connect failed");
                last = Some(err);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
    Err(last.unwrap_or_else(|| AppError::BackendUnavailable("ssh connect failed".into())))
}

/// Run one PTY until the client closes it, the shell exits, or the session
/// is torn down.
pub async fn run(
    pty_id: String,
    host: String,
    port: u16,
    cols: u16,
    rows: u16,
    mut input: mpsc::Receiver<PtyInput>,
    out: mpsc::Sender<ServerMsg>,
    cancel: CancellationToken,
) {
    let result = drive(&pty_id, &host, port, cols, rows, &mut input, &out, &cancel).await;
    if let Err(err) = result {
        let _ = out
            .send(ServerMsg::Error {
                error: format!("pty {pty_id}: {err}"),
            })
            .await;
    }
    let _ = out.send(ServerMsg::PtyClosed { pty_id }).await;
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    pty_id: &str,
    host: &str,
    port: u16,
    cols: u16,
    rows: u16,
    input: &mut mpsc::Receiver<PtyInput>,
    out: &mpsc::Sender<ServerMsg>,
    cancel: &CancellationToken,
) -> AppResult<()> {
    let handle = tokio::select! {
        handle = connect_with_retry(host, port) => handle?,
        _ = cancel.cancelled() => return Ok(()),
    };
    let mut channel = handle.channel_open_session().await?;
    channel
        .request_pty(
            false,
            "xterm-256color",
            u32::from(cols),
            u32::from(rows),
            0,
            0,
            &[],
        )
        .await?;
    channel.request_shell(false).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.eof().await;
                break;
            }
            msg = input.recv() => match msg {
                Some(PtyInput::Data(data)) => {
                    channel.data(data.as_bytes()).await?;
                }
                Some(PtyInput::Resize { cols, rows }) => {
                    channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await?;
                }
                None => {
                    let _ = channel.eof().await;
                    break;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    let text = String::from_utf8_lossy(data).to_string();
                    if out
                        .send(ServerMsg::PtyOutput {
                            pty_id: pty_id.to_string(),
                            data: text,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    let text = String::from_utf8_lossy(data).to_string();
                    let _ = out
                        .send(ServerMsg::PtyOutput {
                            pty_id: pty_id.to_string(),
                            data: text,
                        })
                        .await;
                }
                Some(ChannelMsg::ExitStatus { .. }) | Some(ChannelMsg::Eof) => {
                    // Shell is done; drain until Close.
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }
    Ok(())
}
