//! Port-watch channel: streams `LISTEN <port>` / `CLOSE <port>` lines from
//! the watcher inside the workspace and forwards them as events.

use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mux::ServerMsg;
use crate::ssh;

/// The workspace image ships this binary; its stdout is the contract.
const PORT_WATCH_COMMAND: &str = "devgate-portwatch --stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Listen(u16),
    Close(u16),
}

pub fn parse_line(line: &str) -> Option<PortEvent> {
    let mut fields = line.split_whitespace();
    let verb = fields.next()?;
    let port: u16 = fields.next()?.parse().ok()?;
    if port == 0 || fields.next().is_some() {
        return None;
    }
    match verb {
        "LISTEN" => Some(PortEvent::Listen(port)),
        "CLOSE" => Some(PortEvent::Close(port)),
        _ => None,
    }
}

/// Watch until the session is torn down or the watcher exits.
pub async fn run(
    host: String,
    port: u16,
    out: mpsc::Sender<ServerMsg>,
    cancel: CancellationToken,
) {
    let handle = match ssh::connect(&host, port).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(?err, host, port, "port watcher connect failed");
            return;
        }
    };
    let mut channel = match handle.channel_open_session().await {
        Ok(channel) => channel,
        Err(err) => {
            tracing::warn!(?err, "port watcher channel failed");
            return;
        }
    };
    if let Err(err) = channel.exec(true, PORT_WATCH_COMMAND).await {
        tracing::warn!(?err, "port watcher exec failed");
        return;
    }

    let mut pending = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    pending.push_str(&String::from_utf8_lossy(data));
                    while let Some(idx) = pending.find('\n') {
                        let line: String = pending.drain(..=idx).collect();
                        let Some(event) = parse_line(line.trim()) else { continue };
                        let msg = match event {
                            PortEvent::Listen(p) => ServerMsg::PortOpen { port: p },
                            PortEvent::Close(p) => ServerMsg::PortClose { port: p },
                        };
                        if out.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
                Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => break,
                Some(_) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_and_close() {
        assert_eq!(parse_line("LISTEN 3000"), Some(PortEvent::Listen(3000)));
        assert_eq!(parse_line("CLOSE 8080"), Some(PortEvent::Close(8080)));
        assert_eq!(parse_line("LISTEN 65535"), Some(PortEvent::Listen(65535)));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("LISTEN"), None);
        assert_eq!(parse_line("LISTEN abc"), None);
        assert_eq!(parse_line("LISTEN 0"), None);
        assert_eq!(parse_line("LISTEN 99999"), None);
        assert_eq!(parse_line("OPEN 3000"), None);
        assert_eq!(parse_line("LISTEN 3000 extra"), None);
    }
}
