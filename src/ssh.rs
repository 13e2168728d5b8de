//! SSH client plumbing shared by the PTY, SFTP, agent and port-watch
//! channels. One authenticated connection per (host, port) target; channels
//! are opened per use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh_keys::key;

use crate::error::{AppError, AppResult};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Workspaces are ephemeral and their host keys are freshly generated at
/// boot, so there is nothing to pin against.
pub struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub type SshHandle = client::Handle<ClientHandler>;

/// Dial and authenticate against the workspace sshd.
pub async fn connect(host: &str, port: u16) -> AppResult<SshHandle> {
    let config = Arc::new(client::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        ..Default::default()
    });

    let dial = client::connect(config, (host, port), ClientHandler);
    let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, dial)
        .await
        .map_err(|_| AppError::Timeout(format!("ssh dial {host}:{port}")))?
        .map_err(|e| AppError::BackendUnavailable(format!("ssh dial {host}:{port}: {e}")))?;

    let user = crate::config::WORKSPACE_SSH_USER.clone();
    let authenticated = match crate::config::WORKSPACE_SSH_KEY.as_deref() {
        Some(key_path) => {
            let key = russh_keys::load_secret_key(key_path, None)
                .map_err(|e| AppError::Internal(format!("load ssh key {key_path}: {e}")))?;
            handle
                .authenticate_publickey(&user, Arc::new(key))
                .await?
        }
        None => {
            handle
                .authenticate_password(&user, crate::config::WORKSPACE_SSH_PASSWORD.as_str())
                .await?
        }
    };
    if !authenticated {
        return Err(AppError::BackendUnavailable(format!(
            "ssh auth rejected for {user}@{host}:{port}"
        )));
    }
    Ok(handle)
}

/// Quote a string for safe interpolation into a remote shell command line.
pub fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a;rm -rf /"), "'a;rm -rf /'");
    }
}
