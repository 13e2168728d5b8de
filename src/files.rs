//! File operations against the workspace tree, carried over pooled SFTP.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{AppError, AppResult};
use crate::sftp::SftpPool;

/// All request paths resolve under this root.
pub const WORKING_DIR: &str = "/home/coder/project";

pub const MAX_FILE_SIZE: u64 = 1024 * 1024;
const BINARY_SNIFF_LEN: usize = 8000;

/// Directories and files skipped by the full-tree walk.
pub const HIDDEN_SET: [&str; 13] = [
    "node_modules",
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    ".env",
    "dist",
    "build",
    ".next",
    ".cache",
    ".DS_Store",
    "Thumbs.db",
    "lost+found",
];

/// Clean a request path and pin it under [`WORKING_DIR`]. Absolute paths
/// already under the root pass through; anything else is joined beneath it.
/// Escapes via `..` are rejected.
pub fn resolve_path(requested: &str) -> AppResult<String> {
    let trimmed = requested.trim();
    let joined = if trimmed.starts_with(WORKING_DIR)
        && (trimmed.len() == WORKING_DIR.len()
            || trimmed.as_bytes()[WORKING_DIR.len()] == b'/')
    {
        trimmed.to_string()
    } else {
        format!("{WORKING_DIR}/{}", trimmed.trim_start_matches('/'))
    };

    let mut cleaned: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if cleaned.pop().is_none() {
                    return Err(AppError::InvalidInput(format!(
                        "path {requested:?} escapes the workspace root"
                    )));
                }
            }
            other => cleaned.push(other),
        }
    }
    let resolved = format!("/{}", cleaned.join("/"));
    if resolved != WORKING_DIR && !resolved.starts_with(&format!("{WORKING_DIR}/")) {
        return Err(AppError::InvalidInput(format!(
            "path {requested:?} escapes the workspace root"
        )));
    }
    Ok(resolved)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileRequest {
    List { path: String },
    Read { path: String },
    Write { path: String, content: String },
    Mkdir { path: String },
    Delete { path: String },
    Rename { from: String, to: String },
    Stat { path: String },
    ListAll,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FileResponse {
    Entries(Vec<FileInfo>),
    Content { path: String, content: String },
    Info(FileInfo),
    Ok { ok: bool },
}

pub async fn execute(
    pool: &SftpPool,
    host: &str,
    port: u16,
    request: &FileRequest,
) -> AppResult<FileResponse> {
    match request {
        FileRequest::List { path } => {
            let path = resolve_path(path)?;
            let entries = pool
                .with_session(host, port, |sftp| {
                    let path = path.clone();
                    async move { list_dir(&sftp, &path).await }
                })
                .await?;
            Ok(FileResponse::Entries(entries))
        }
        FileRequest::Read { path } => {
            let path = resolve_path(path)?;
            let content = pool
                .with_session(host, port, |sftp| {
                    let path = path.clone();
                    async move { read_text(&sftp, &path).await }
                })
                .await?;
            Ok(FileResponse::Content { path, content })
        }
        FileRequest::Write { path, content } => {
            if content.len() as u64 > MAX_FILE_SIZE {
                return Err(AppError::InvalidInput(format!(
                    "file exceeds {MAX_FILE_SIZE} bytes"
                )));
            }
            let path = resolve_path(path)?;
            pool.with_session(host, port, |sftp| {
                let path = path.clone();
                let content = content.clone();
                async move { write_text(&sftp, &path, &content).await }
            })
            .await?;
            Ok(FileResponse::Ok { ok: true })
        }
        FileRequest::Mkdir { path } => {
            let path = resolve_path(path)?;
            pool.with_session(host, port, |sftp| {
                let path = path.clone();
                async move { mkdir_all(&sftp, &path).await }
            })
            .await?;
            Ok(FileResponse::Ok { ok: true })
        }
        FileRequest::Delete { path } => {
            let path = resolve_path(path)?;
            if path == WORKING_DIR {
                return Err(AppError::InvalidInput(
                    "refusing to delete the workspace root".into(),
                ));
            }
            pool.with_session(host, port, |sftp| {
                let path = path.clone();
                async move { delete_recursive(&sftp, &path).await }
            })
            .await?;
            Ok(FileResponse::Ok { ok: true })
        }
        FileRequest::Rename { from, to } => {
            let from = resolve_path(from)?;
            let to = resolve_path(to)?;
            pool.with_session(host, port, |sftp| {
                let from = from.clone();
                let to = to.clone();
                async move {
                    sftp.rename(&from, &to)
                        .await
                        .map_err(|e| AppError::UpstreamFailure(format!("rename: {e}")))
                }
            })
            .await?;
            Ok(FileResponse::Ok { ok: true })
        }
        FileRequest::Stat { path } => {
            let path = resolve_path(path)?;
            let info = pool
                .with_session(host, port, |sftp| {
                    let path = path.clone();
                    async move { stat(&sftp, &path).await }
                })
                .await?;
            Ok(FileResponse::Info(info))
        }
        FileRequest::ListAll => {
            let entries = pool
                .with_session(host, port, |sftp| async move { walk_all(&sftp).await })
                .await?;
            Ok(FileResponse::Entries(entries))
        }
    }
}

async fn list_dir(
    sftp: &russh_sftp::client::SftpSession,
    path: &str,
) -> AppResult<Vec<FileInfo>> {
    let dir = sftp
        .read_dir(path)
        .await
        .map_err(|e| map_sftp_error(e, path))?;
    let mut entries = Vec::new();
    for entry in dir {
        let name = entry.file_name();
        let metadata = entry.metadata();
        entries.push(FileInfo {
            path: format!("{path}/{name}"),
            is_dir: metadata.is_dir(),
            size: metadata.size.unwrap_or(0),
            name,
        });
    }
    entries.sort_by(|a, b| (!a.is_dir, a.name.clone()).cmp(&(!b.is_dir, b.name.clone())));
    Ok(entries)
}

async fn read_text(sftp: &russh_sftp::client::SftpSession, path: &str) -> AppResult<String> {
    let metadata = sftp.metadata(path).await.map_err(|e| map_sftp_error(e, path))?;
    if metadata.is_dir() {
        return Err(AppError::InvalidInput(format!("{path} is a directory")));
    }
    if metadata.size.unwrap_or(0) > MAX_FILE_SIZE {
        return Err(AppError::InvalidInput(format!(
            "file exceeds {MAX_FILE_SIZE} bytes"
        )));
    }
    let mut file = sftp.open(path).await.map_err(|e| map_sftp_error(e, path))?;
    let mut buf = Vec::with_capacity(metadata.size.unwrap_or(0) as usize);
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| AppError::UpstreamFailure(format!("read {path}: {e}")))?;
    if looks_binary(&buf) {
        return Err(AppError::InvalidInput(format!(
            "{path} is a binary file"
        )));
    }
    String::from_utf8(buf)
        .map_err(|_| AppError::InvalidInput(format!("{path} is not valid UTF-8")))
}

pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_LEN).any(|b| *b == 0)
}

async fn write_text(
    sftp: &russh_sftp::client::SftpSession,
    path: &str,
    content: &str,
) -> AppResult<()> {
    if let Some(parent) = parent_dir(path) {
        mkdir_all(sftp, &parent).await?;
    }
    let mut file = sftp
        .create(path)
        .await
        .map_err(|e| map_sftp_error(e, path))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| AppError::UpstreamFailure(format!("write {path}: {e}")))?;
    file.shutdown()
        .await
        .map_err(|e| AppError::UpstreamFailure(format!("flush {path}: {e}")))?;
    Ok(())
}

fn parent_dir(path: &str) -> Option<String> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(path[..idx].to_string())
}

/// Raw read used by internal consumers (agent history lives outside the
/// user-visible project tree). No path pinning, no binary sniffing.
pub(crate) async fn read_raw(
    sftp: &russh_sftp::client::SftpSession,
    path: &str,
) -> AppResult<Vec<u8>> {
    let mut file = sftp.open(path).await.map_err(|e| map_sftp_error(e, path))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| AppError::UpstreamFailure(format!("read {path}: {e}")))?;
    Ok(buf)
}

pub(crate) async fn write_raw(
    sftp: &russh_sftp::client::SftpSession,
    path: &str,
    bytes: &[u8],
) -> AppResult<()> {
    if let Some(parent) = parent_dir(path) {
        mkdir_all(sftp, &parent).await?;
    }
    let mut file = sftp
        .create(path)
        .await
        .map_err(|e| map_sftp_error(e, path))?;
    file.write_all(bytes)
        .await
        .map_err(|e| AppError::UpstreamFailure(format!("write {path}: {e}")))?;
    file.shutdown()
        .await
        .map_err(|e| AppError::UpstreamFailure(format!("flush {path}: {e}")))?;
    Ok(())
}

async fn mkdir_all(sftp: &russh_sftp::client::SftpSession, path: &str) -> AppResult<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match sftp.metadata(&current).await {
            Ok(metadata) if metadata.is_dir() => continue,
            Ok(_) => {
                return Err(AppError::Conflict(format!(
                    "{current} exists and is not a directory"
                )))
            }
            Err(_) => {
                sftp.create_dir(&current)
                    .await
                    .map_err(|e| map_sftp_error(e, &current))?;
            }
        }
    }
    Ok(())
}

fn delete_recursive<'a>(
    sftp: &'a russh_sftp::client::SftpSession,
    path: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = AppResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let metadata = sftp.metadata(path).await.map_err(|e| map_sftp_error(e, path))?;
        if metadata.is_dir() {
            let dir = sftp.read_dir(path).await.map_err(|e| map_sftp_error(e, path))?;
            for entry in dir {
                let child = format!("{path}/{}", entry.file_name());
                delete_recursive(sftp, &child).await?;
            }
            sftp.remove_dir(path)
                .await
                .map_err(|e| map_sftp_error(e, path))?;
        } else {
            sftp.remove_file(path)
                .await
                .map_err(|e| map_sftp_error(e, path))?;
        }
        Ok(())
    })
}

async fn stat(sftp: &russh_sftp::client::SftpSession, path: &str) -> AppResult<FileInfo> {
    let metadata = sftp.metadata(path).await.map_err(|e| map_sftp_error(e, path))?;
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    Ok(FileInfo {
        name,
        path: path.to_string(),
        is_dir: metadata.is_dir(),
        size: metadata.size.unwrap_or(0),
    })
}

/// Breadth-first walk of the project tree, skipping the hidden set.
async fn walk_all(sftp: &russh_sftp::client::SftpSession) -> AppResult<Vec<FileInfo>> {
    let mut out = Vec::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(WORKING_DIR.to_string());
    while let Some(dir) = queue.pop_front() {
        let entries = match sftp.read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(?err, %dir, "skipping unreadable directory in walk");
                continue;
            }
        };
        for entry in entries {
            let name = entry.file_name();
            if HIDDEN_SET.contains(&name.as_str()) {
                continue;
            }
            let metadata = entry.metadata();
            let path = format!("{dir}/{name}");
            if metadata.is_dir() {
                queue.push_back(path.clone());
                out.push(FileInfo {
                    name,
                    path,
                    is_dir: true,
                    size: 0,
                });
            } else {
                out.push(FileInfo {
                    name,
                    path,
                    is_dir: false,
                    size: metadata.size.unwrap_or(0),
                });
            }
        }
    }
    Ok(out)
}

fn map_sftp_error(err: russh_sftp::client::error::Error, path: &str) -> AppError {
    let text = err.to_string();
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("no such file") || lowered.contains("nosuchfile") {
        AppError::NotFound
    } else if lowered.contains("permission") {
        AppError::Forbidden
    } else {
        AppError::UpstreamFailure(format!("sftp {path}: {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_pinned_under_root() {
        assert_eq!(resolve_path("src/main.rs").unwrap(), "/home/coder/project/src/main.rs");
        assert_eq!(resolve_path("/etc/passwd").unwrap(), "/home/coder/project/etc/passwd");
        assert_eq!(resolve_path("").unwrap(), WORKING_DIR);
        assert_eq!(resolve_path(".").unwrap(), WORKING_DIR);
    }

    #[test]
    fn absolute_working_dir_paths_pass_through() {
        assert_eq!(
            resolve_path("/home/coder/project/a/b.txt").unwrap(),
            "/home/coder/project/a/b.txt"
        );
        assert_eq!(resolve_path(WORKING_DIR).unwrap(), WORKING_DIR);
        // A sibling prefix must not be mistaken for the root.
        assert_eq!(
            resolve_path("/home/coder/projectx").unwrap(),
            "/home/coder/project/home/coder/projectx"
        );
    }

    #[test]
    fn dotdot_segments_collapse_but_cannot_escape() {
        assert_eq!(
            resolve_path("a/b/../c.txt").unwrap(),
            "/home/coder/project/a/c.txt"
        );
        assert!(resolve_path("../../etc/passwd").is_err());
        assert!(resolve_path("/home/coder/project/../../../etc").is_err());
        assert!(resolve_path("a/../../escape").is_err());
    }

    #[test]
    fn binary_detection_scans_prefix_only() {
        assert!(!looks_binary(b"plain text"));
        assert!(looks_binary(b"ab\0cd"));
        let mut long = vec![b'a'; 9000];
        long[8500] = 0;
        // NUL beyond the sniff window does not mark the file binary.
        assert!(!looks_binary(&long));
        long[100] = 0;
        assert!(looks_binary(&long));
    }

    #[test]
    fn parent_dir_extraction() {
        assert_eq!(parent_dir("/a/b/c.txt").unwrap(), "/a/b");
        assert_eq!(parent_dir("/a"), None);
    }
}
