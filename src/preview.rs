//! Preview reverse proxy: routes `{port}-{prefix8}[-{token}].{domain}` hosts
//! to the private address of the owning workspace.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::lifecycle::LifecycleManager;
use crate::workspaces::{self, Workspace, WorkspaceStatus};

pub const CACHE_TTL: Duration = Duration::from_secs(30);

static SUBDOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,5})-([0-9a-fA-F]{8})(?:-([A-Za-z0-9]{1,64}))?$")
        .expect("subdomain regex compiles")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHost {
    pub port: u16,
    pub prefix: String,
    pub token: Option<String>,
}

/// Parse a preview host against the configured domain suffix.
pub fn parse_host(host: &str, domain: &str) -> AppResult<ParsedHost> {
    // Strip a trailing `:port` only when the remainder holds no dot, so an
    // IPv6 literal is left alone.
    let host = match host.split_once(':') {
        Some((before, after)) if !after.contains('.') => before,
        _ => host,
    };
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    let lowered = host.to_ascii_lowercase();
    let subdomain_len = lowered
        .strip_suffix(&suffix)
        .map(str::len)
        .ok_or_else(|| AppError::InvalidInput(format!("host {host:?} is not a preview host")))?;
    // Token case is preserved; only the suffix match is case-insensitive.
    let subdomain = &host[..subdomain_len];

    let caps = SUBDOMAIN_RE
        .captures(subdomain)
        .ok_or_else(|| AppError::InvalidInput(format!("bad preview subdomain {subdomain:?}")))?;
    let port: u32 = caps[1]
        .parse()
        .map_err(|_| AppError::InvalidInput("bad preview port".into()))?;
    if !(1..=65535).contains(&port) {
        return Err(AppError::InvalidInput(format!("port {port} out of range")));
    }
    Ok(ParsedHost {
        port: port as u16,
        prefix: caps[2].to_ascii_lowercase(),
        token: caps.get(3).map(|m| m.as_str().to_string()),
    })
}

pub fn format_host(port: u16, prefix: &str, token: Option<&str>, domain: &str) -> String {
    match token {
        Some(token) => format!("{port}-{prefix}-{token}.{domain}"),
        None => format!("{port}-{prefix}.{domain}"),
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub workspace_id: Uuid,
    pub private_ip: String,
    /// SHA-256 of the workspace preview token, captured at fill time so a
    /// cached prefix never bypasses the token gate.
    pub token_sha256: Option<String>,
    pub expires_at: Instant,
}

/// TTL cache from prefix to resolved workspace address.
pub struct PreviewCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl PreviewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, prefix: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        let entry = entries.get(prefix)?;
        if Instant::now() < entry.expires_at {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub async fn set(&self, prefix: &str, workspace: &Workspace, private_ip: String) {
        let entry = CacheEntry {
            workspace_id: workspace.id,
            private_ip,
            token_sha256: workspace.preview_token.as_deref().map(sha256_hex),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(prefix.to_string(), entry);
    }

    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.entries.write().await.remove(prefix);
    }

    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.write().await.retain(|_, e| e.expires_at > now);
    }

    /// Background purge at half the TTL cadence.
    pub fn spawn_purge_ticker(self: Arc<Self>) {
        let period = self.ttl / 2;
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cache.purge_expired().await;
            }
        });
    }
}

pub enum PrefixLookup {
    Running(Workspace),
    NotRunning,
    Missing,
    Ambiguous,
}

/// Resolve a prefix to its workspace row. More than one *running* match is
/// refused outright rather than picked arbitrarily.
pub async fn find_by_prefix(pool: &PgPool, prefix: &str) -> AppResult<PrefixLookup> {
    let rows = sqlx::query(
        "SELECT id, user_id, name, description, cpu_class, cpus, memory_mb, volume_gb, gpu, \
         status, error_message, machine_id, volume_id, base_image, env_overrides, preview_token, \
         idle_timeout_minutes, last_accessed_at, created_at, updated_at \
         FROM projects WHERE replace(id::text, '-', '') LIKE $1 || '%'",
    )
    .bind(prefix)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(PrefixLookup::Missing);
    }
    let mut running = Vec::new();
    for row in &rows {
        let workspace = workspaces::from_row(row)?;
        if workspace.status == WorkspaceStatus::Running {
            running.push(workspace);
        }
    }
    match running.len() {
        0 => Ok(PrefixLookup::NotRunning),
        1 => Ok(PrefixLookup::Running(running.remove(0))),
        _ => Ok(PrefixLookup::Ambiguous),
    }
}

pub struct PreviewProxy {
    pool: PgPool,
    cache: Arc<PreviewCache>,
    manager: Arc<LifecycleManager>,
    client: Client<HttpConnector>,
}

impl PreviewProxy {
    pub fn new(pool: PgPool, cache: Arc<PreviewCache>, manager: Arc<LifecycleManager>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        let client = Client::builder().build(connector);
        Self {
            pool,
            cache,
            manager,
            client,
        }
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), hyper::Error> {
        let proxy = self;
        let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
            let proxy = Arc::clone(&proxy);
            let remote = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { Ok::<_, Infallible>(proxy.handle(req, remote).await) }
                }))
            }
        });
        tracing::info!(%addr, "preview proxy listening");
        hyper::Server::bind(&addr).serve(make_svc).await
    }

    async fn handle(&self, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        match self.route(req, remote).await {
            Ok(resp) => resp,
            Err(err) => {
                let status = match &err {
                    AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    AppError::NotFound => StatusCode::NOT_FOUND,
                    AppError::Forbidden => StatusCode::FORBIDDEN,
                    AppError::Conflict(_) => StatusCode::CONFLICT,
                    AppError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    AppError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!(error = ?err, "preview request failed");
                }
                Response::builder()
                    .status(status)
                    .body(Body::from(err.to_string()))
                    .unwrap_or_default()
            }
        }
    }

    async fn route(&self, req: Request<Body>, remote: SocketAddr) -> AppResult<Response<Body>> {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .ok_or_else(|| AppError::InvalidInput("missing Host header".into()))?;
        let parsed = parse_host(&host, crate::config::PREVIEW_DOMAIN.as_str())?;

        let entry = match self.cache.get(&parsed.prefix).await {
            Some(entry) => entry,
            None => self.resolve_and_fill(&parsed.prefix).await?,
        };

        // Token gate applies to cached and fresh entries alike.
        match (&entry.token_sha256, &parsed.token) {
            (None, _) => {}
            (Some(expected), Some(presented)) if *expected == sha256_hex(presented) => {}
            (Some(_), _) => return Err(AppError::Forbidden),
        }

        if is_websocket_upgrade(&req) {
            self.tunnel(req, &entry, parsed.port).await
        } else {
            self.forward(req, &entry, parsed.port, remote, &host).await
        }
    }

    async fn resolve_and_fill(&self, prefix: &str) -> AppResult<CacheEntry> {
        let workspace = match find_by_prefix(&self.pool, prefix).await? {
            PrefixLookup::Running(workspace) => workspace,
            PrefixLookup::NotRunning => {
                return Err(AppError::BackendUnavailable(
                    "workspace is not running".into(),
                ))
            }
            PrefixLookup::Missing => return Err(AppError::NotFound),
            PrefixLookup::Ambiguous => {
                return Err(AppError::Conflict(
                    "preview prefix matches multiple running workspaces".into(),
                ))
            }
        };
        let machine_id = workspace.machine_id.clone().ok_or_else(|| {
            AppError::BackendUnavailable("running workspace has no machine".into())
        })?;
        let machine = self.manager.backend().get_machine(&machine_id).await?;
        let private_ip = machine
            .private_ip
            .ok_or_else(|| AppError::BackendUnavailable("machine has no address".into()))?;
        self.cache.set(prefix, &workspace, private_ip.clone()).await;
        self.manager.touch(workspace.id).await;
        let entry = self
            .cache
            .get(prefix)
            .await
            .ok_or_else(|| AppError::Internal("cache entry vanished after fill".into()))?;
        Ok(entry)
    }

    async fn forward(
        &self,
        mut req: Request<Body>,
        entry: &CacheEntry,
        port: u16,
        remote: SocketAddr,
        original_host: &str,
    ) -> AppResult<Response<Body>> {
        let upstream_uri = upstream_uri(&entry.private_ip, port, req.uri())?;
        strip_hop_headers(req.headers_mut());
        rewrite_headers(req.headers_mut(), port, remote, original_host);
        *req.uri_mut() = upstream_uri;

        let mut resp = self
            .client
            .request(req)
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("upstream request failed: {e}")))?;
        add_cors_headers(resp.headers_mut());
        Ok(resp)
    }

    /// Forward the upgrade request upstream, then splice the two upgraded
    /// byte streams together. EOF on either side is a normal close.
    async fn tunnel(
        &self,
        mut req: Request<Body>,
        entry: &CacheEntry,
        port: u16,
    ) -> AppResult<Response<Body>> {
        let upstream_uri = upstream_uri(&entry.private_ip, port, req.uri())?;
        let mut outgoing = Request::builder()
            .method(req.method().clone())
            .uri(upstream_uri)
            .body(Body::empty())
            .map_err(|e| AppError::Internal(format!("build upgrade request: {e}")))?;
        for (name, value) in req.headers() {
            outgoing.headers_mut().insert(name.clone(), value.clone());
        }
        let host_value = HeaderValue::from_str(&format!("localhost:{port}"))
            .map_err(|e| AppError::Internal(format!("host header: {e}")))?;
        outgoing.headers_mut().insert(hyper::header::HOST, host_value);

        let mut upstream_resp = self
            .client
            .request(outgoing)
            .await
            .map_err(|e| AppError::UpstreamFailure(format!("upstream dial failed: {e}")))?;

        if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            add_cors_headers(upstream_resp.headers_mut());
            return Ok(upstream_resp);
        }

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        if let Some(headers) = response.headers_mut() {
            for (name, value) in upstream_resp.headers() {
                headers.insert(name.clone(), value.clone());
            }
        }

        let client_upgrade = hyper::upgrade::on(&mut req);
        let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
        tokio::spawn(async move {
            let client_io = match client_upgrade.await {
                Ok(io) => io,
                Err(err) => {
                    tracing::warn!(?err, "client websocket upgrade failed");
                    return;
                }
            };
            let upstream_io = match upstream_upgrade.await {
                Ok(io) => io,
                Err(err) => {
                    tracing::warn!(?err, "upstream websocket upgrade failed");
                    return;
                }
            };
            let mut client_io = client_io;
            let mut upstream_io = upstream_io;
            if let Err(err) =
                tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
            {
                tracing::debug!(?err, "websocket tunnel closed with error");
            }
        });

        response
            .body(Body::empty())
            .map_err(|e| AppError::Internal(format!("build 101 response: {e}")))
    }
}

fn upstream_uri(ip: &str, port: u16, original: &Uri) -> AppResult<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{ip}:{port}{path_and_query}")
        .parse()
        .map_err(|e| AppError::Internal(format!("bad upstream uri: {e}")))
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_is_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

const HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

fn strip_hop_headers(headers: &mut hyper::HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove(hyper::header::UPGRADE);
}

fn rewrite_headers(
    headers: &mut hyper::HeaderMap,
    port: u16,
    remote: SocketAddr,
    original_host: &str,
) {
    // Dev servers with host allowlists accept localhost.
    if let Ok(value) = HeaderValue::from_str(&format!("localhost:{port}")) {
        headers.insert(hyper::header::HOST, value);
    }
    let client_ip = remote.ip().to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
}

fn add_cors_headers(headers: &mut hyper::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "preview.example.test";

    #[test]
    fn parse_round_trip() {
        for (port, prefix, token) in [
            (5173u16, "deadbeef", None),
            (80, "0123abcd", Some("Tok3n")),
            (65535, "ffffffff", Some("a")),
        ] {
            let host = format_host(port, prefix, token, DOMAIN);
            let parsed = parse_host(&host, DOMAIN).unwrap();
            assert_eq!(parsed.port, port);
            assert_eq!(parsed.prefix, prefix);
            assert_eq!(parsed.token.as_deref(), token);
        }
    }

    #[test]
    fn parse_is_case_insensitive_on_host_parts() {
        let parsed = parse_host("5173-DEADBEEF.Preview.Example.Test", DOMAIN).unwrap();
        assert_eq!(parsed.prefix, "deadbeef");
    }

    #[test]
    fn parse_strips_port_suffix() {
        let parsed = parse_host("5173-deadbeef.preview.example.test:8081", DOMAIN).unwrap();
        assert_eq!(parsed.port, 5173);
    }

    #[test]
    fn parse_rejects_bad_grammar() {
        // Missing domain suffix.
        assert!(parse_host("5173-deadbeef.other.test", DOMAIN).is_err());
        // Prefix too short.
        assert!(parse_host("5173-dead.preview.example.test", DOMAIN).is_err());
        // Prefix not hex.
        assert!(parse_host("5173-deadbeez.preview.example.test", DOMAIN).is_err());
        // Port zero and out of range.
        assert!(parse_host("0-deadbeef.preview.example.test", DOMAIN).is_err());
        assert!(parse_host("65536-deadbeef.preview.example.test", DOMAIN).is_err());
        // Token with illegal characters.
        assert!(parse_host("80-deadbeef-t_k.preview.example.test", DOMAIN).is_err());
        // Bare domain.
        assert!(parse_host(DOMAIN, DOMAIN).is_err());
    }

    fn dummy_workspace(preview_token: Option<&str>) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "ws".into(),
            description: None,
            hardware: crate::workspaces::HardwareSpec::default(),
            status: WorkspaceStatus::Running,
            error_message: None,
            machine_id: Some("m1".into()),
            volume_id: Some("v1".into()),
            base_image: "img".into(),
            env_overrides: serde_json::json!({}),
            preview_token: preview_token.map(str::to_string),
            idle_timeout_minutes: None,
            last_accessed_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn cache_set_get_invalidate() {
        let cache = PreviewCache::new(Duration::from_secs(30));
        let ws = dummy_workspace(None);
        cache.set("deadbeef", &ws, "10.0.0.5".into()).await;
        let entry = cache.get("deadbeef").await.unwrap();
        assert_eq!(entry.workspace_id, ws.id);
        assert_eq!(entry.private_ip, "10.0.0.5");
        cache.invalidate_prefix("deadbeef").await;
        assert!(cache.get("deadbeef").await.is_none());
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let cache = PreviewCache::new(Duration::from_millis(10));
        let ws = dummy_workspace(None);
        cache.set("deadbeef", &ws, "10.0.0.5".into()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("deadbeef").await.is_none());
        cache.purge_expired().await;
        assert!(cache.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn cache_entry_keeps_token_hash() {
        let cache = PreviewCache::new(Duration::from_secs(30));
        let ws = dummy_workspace(Some("abc123"));
        cache.set("deadbeef", &ws, "10.0.0.5".into()).await;
        let entry = cache.get("deadbeef").await.unwrap();
        assert_eq!(entry.token_sha256.unwrap(), sha256_hex("abc123"));
    }

    #[test]
    fn websocket_upgrade_detection() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let plain = Request::builder().body(()).unwrap();
        assert!(!is_websocket_upgrade(&plain));
    }
}
