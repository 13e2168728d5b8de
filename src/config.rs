use once_cell::sync::Lazy;

/// Port the authenticated API listens on. Defaults to 8080.
pub static API_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080)
});

/// Port the preview proxy listens on. Defaults to 8081.
pub static PREVIEW_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("PREVIEW_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8081)
});

/// Bind address for both listeners. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Domain suffix for preview hosts (`{port}-{prefix}[-{token}].{domain}`).
pub static PREVIEW_DOMAIN: Lazy<String> =
    Lazy::new(|| std::env::var("PREVIEW_DOMAIN").unwrap_or_else(|_| "preview.localhost".into()));

/// Select the local container backend instead of the remote machines API.
pub static LOCAL_MODE: Lazy<bool> = Lazy::new(|| {
    std::env::var("LOCAL_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
});

/// Fallback idle timeout when neither project nor user settings carry one.
pub static IDLE_TIMEOUT_MINUTES: Lazy<i32> = Lazy::new(|| {
    std::env::var("IDLE_TIMEOUT_MINUTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10)
});

/// Master key for sealing user-held provider secrets. Optional; when absent
/// the api-key endpoints refuse.
pub static ENCRYPTION_MASTER_KEY: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("ENCRYPTION_MASTER_KEY").ok());

/// JWKS endpoint of the identity provider. Tried first for JWT verification.
pub static JWKS_URL: Lazy<Option<String>> = Lazy::new(|| std::env::var("JWKS_URL").ok());

/// Shared HS256 secret. Fallback when JWKS is unset or fails.
pub static JWT_HS_SECRET: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("JWT_HS_SECRET").ok());

/// Remote machines API base URL.
pub static MACHINES_API_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("MACHINES_API_URL").unwrap_or_else(|_| "https://api.machines.dev/v1".into())
});

/// Bearer token for the remote machines API. Mandatory unless LOCAL_MODE.
pub static MACHINES_API_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("MACHINES_API_TOKEN").ok());

/// Region volumes and machines are placed in.
pub static MACHINES_REGION: Lazy<String> =
    Lazy::new(|| std::env::var("MACHINES_REGION").unwrap_or_else(|_| "iad".into()));

/// Image used for workspaces that don't override it.
pub static WORKSPACE_BASE_IMAGE: Lazy<String> = Lazy::new(|| {
    std::env::var("WORKSPACE_BASE_IMAGE")
        .unwrap_or_else(|_| "ghcr.io/devgate/workspace:latest".into())
});

/// Unix user inside the workspace that owns the project tree and sshd.
pub static WORKSPACE_SSH_USER: Lazy<String> =
    Lazy::new(|| std::env::var("WORKSPACE_SSH_USER").unwrap_or_else(|_| "coder".into()));

/// Path to the private key the gateway presents for workspace SSH. When
/// unset, password auth with `WORKSPACE_SSH_PASSWORD` is attempted.
pub static WORKSPACE_SSH_KEY: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("WORKSPACE_SSH_KEY").ok());

pub static WORKSPACE_SSH_PASSWORD: Lazy<String> =
    Lazy::new(|| std::env::var("WORKSPACE_SSH_PASSWORD").unwrap_or_else(|_| "coder".into()));

/// Validate mandatory configuration. Called once at startup so a
/// misconfigured process exits non-zero before binding any listener.
pub fn validate() -> Result<(), String> {
    if std::env::var("DATABASE_URL").is_err() {
        return Err("DATABASE_URL must be set".into());
    }
    if !*LOCAL_MODE && MACHINES_API_TOKEN.is_none() {
        return Err("MACHINES_API_TOKEN must be set unless LOCAL_MODE=true".into());
    }
    if JWKS_URL.is_none() && JWT_HS_SECRET.is_none() {
        return Err("one of JWKS_URL or JWT_HS_SECRET must be set".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn local_mode_parses_truthy_values() {
        std::env::set_var("LOCAL_MODE", "1");
        // Lazy statics are process-wide; parse the raw var the same way.
        let parsed = std::env::var("LOCAL_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        assert!(parsed);
    }
}
