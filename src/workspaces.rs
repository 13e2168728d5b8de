use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::lifecycle::LifecycleManager;

pub const ALLOWED_IDLE_TIMEOUTS: [i32; 5] = [0, 5, 10, 30, 60];
pub const ALLOWED_GPUS: [&str; 4] = ["a10", "a100-40gb", "a100-80gb", "l40s"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Starting => "starting",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Stopping => "stopping",
            WorkspaceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "stopped" => Ok(WorkspaceStatus::Stopped),
            "starting" => Ok(WorkspaceStatus::Starting),
            "running" => Ok(WorkspaceStatus::Running),
            "stopping" => Ok(WorkspaceStatus::Stopping),
            "error" => Ok(WorkspaceStatus::Error),
            other => Err(AppError::Internal(format!(
                "unknown workspace status {other:?} in database"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub cpu_class: String,
    pub cpus: i32,
    pub memory_mb: i32,
    pub volume_gb: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

impl Default for HardwareSpec {
    fn default() -> Self {
        Self {
            cpu_class: "shared".into(),
            cpus: 2,
            memory_mb: 2048,
            volume_gb: 10,
            gpu: None,
        }
    }
}

impl HardwareSpec {
    pub fn guest(&self) -> crate::compute::GuestSpec {
        crate::compute::GuestSpec {
            cpu_class: self.cpu_class.clone(),
            cpus: self.cpus,
            memory_mb: self.memory_mb,
            gpu: self.gpu.clone(),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.cpu_class != "shared" && self.cpu_class != "dedicated" {
            return Err(AppError::InvalidInput(format!(
                "cpu_class must be shared or dedicated, got {:?}",
                self.cpu_class
            )));
        }
        if !(1..=16).contains(&self.cpus) {
            return Err(AppError::InvalidInput("cpus must be in [1, 16]".into()));
        }
        if !(256..=32768).contains(&self.memory_mb) {
            return Err(AppError::InvalidInput(
                "memory_mb must be in [256, 32768]".into(),
            ));
        }
        if !(1..=500).contains(&self.volume_gb) {
            return Err(AppError::InvalidInput(
                "volume_gb must be in [1, 500]".into(),
            ));
        }
        if let Some(ref gpu) = self.gpu {
            if !ALLOWED_GPUS.contains(&gpu.as_str()) {
                return Err(AppError::InvalidInput(format!("unknown gpu {gpu:?}")));
            }
        }
        Ok(())
    }
}

pub fn validate_idle_timeout(minutes: i32) -> AppResult<()> {
    if ALLOWED_IDLE_TIMEOUTS.contains(&minutes) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "idle_timeout_minutes must be one of {ALLOWED_IDLE_TIMEOUTS:?}"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub hardware: HardwareSpec,
    pub status: WorkspaceStatus,
    pub error_message: Option<String>,
    pub machine_id: Option<String>,
    pub volume_id: Option<String>,
    pub base_image: String,
    pub env_overrides: serde_json::Value,
    pub preview_token: Option<String>,
    pub idle_timeout_minutes: Option<i32>,
    pub last_accessed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Workspace {
    /// First 8 hex chars of the id, the preview routing key.
    pub fn prefix(&self) -> String {
        prefix8(&self.id)
    }
}

pub fn prefix8(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

pub fn from_row(row: &PgRow) -> AppResult<Workspace> {
    let status: String = row.get("status");
    Ok(Workspace {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        description: row.get("description"),
        hardware: HardwareSpec {
            cpu_class: row.get("cpu_class"),
            cpus: row.get("cpus"),
            memory_mb: row.get("memory_mb"),
            volume_gb: row.get("volume_gb"),
            gpu: row.get("gpu"),
        },
        status: WorkspaceStatus::parse(&status)?,
        error_message: row.get("error_message"),
        machine_id: row.get("machine_id"),
        volume_id: row.get("volume_id"),
        base_image: row.get("base_image"),
        env_overrides: row.get("env_overrides"),
        preview_token: row.get("preview_token"),
        idle_timeout_minutes: row.get("idle_timeout_minutes"),
        last_accessed_at: row.get("last_accessed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const WORKSPACE_COLUMNS: &str = "id, user_id, name, description, cpu_class, cpus, memory_mb, \
     volume_gb, gpu, status, error_message, machine_id, volume_id, base_image, env_overrides, \
     preview_token, idle_timeout_minutes, last_accessed_at, created_at, updated_at";

pub async fn get_workspace(pool: &PgPool, id: Uuid) -> AppResult<Workspace> {
    let row = sqlx::query(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM projects WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)?;
    from_row(&row)
}

/// Owner-scoped fetch. A foreign id yields NotFound, never Forbidden, so
/// existence of other users' workspaces is not disclosed.
pub async fn get_owned_workspace(pool: &PgPool, id: Uuid, user_id: Uuid) -> AppResult<Workspace> {
    let row = sqlx::query(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM projects WHERE id = $1 AND user_id = $2"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)?;
    from_row(&row)
}

#[derive(Serialize)]
pub struct WorkspaceView {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub hardware: HardwareSpec,
    pub status: &'static str,
    pub error_message: Option<String>,
    pub preview_token: Option<String>,
    pub preview_prefix: String,
    pub idle_timeout_minutes: Option<i32>,
    pub last_accessed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Workspace> for WorkspaceView {
    fn from(w: Workspace) -> Self {
        let preview_prefix = w.prefix();
        Self {
            id: w.id,
            name: w.name,
            description: w.description,
            hardware: w.hardware,
            status: w.status.as_str(),
            error_message: w.error_message,
            preview_token: w.preview_token,
            preview_prefix,
            idle_timeout_minutes: w.idle_timeout_minutes,
            last_accessed_at: w.last_accessed_at,
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateWorkspace {
    pub name: String,
    pub description: Option<String>,
    pub hardware: Option<HardwareSpec>,
    pub idle_timeout_minutes: Option<i32>,
    /// When true a random preview token is generated and required in the
    /// preview subdomain.
    #[serde(default)]
    pub preview_protected: bool,
    pub base_image: Option<String>,
    pub env_overrides: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct UpdateWorkspace {
    pub name: Option<String>,
    pub description: Option<String>,
}

fn generate_preview_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn default_hardware(pool: &PgPool, user_id: Uuid) -> AppResult<HardwareSpec> {
    let row = sqlx::query(
        "SELECT cpu_class, cpus, memory_mb, volume_gb, gpu FROM user_settings WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(match row {
        Some(row) => HardwareSpec {
            cpu_class: row.get("cpu_class"),
            cpus: row.get("cpus"),
            memory_mb: row.get("memory_mb"),
            volume_gb: row.get("volume_gb"),
            gpu: row.get("gpu"),
        },
        None => HardwareSpec::default(),
    })
}

pub async fn list_workspaces(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<Vec<WorkspaceView>>> {
    let rows = sqlx::query(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM projects WHERE user_id = $1 ORDER BY created_at DESC"
    ))
    .bind(user_id)
    .fetch_all(&pool)
    .await?;
    let mut views = Vec::with_capacity(rows.len());
    for row in &rows {
        views.push(from_row(row)?.into());
    }
    Ok(Json(views))
}

pub async fn create_workspace(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<CreateWorkspace>,
) -> AppResult<(StatusCode, Json<WorkspaceView>)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() || name.len() > 100 {
        return Err(AppError::InvalidInput(
            "name length must be in [1, 100]".into(),
        ));
    }
    let hardware = match payload.hardware {
        Some(hw) => hw,
        None => default_hardware(&pool, user_id).await?,
    };
    hardware.validate()?;
    if let Some(minutes) = payload.idle_timeout_minutes {
        validate_idle_timeout(minutes)?;
    }
    let preview_token = payload.preview_protected.then(generate_preview_token);
    let base_image = payload
        .base_image
        .unwrap_or_else(|| crate::config::WORKSPACE_BASE_IMAGE.clone());
    let env_overrides = payload.env_overrides.unwrap_or_else(|| json!({}));
    if !env_overrides.is_object() {
        return Err(AppError::InvalidInput("env_overrides must be an object".into()));
    }

    let id = Uuid::new_v4();
    let result = sqlx::query(&format!(
        "INSERT INTO projects (id, user_id, name, description, cpu_class, cpus, memory_mb, \
         volume_gb, gpu, status, base_image, env_overrides, preview_token, idle_timeout_minutes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'stopped', $10, $11, $12, $13) \
         RETURNING {WORKSPACE_COLUMNS}"
    ))
    .bind(id)
    .bind(user_id)
    .bind(&name)
    .bind(&payload.description)
    .bind(&hardware.cpu_class)
    .bind(hardware.cpus)
    .bind(hardware.memory_mb)
    .bind(hardware.volume_gb)
    .bind(&hardware.gpu)
    .bind(&base_image)
    .bind(&env_overrides)
    .bind(&preview_token)
    .bind(payload.idle_timeout_minutes)
    .fetch_one(&pool)
    .await;

    let row = match result {
        Ok(row) => row,
        Err(sqlx::Error::Database(db_err))
            if db_err.constraint() == Some("projects_user_id_name_key") =>
        {
            return Err(AppError::Conflict(format!(
                "a workspace named {name:?} already exists"
            )));
        }
        Err(err) => return Err(AppError::Db(err)),
    };
    let workspace = from_row(&row)?;
    tracing::info!(workspace_id = %workspace.id, %user_id, "workspace created");
    Ok((StatusCode::CREATED, Json(workspace.into())))
}

pub async fn get_workspace_handler(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WorkspaceView>> {
    let workspace = get_owned_workspace(&pool, id, user_id).await?;
    Ok(Json(workspace.into()))
}

pub async fn update_workspace(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateWorkspace>,
) -> AppResult<Json<WorkspaceView>> {
    get_owned_workspace(&pool, id, user_id).await?;
    if let Some(ref name) = payload.name {
        let name = name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(AppError::InvalidInput(
                "name length must be in [1, 100]".into(),
            ));
        }
    }
    let result = sqlx::query(&format!(
        "UPDATE projects SET name = COALESCE($1, name), \
         description = COALESCE($2, description), updated_at = now() \
         WHERE id = $3 AND user_id = $4 RETURNING {WORKSPACE_COLUMNS}"
    ))
    .bind(payload.name.as_deref().map(str::trim))
    .bind(&payload.description)
    .bind(id)
    .bind(user_id)
    .fetch_one(&pool)
    .await;
    let row = match result {
        Ok(row) => row,
        Err(sqlx::Error::Database(db_err))
            if db_err.constraint() == Some("projects_user_id_name_key") =>
        {
            return Err(AppError::Conflict("workspace name already in use".into()));
        }
        Err(err) => return Err(AppError::Db(err)),
    };
    Ok(Json(from_row(&row)?.into()))
}

pub async fn delete_workspace(
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<LifecycleManager>>,
    AuthUser { user_id }: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    get_owned_workspace(&pool, id, user_id).await?;
    Arc::clone(&manager).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct StartResponse {
    pub status: &'static str,
    pub connection_hint: serde_json::Value,
}

pub async fn start_workspace(
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<LifecycleManager>>,
    AuthUser { user_id }: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StartResponse>> {
    get_owned_workspace(&pool, id, user_id).await?;
    Arc::clone(&manager).start(id).await?;
    let refreshed = get_workspace(&pool, id).await?;
    let (host, port) =
        crate::resolver::resolve(manager.backend(), &refreshed, crate::resolver::Role::Ssh).await?;
    Ok(Json(StartResponse {
        status: "running",
        connection_hint: json!({ "ssh_host": host, "ssh_port": port }),
    }))
}

#[derive(Serialize)]
pub struct StopResponse {
    pub status: &'static str,
}

pub async fn stop_workspace(
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<LifecycleManager>>,
    AuthUser { user_id }: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StopResponse>> {
    get_owned_workspace(&pool, id, user_id).await?;
    Arc::clone(&manager).stop(id).await?;
    Ok(Json(StopResponse { status: "stopped" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hardware_is_valid() {
        HardwareSpec::default().validate().unwrap();
    }

    #[test]
    fn hardware_bounds_enforced() {
        let mut hw = HardwareSpec::default();
        hw.cpus = 0;
        assert!(hw.validate().is_err());
        hw.cpus = 17;
        assert!(hw.validate().is_err());
        hw.cpus = 16;
        assert!(hw.validate().is_ok());

        hw.memory_mb = 255;
        assert!(hw.validate().is_err());
        hw.memory_mb = 32768;
        assert!(hw.validate().is_ok());

        hw.volume_gb = 501;
        assert!(hw.validate().is_err());
        hw.volume_gb = 500;
        assert!(hw.validate().is_ok());

        hw.cpu_class = "turbo".into();
        assert!(hw.validate().is_err());
        hw.cpu_class = "dedicated".into();
        assert!(hw.validate().is_ok());

        hw.gpu = Some("a100-80gb".into());
        assert!(hw.validate().is_ok());
        hw.gpu = Some("rtx-5090".into());
        assert!(hw.validate().is_err());
    }

    #[test]
    fn idle_timeout_whitelist() {
        for minutes in ALLOWED_IDLE_TIMEOUTS {
            validate_idle_timeout(minutes).unwrap();
        }
        assert!(validate_idle_timeout(7).is_err());
        assert!(validate_idle_timeout(-5).is_err());
    }

    #[test]
    fn prefix_is_first_eight_simple_hex() {
        let id = Uuid::parse_str("deadbeef-1234-5678-9abc-def012345678").unwrap();
        assert_eq!(prefix8(&id), "deadbeef");
    }

    #[test]
    fn preview_token_matches_grammar() {
        let token = generate_preview_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
