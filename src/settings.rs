//! Per-user defaults: hardware shape and idle timeout for new workspaces.

use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::workspaces::{validate_idle_timeout, HardwareSpec};

#[derive(Debug, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(flatten)]
    pub hardware: HardwareSpec,
    pub default_idle_timeout_minutes: i32,
}

pub async fn get_settings(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<UserSettings>> {
    let row = sqlx::query(
        "SELECT cpu_class, cpus, memory_mb, volume_gb, gpu, default_idle_timeout_minutes \
         FROM user_settings WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(&pool)
    .await?
    .ok_or(AppError::NotFound)?;
    Ok(Json(UserSettings {
        hardware: HardwareSpec {
            cpu_class: row.get("cpu_class"),
            cpus: row.get("cpus"),
            memory_mb: row.get("memory_mb"),
            volume_gb: row.get("volume_gb"),
            gpu: row.get("gpu"),
        },
        default_idle_timeout_minutes: row.get("default_idle_timeout_minutes"),
    }))
}

pub async fn put_settings(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<UserSettings>,
) -> AppResult<Json<UserSettings>> {
    payload.hardware.validate()?;
    validate_idle_timeout(payload.default_idle_timeout_minutes)?;
    sqlx::query(
        "UPDATE user_settings SET cpu_class = $1, cpus = $2, memory_mb = $3, volume_gb = $4, \
         gpu = $5, default_idle_timeout_minutes = $6, updated_at = now() WHERE user_id = $7",
    )
    .bind(&payload.hardware.cpu_class)
    .bind(payload.hardware.cpus)
    .bind(payload.hardware.memory_mb)
    .bind(payload.hardware.volume_gb)
    .bind(&payload.hardware.gpu)
    .bind(payload.default_idle_timeout_minutes)
    .bind(user_id)
    .execute(&pool)
    .await?;
    Ok(Json(payload))
}
