//! User-held provider API keys, sealed at rest. Plaintext secrets exist
//! only transiently while composing workspace env or rewriting the blob.

use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

const SEAL_PURPOSE: &str = "api-keys";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiKeyEntry {
    secret: String,
    added_at: chrono::DateTime<chrono::Utc>,
}

async fn load_entries(pool: &PgPool, user_id: Uuid) -> AppResult<BTreeMap<String, ApiKeyEntry>> {
    let row = sqlx::query("SELECT api_keys_encrypted FROM profiles WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)?;
    let blob: Option<Vec<u8>> = row.get("api_keys_encrypted");
    let Some(blob) = blob else {
        return Ok(BTreeMap::new());
    };
    let key = crypto::envelope_key(SEAL_PURPOSE)?;
    let plaintext = crypto::open(&key, &blob)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| AppError::Internal(format!("api key blob corrupt: {e}")))
}

async fn store_entries(
    pool: &PgPool,
    user_id: Uuid,
    entries: &BTreeMap<String, ApiKeyEntry>,
) -> AppResult<()> {
    let blob = if entries.is_empty() {
        None
    } else {
        let key = crypto::envelope_key(SEAL_PURPOSE)?;
        let plaintext = serde_json::to_vec(entries)
            .map_err(|e| AppError::Internal(format!("serialize api keys: {e}")))?;
        Some(crypto::seal(&key, &plaintext)?)
    };
    sqlx::query("UPDATE profiles SET api_keys_encrypted = $1, updated_at = now() WHERE id = $2")
        .bind(blob)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Provider → secret map used when composing workspace env at machine
/// start. Empty when the user has stored nothing.
pub async fn unsealed_api_keys(
    pool: &PgPool,
    user_id: Uuid,
) -> AppResult<BTreeMap<String, String>> {
    let entries = load_entries(pool, user_id).await?;
    Ok(entries
        .into_iter()
        .map(|(provider, entry)| (provider, entry.secret))
        .collect())
}

#[derive(Serialize)]
pub struct ApiKeyView {
    pub provider: String,
    pub connected: bool,
    pub added_at: chrono::DateTime<chrono::Utc>,
}

pub async fn list_api_keys(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<Vec<ApiKeyView>>> {
    let entries = load_entries(&pool, user_id).await?;
    let views = entries
        .into_iter()
        .map(|(provider, entry)| ApiKeyView {
            provider,
            connected: true,
            added_at: entry.added_at,
        })
        .collect();
    Ok(Json(views))
}

#[derive(Deserialize)]
pub struct StoreApiKey {
    pub provider: String,
    pub api_key: String,
}

pub async fn store_api_key(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<StoreApiKey>,
) -> AppResult<StatusCode> {
    if crate::providers::env_var_for(&payload.provider).is_none() {
        return Err(AppError::InvalidInput(format!(
            "unknown provider {:?}",
            payload.provider
        )));
    }
    if payload.api_key.trim().is_empty() {
        return Err(AppError::InvalidInput("api_key must not be empty".into()));
    }
    let mut entries = load_entries(&pool, user_id).await?;
    entries.insert(
        payload.provider,
        ApiKeyEntry {
            secret: payload.api_key,
            added_at: chrono::Utc::now(),
        },
    );
    store_entries(&pool, user_id, &entries).await?;
    Ok(StatusCode::CREATED)
}

pub async fn delete_api_key(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
    Path(provider): Path<String>,
) -> AppResult<StatusCode> {
    let mut entries = load_entries(&pool, user_id).await?;
    if entries.remove(&provider).is_none() {
        return Err(AppError::NotFound);
    }
    store_entries(&pool, user_id, &entries).await?;
    Ok(StatusCode::NO_CONTENT)
}
