use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use once_cell::sync::Lazy;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Authenticated caller, extracted from the JWT on every request.
pub struct AuthUser {
    pub user_id: Uuid,
}

/// Pull the bearer token out of the request. Browsers cannot set arbitrary
/// WS headers, so the multiplexer accepts `Sec-WebSocket-Protocol: bearer,
/// <token>` as an alternative carrier.
pub fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Some(token) = authz.to_str().ok().and_then(|s| s.strip_prefix("Bearer ")) {
            return Some(token.trim().to_string());
        }
    }
    if let Some(proto) = parts.headers.get(axum::http::header::SEC_WEBSOCKET_PROTOCOL) {
        return token_from_subprotocol(proto.to_str().ok()?);
    }
    None
}

pub fn token_from_subprotocol(value: &str) -> Option<String> {
    let mut parts = value.split(',').map(str::trim);
    match (parts.next(), parts.next()) {
        (Some("bearer"), Some(token)) if !token.is_empty() => Some(token.to_string()),
        _ => None,
    }
}

static JWKS_CACHE: Lazy<RwLock<Option<(JwkSet, std::time::Instant)>>> =
    Lazy::new(|| RwLock::new(None));

const JWKS_TTL: std::time::Duration = std::time::Duration::from_secs(600);

async fn fetch_jwks(url: &str) -> Result<JwkSet, AppError> {
    {
        let cached = JWKS_CACHE.read().await;
        if let Some((set, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < JWKS_TTL {
                return Ok(set.clone());
            }
        }
    }
    let set: JwkSet = reqwest::get(url)
        .await
        .map_err(|e| AppError::Unauthenticated(format!("jwks fetch failed: {e}")))?
        .json()
        .await
        .map_err(|e| AppError::Unauthenticated(format!("jwks parse failed: {e}")))?;
    *JWKS_CACHE.write().await = Some((set.clone(), std::time::Instant::now()));
    Ok(set)
}

async fn verify_with_jwks(token: &str, url: &str) -> Result<Claims, AppError> {
    let header = decode_header(token)
        .map_err(|_| AppError::Unauthenticated("malformed token".into()))?;
    let set = fetch_jwks(url).await?;
    let jwk = match header.kid.as_deref() {
        Some(kid) => set.find(kid),
        None => set.keys.first(),
    }
    .ok_or_else(|| AppError::Unauthenticated("no matching jwk".into()))?;

    let key = DecodingKey::from_jwk(jwk)
        .map_err(|_| AppError::Unauthenticated("unusable jwk".into()))?;
    let alg = match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Algorithm::RS256,
        AlgorithmParameters::EllipticCurve(_) => Algorithm::ES256,
        _ => return Err(AppError::Unauthenticated("unsupported jwk type".into())),
    };
    let decoded = decode::<Claims>(token, &key, &Validation::new(alg))
        .map_err(|_| AppError::Unauthenticated("invalid token".into()))?;
    Ok(decoded.claims)
}

fn verify_with_secret(token: &str, secret: &str) -> Result<Claims, AppError> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| AppError::Unauthenticated("invalid token".into()))?;
    Ok(decoded.claims)
}

/// JWKS first, HS256 shared secret second (local/dev deployments).
pub async fn verify_token(token: &str) -> Result<(Uuid, Option<String>), AppError> {
    let claims = match crate::config::JWKS_URL.as_deref() {
        Some(url) => match verify_with_jwks(token, url).await {
            Ok(claims) => claims,
            Err(jwks_err) => match crate::config::JWT_HS_SECRET.as_deref() {
                Some(secret) => verify_with_secret(token, secret)?,
                None => return Err(jwks_err),
            },
        },
        None => {
            let secret = crate::config::JWT_HS_SECRET
                .as_deref()
                .ok_or_else(|| AppError::Unauthenticated("no verifier configured".into()))?;
            verify_with_secret(token, secret)?
        }
    };
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::Unauthenticated("sub is not a valid user id".into()))?;
    Ok((user_id, claims.email))
}

/// First identity assertion creates the profile and its settings row in one
/// transaction; the identity store remains the source of truth for the id.
pub async fn ensure_profile(
    pool: &PgPool,
    user_id: Uuid,
    email: Option<&str>,
) -> Result<(), AppError> {
    let exists = sqlx::query("SELECT 1 AS one FROM profiles WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_some() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO profiles (id, email) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
    )
    .bind(user_id)
    .bind(email.unwrap_or_default())
    .execute(&mut tx)
    .await?;
    sqlx::query(
        "INSERT INTO user_settings (user_id, default_idle_timeout_minutes)
         VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(*crate::config::IDLE_TIMEOUT_MINUTES)
    .execute(&mut tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts)
            .ok_or_else(|| AppError::Unauthenticated("missing token".into()))?;
        let (user_id, email) = verify_token(&token).await?;
        if let Some(pool) = parts.extensions.get::<PgPool>() {
            ensure_profile(pool, user_id, email.as_deref()).await?;
        }
        Ok(AuthUser { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(sub: &str, secret: &str) -> String {
        let claims = serde_json::json!({ "sub": sub, "exp": 9999999999u64 });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn subprotocol_token_parsed() {
        assert_eq!(
            token_from_subprotocol("bearer, abc.def.ghi"),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(token_from_subprotocol("bearer,tok"), Some("tok".to_string()));
        assert_eq!(token_from_subprotocol("graphql-ws"), None);
        assert_eq!(token_from_subprotocol("bearer"), None);
    }

    #[test]
    fn bearer_header_preferred() {
        let request = Request::builder()
            .header("Authorization", "Bearer header-token")
            .header("Sec-WebSocket-Protocol", "bearer, proto-token")
            .body(())
            .unwrap();
        let (parts, ()) = request.into_parts();
        assert_eq!(extract_token(&parts), Some("header-token".to_string()));
    }

    #[test]
    fn hs256_verification_round_trip() {
        let id = Uuid::new_v4();
        let token = make_token(&id.to_string(), "shared");
        let claims = verify_with_secret(&token, "shared").unwrap();
        assert_eq!(claims.sub, id.to_string());
        assert!(verify_with_secret(&token, "other").is_err());
    }

    #[test]
    fn non_uuid_sub_rejected() {
        let token = make_token("not-a-uuid", "shared");
        let claims = verify_with_secret(&token, "shared").unwrap();
        assert!(Uuid::parse_str(&claims.sub).is_err());
    }
}
