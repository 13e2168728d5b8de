use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),
    #[error("machines api error: {0}")]
    MachinesApi(#[from] reqwest::Error),
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Cancelled
            | AppError::Db(_)
            | AppError::Engine(_)
            | AppError::MachinesApi(_)
            | AppError::Ssh(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_status_codes() {
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::Unauthenticated("no token".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Conflict("duplicate name".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::InvalidInput("bad subdomain".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::BackendUnavailable("machine gone".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::UpstreamFailure("dial refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Timeout("start deadline".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
