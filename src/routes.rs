use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::{infra, keys, mux, settings, workspaces};

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/projects",
            get(workspaces::list_workspaces).post(workspaces::create_workspace),
        )
        .route(
            "/projects/:id",
            get(workspaces::get_workspace_handler)
                .patch(workspaces::update_workspace)
                .delete(workspaces::delete_workspace),
        )
        .route(
            "/projects/:id/infra",
            get(infra::list_services).post(infra::create_service),
        )
        .route(
            "/projects/:id/infra/:sid",
            get(infra::get_service).delete(infra::delete_service),
        )
        .route(
            "/user/api-keys",
            get(keys::list_api_keys).post(keys::store_api_key),
        )
        .route("/user/api-keys/:provider", delete(keys::delete_api_key))
        .route(
            "/user/settings",
            get(settings::get_settings).put(settings::put_settings),
        )
}

/// Start/Stop and the workspace socket wait on machine state transitions
/// with their own deadlines, so they are mounted outside the blanket
/// request timeout.
pub fn lifecycle_routes() -> Router {
    Router::new()
        .route("/projects/:id/start", post(workspaces::start_workspace))
        .route("/projects/:id/stop", post(workspaces::stop_workspace))
        .route("/projects/:id/workspace", get(mux::workspace_ws))
}

pub async fn health() -> &'static str {
    "ok"
}

pub fn public_routes() -> Router {
    Router::new().route("/health", get(health))
}
