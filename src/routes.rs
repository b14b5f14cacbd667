//! Route table: mounts `/health` (no auth) and the `/files` resource
//! under `/{api_base}/{api_version}` (auth-gated), generalizing the
//! teacher's bucket/object `routes.rs` to this crate's flat resource.

use crate::auth::require_bearer_token;
use crate::config::AppConfig;
use crate::engine::StorageEngine;
use crate::handlers::{files, health};
use axum::{
    Router,
    extract::FromRef,
    middleware,
    routing::{get, post},
};
use std::sync::Arc;

/// Combined router state: every handler extracts just the piece it needs
/// via `FromRef`, so `files`/`health` handlers stay `State<Arc<StorageEngine>>`
/// and the auth middleware stays `State<Arc<AppConfig>>`.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StorageEngine>,
    pub config: Arc<AppConfig>,
}

impl FromRef<AppState> for Arc<StorageEngine> {
    fn from_ref(state: &AppState) -> Self {
        state.engine.clone()
    }
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

pub fn routes(state: AppState) -> Router {
    let prefix = state.config.api_prefix();

    let files_routes = Router::new()
        .route("/files", post(files::upload).get(files::list))
        .route("/files/stats", get(files::stats))
        .route("/files/{id}", get(files::info).delete(files::delete))
        .route("/files/{id}/download", get(files::download))
        .route("/files/{id}/exists", get(files::exists))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token));

    Router::new()
        .route("/health", get(health::health))
        .nest(&prefix, files_routes)
        .with_state(state)
}
