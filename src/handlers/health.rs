//! Health handler (spec §6.2: `GET /health`, exempt from auth).

use crate::engine::StorageEngine;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(rename = "backendHealthy")]
    backend_healthy: bool,
    #[serde(rename = "metadataHealthy")]
    metadata_healthy: bool,
}

/// `GET /health` — cheap liveness probe delegating to the engine's own
/// backend/metadata health checks. Unlike the teacher's `/readyz`, this
/// never performs a throwaway disk write: spec §4.1/§4.2's `Healthy()`
/// capability is defined as a cheap probe on each backend already.
pub async fn health(State(engine): State<Arc<StorageEngine>>) -> impl IntoResponse {
    let health = engine.get_health().await;
    let status = if health.healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(HealthResponse {
            status: if health.healthy() { "ok" } else { "degraded" },
            backend_healthy: health.backend_healthy,
            metadata_healthy: health.metadata_healthy,
        }),
    )
}
