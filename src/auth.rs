//! Bearer-token authentication middleware.
//!
//! Compares `Authorization: Bearer <token>` against the configured secret.
//! `GET /health` is mounted outside this middleware's scope (see
//! `routes.rs`) and is exempt. Grounded in the teacher's `AppError` +
//! axum middleware idiom; auth itself has no teacher precedent.

use crate::config::AppConfig;
use crate::errors::AppError;
use axum::{extract::State, http::Request, middleware::Next, response::Response};
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub async fn require_bearer_token(
    State(config): State<Arc<AppConfig>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    if !config.auth_enabled {
        return Ok(next.run(request).await);
    }

    let expected = config
        .auth_token
        .as_deref()
        .ok_or_else(|| AppError::internal("auth enabled but no token configured"))?;

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;

    let presented = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::unauthorized("expected a bearer token"))?;

    if presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(AppError::unauthorized("invalid bearer token"));
    }

    Ok(next.run(request).await)
}
