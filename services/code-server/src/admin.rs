//! Admin API for pool management
//!
//! Runs on a separate listener and is never exposed alongside the public
//! routes. When a token is configured every route requires
//! `Authorization: Bearer <token>`.
//!
//! Endpoints:
//! - GET    /admin/pool          pool status with per-page assignments
//! - POST   /admin/codes         add codes to the pool
//! - DELETE /admin/codes/{code}  remove a code everywhere
//! - POST   /admin/recycle       run the recycling pass now

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use code_rotation::CodeRotator;
use common::Secret;
use serde::Deserialize;
use tracing::{info, warn};

use crate::routes::json;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    rotator: Arc<CodeRotator>,
    token: Option<Arc<Secret<String>>>,
}

impl AdminState {
    pub fn new(rotator: Arc<CodeRotator>, token: Option<Secret<String>>) -> Self {
        if token.is_none() {
            warn!("admin API has no token configured, relying on listener isolation");
        }
        Self {
            rotator,
            token: token.map(Arc::new),
        }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/codes", post(add_codes))
        .route("/admin/codes/{code}", delete(retire_code))
        .route("/admin/recycle", post(recycle))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

async fn require_token(State(state): State<AdminState>, request: Request, next: Next) -> Response {
    let Some(token) = &state.token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(candidate) if token.matches(candidate.as_bytes()) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "admin request rejected");
            json(
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            )
        }
    }
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> Response {
    match state.rotator.status().await {
        Ok(status) => match serde_json::to_value(&status) {
            Ok(body) => json(StatusCode::OK, body),
            Err(e) => json(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("failed to encode status: {e}") }),
            ),
        },
        Err(e) => store_unavailable(e),
    }
}

#[derive(Deserialize)]
struct AddCodesRequest {
    codes: Vec<String>,
}

/// POST /admin/codes
async fn add_codes(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddCodesRequest>,
) -> Response {
    let requested = body.codes.len();
    match state.rotator.provision(body.codes).await {
        Ok(report) => {
            info!(requested, added = report.added, "codes added via admin API");
            json(
                StatusCode::OK,
                serde_json::json!({ "added": report.added, "skipped": report.skipped }),
            )
        }
        Err(e) => store_unavailable(e),
    }
}

/// DELETE /admin/codes/{code}
async fn retire_code(State(state): State<AdminState>, Path(code): Path<String>) -> Response {
    match state.rotator.retire(&code).await {
        Ok(true) => json(
            StatusCode::OK,
            serde_json::json!({ "code": code, "status": "retired" }),
        ),
        Ok(false) => json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "code not found" }),
        ),
        Err(e) => store_unavailable(e),
    }
}

/// POST /admin/recycle
async fn recycle(State(state): State<AdminState>) -> Response {
    match state.rotator.recycle_expired().await {
        Ok(released) => {
            info!(released, "manual recycle completed");
            json(StatusCode::OK, serde_json::json!({ "released": released }))
        }
        Err(e) => store_unavailable(e),
    }
}

fn store_unavailable(e: code_rotation::Error) -> Response {
    warn!(error = %e, "admin request failed");
    json(
        StatusCode::SERVICE_UNAVAILABLE,
        serde_json::json!({ "error": "code store unavailable" }),
    )
}
