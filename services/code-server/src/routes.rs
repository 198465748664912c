//! Public HTTP routes
//!
//! - GET  /active-code/{page} : the page's current code, rotating if stale
//! - POST /verify/{page}      : check a code against the page's active code
//! - GET  /health             : service and pool status
//! - GET  /metrics            : Prometheus exposition

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use code_rotation::{CodeRotator, Error as RotationError};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{Instrument, debug, info_span, warn};

use crate::service::ServiceMetrics;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub rotator: Arc<CodeRotator>,
    pub metrics: ServiceMetrics,
    pub prometheus: PrometheusHandle,
}

/// Build the public router.
///
/// A concurrency limit layer caps simultaneous requests at `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/active-code/{page}", get(active_code_handler))
        .route("/verify/{page}", post(verify_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

pub(crate) fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Page segments that are not numbers are unknown pages, not routing errors.
fn parse_page(rotator: &CodeRotator, raw: &str) -> Result<code_store::PageId, RotationError> {
    // Pages are 1-based, so a non-numeric segment maps to the invalid page 0
    rotator.page(raw.parse().unwrap_or(0))
}

/// Close out a request: Prometheus, the health counters and a debug line.
fn finish(state: &AppState, route: &'static str, outcome: &'static str, started: Instant) {
    let elapsed = started.elapsed();
    crate::metrics::record_request(route, outcome, elapsed.as_secs_f64());
    if outcome == "store_unavailable" {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    debug!(
        route,
        outcome,
        duration_ms = elapsed.as_millis() as u64,
        "request completed"
    );
}

/// GET /active-code/{page}
async fn active_code_handler(
    State(state): State<AppState>,
    Path(page): Path<String>,
) -> Response {
    let request_id = new_request_id();
    let span = info_span!("active_code", request_id = %request_id, page = %page);
    async move {
        let _in_flight = state.metrics.begin();
        let started = Instant::now();

        let result = match parse_page(&state.rotator, &page) {
            Ok(page) => state.rotator.active_code(page).await,
            Err(e) => Err(e),
        };

        let (outcome, response) = match result {
            Ok(served) => (
                if served.rotated { "rotated" } else { "served" },
                json(StatusCode::OK, serde_json::json!({ "code": served.code })),
            ),
            Err(RotationError::PoolExhausted(_)) => (
                "exhausted",
                json(
                    StatusCode::NOT_FOUND,
                    serde_json::json!({ "error": "no codes available" }),
                ),
            ),
            Err(RotationError::UnknownPage(_)) => (
                "unknown_page",
                json(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "error": "unknown page" }),
                ),
            ),
            Err(e @ RotationError::StoreUnavailable(_)) => {
                warn!(error = %e, "active code lookup failed");
                (
                    "store_unavailable",
                    json(
                        StatusCode::SERVICE_UNAVAILABLE,
                        serde_json::json!({ "error": "code store unavailable" }),
                    ),
                )
            }
        };

        finish(&state, "active_code", outcome, started);
        response
    }
    .instrument(span)
    .await
}

#[derive(Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    code: Option<String>,
}

/// POST /verify/{page}
///
/// The body is parsed by hand so that a missing or malformed body reads as
/// "code not provided" rather than an extractor rejection.
async fn verify_handler(
    State(state): State<AppState>,
    Path(page): Path<String>,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let span = info_span!("verify", request_id = %request_id, page = %page);
    async move {
        let _in_flight = state.metrics.begin();
        let started = Instant::now();

        let page = match parse_page(&state.rotator, &page) {
            Ok(page) => page,
            Err(_) => {
                finish(&state, "verify", "unknown_page", started);
                return json(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "valid": false, "message": "unknown page" }),
                );
            }
        };

        let code = serde_json::from_slice::<VerifyRequest>(&body)
            .ok()
            .and_then(|r| r.code)
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty());
        let Some(code) = code else {
            finish(&state, "verify", "missing_code", started);
            return json(
                StatusCode::OK,
                serde_json::json!({ "valid": false, "message": "code not provided" }),
            );
        };

        let (outcome, response) = match state.rotator.is_code_valid(&code, page).await {
            Ok(true) => (
                "valid",
                json(
                    StatusCode::OK,
                    serde_json::json!({ "valid": true, "message": "valid code" }),
                ),
            ),
            Ok(false) => (
                "invalid",
                json(
                    StatusCode::OK,
                    serde_json::json!({ "valid": false, "message": "invalid code" }),
                ),
            ),
            Err(RotationError::UnknownPage(_)) => (
                "unknown_page",
                json(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "valid": false, "message": "unknown page" }),
                ),
            ),
            Err(e) => {
                warn!(error = %e, "code verification failed");
                (
                    "store_unavailable",
                    json(
                        StatusCode::SERVICE_UNAVAILABLE,
                        serde_json::json!({ "valid": false, "message": "code store unavailable" }),
                    ),
                )
            }
        };

        finish(&state, "verify", outcome, started);
        response
    }
    .instrument(span)
    .await
}

/// Health endpoint: 200 with pool counts, 503 when the store cannot be read.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    match state.rotator.status().await {
        Ok(pool) => json(
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "store": state.rotator.store_id(),
                "uptime_seconds": uptime,
                "requests_served": requests,
                "errors_total": errors,
                "pool": {
                    "status": pool.status,
                    "available": pool.available,
                    "cooling_down": pool.cooling_down,
                    "pages_assigned": pool.pages_assigned,
                    "codes_total": pool.codes_total,
                },
            }),
        ),
        Err(e) => {
            warn!(error = %e, "health check could not read code store");
            json(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unavailable",
                    "store": state.rotator.store_id(),
                    "error": "code store unavailable",
                    "uptime_seconds": uptime,
                    "requests_served": requests,
                    "errors_total": errors,
                }),
            )
        }
    }
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
