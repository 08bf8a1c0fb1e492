//! HTTP front end
//!
//! `GET /screenshot` runs a capture, `GET /health` reports the browser
//! session, and `GET /metrics` renders the Prometheus scrape output.

use crate::{
    CaptureCoordinator, CaptureOutcome, ErrorSeverity, HealthChecker, HealthLevel,
    ScreenshotError, ScreenshotQuery, Viewport,
};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub coordinator: Arc<CaptureCoordinator>,
    pub default_viewport: Viewport,
    pub health: HealthChecker,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/screenshot", get(screenshot_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve until `shutdown` flips to `true`.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), ScreenshotError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ScreenshotError::IoError(format!("failed to bind {addr}: {e}")))?;

    info!("Listening on http://{}", addr);

    let mut shutdown = shutdown;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|&v| v).await;
        })
        .await
        .map_err(|e| ScreenshotError::IoError(format!("HTTP server error: {e}")))
}

async fn screenshot_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScreenshotQuery>,
) -> Response {
    let request = match query.into_request(state.default_viewport) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    info!("Screenshot requested for {}", request.url);

    // Run the capture on its own task so a client hanging up cannot cancel it
    // halfway and leave a page or lease behind.
    let coordinator = state.coordinator.clone();
    let outcome = tokio::spawn(async move { coordinator.capture(&request).await })
        .await
        .unwrap_or_else(|e| Err(ScreenshotError::CaptureFailed(format!("capture task failed: {e}"))));

    match outcome {
        Ok(CaptureOutcome::Bytes(bytes)) => {
            ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
        }
        Ok(CaptureOutcome::Artifact { url }) => {
            Json(serde_json::json!({ "url": url })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.health.check(&state.coordinator).await;
    let status = match report.status {
        HealthLevel::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

fn error_response(e: &ScreenshotError) -> Response {
    match e.severity() {
        ErrorSeverity::Low => debug!("Rejected request: {}", e),
        ErrorSeverity::Medium => warn!("Capture failed: {}", e),
        ErrorSeverity::High | ErrorSeverity::Critical => error!("Capture failed: {}", e),
    }

    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.public_message()).into_response()
}
