use std::future::ready;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tracing::warn;

use crate::error::{EnvelopeError, PipelineError};
use crate::event::RawMessage;
use crate::health::HealthRegistry;
use crate::metrics_consts::PUSH_REQUESTS;
use crate::pipeline::{BundleReport, TransformPipeline};
use crate::serve_metrics::track_metrics;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid push envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Envelope(_) => StatusCode::BAD_REQUEST,
            // The pusher redelivers on 503
            ApiError::Pipeline(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: TransformPipeline,
    liveness: HealthRegistry,
}

/// Health, metrics and the push endpoint. `metrics` is `None` when the caller
/// does not own the global recorder, as in tests.
pub fn router(
    pipeline: TransformPipeline,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = AppState { pipeline, liveness };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness_check))
        .route("/pubsub/push", post(push));

    let router = match metrics {
        Some(handle) => router.route("/metrics", get(move || ready(handle.render()))),
        None => router,
    };

    router
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "ingest-transform"
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    state.liveness.get_status()
}

/// Runs one pushed message through the pipeline as a bundle of its own.
async fn push(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BundleReport>, ApiError> {
    let result = handle_push(&state.pipeline, &body).await;

    let status = match &result {
        Ok(_) => "ok",
        Err(ApiError::Envelope(_)) => "bad_request",
        Err(ApiError::Pipeline(e)) if e.is_retryable() => "retry",
        Err(ApiError::Pipeline(_)) => "failed",
    };
    metrics::counter!(PUSH_REQUESTS, "status" => status).increment(1);

    if let Err(e) = &result {
        warn!(status, "push request failed: {}", e);
    }
    result.map(Json)
}

async fn handle_push(pipeline: &TransformPipeline, body: &[u8]) -> Result<BundleReport, ApiError> {
    let message = RawMessage::from_push_envelope(body)?;
    Ok(pipeline.process_bundle([message]).await?)
}
