//! # HTTP Request Handlers
//!
//! Built-in handlers mounted by the default router: the health and
//! readiness probes (raw, unauthenticated) and a small echo handler that
//! demonstrates the full pipeline. Anything the pipeline admits reaches a
//! handler with its body already decrypted and a [`RequestContext`]
//! available as an extension, so handlers read plain JSON and never touch
//! envelopes or tokens themselves.

use crate::context::RequestContext;
use crate::error::GatekeeperError;
use crate::health::HealthChecker;
use crate::pipeline::Pipeline;
use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Echo response body, proving which principal the pipeline resolved and
/// that the payload survived the decrypt/encrypt round trip.
#[derive(Debug, Serialize)]
pub struct EchoResponse {
    pub subject: String,
    pub sealed: bool,
    pub echo: serde_json::Value,
}

/// POST /api/echo
///
/// Returns the (already decrypted) request body together with the caller's
/// subject. The pipeline seals the response again on the way out.
pub async fn echo(
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Json<EchoResponse>, GatekeeperError> {
    let echo: serde_json::Value = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| GatekeeperError::HandlerFailure {
            status: 422,
            message: format!("body is not valid JSON: {}", e),
        })?
    };

    Ok(Json(EchoResponse {
        subject: ctx.subject_id(),
        sealed: ctx.sealed,
        echo,
    }))
}

/// GET /health (liveness probe)
pub async fn health_check(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    let checker = HealthChecker::new(
        Arc::clone(&pipeline.limiter),
        Arc::clone(&pipeline.metrics),
    );
    Json(checker.check().await)
}

/// GET /ready (readiness probe, fails while the admission backend is down)
pub async fn readiness_check(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    if pipeline.limiter.healthy().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "admission backend unavailable")
    }
}

/// Body for the admin bucket-reset endpoint.
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    /// The bucket key to forget, e.g. "GET /api/echo" or "sub:user-42"
    pub resource: String,
}

/// GET /admin/limits
///
/// Admin view of the limiter backend. Authenticated like any other route,
/// but exempt from envelope handling.
pub async fn limiter_stats(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    Json(pipeline.limiter.stats())
}

/// POST /admin/limits/reset
///
/// Forgets the named bucket so the caller starts from a full one. Meant
/// for manual intervention and support tooling.
pub async fn reset_limit(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<ResetRequest>,
) -> Result<StatusCode, GatekeeperError> {
    if request.resource.trim().is_empty() {
        return Err(GatekeeperError::HandlerFailure {
            status: 422,
            message: "resource must not be empty".to_string(),
        });
    }
    pipeline.limiter.reset(&request.resource).await?;
    tracing::info!(resource = %request.resource, "rate bucket reset");
    Ok(StatusCode::NO_CONTENT)
}
