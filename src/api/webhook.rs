use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};

use super::{error_body, TraceId};
use crate::application::services::WebhookOutcome;
use crate::error::WebhookError;
use crate::infrastructure::logging::Timer;
use crate::state::AppContext;

/// `POST /webhooks/{provider}/{repository_id}`
///
/// The raw body is handed to the service untouched; signature checks need the exact bytes.
pub async fn receive_webhook(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path((provider, repository_id)): Path<(String, i64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timer = Timer::start();
    let path = format!("/webhooks/{}/{}", provider, repository_id);

    ctx.logger
        .api_entry(&trace_id, "POST", &path, &format!("bytes={}", body.len()));

    let result = ctx
        .webhook_service
        .receive(&trace_id, &provider, repository_id, &body, &headers)
        .await;

    let (status, response) = match result {
        Ok(outcome) => {
            match &outcome {
                WebhookOutcome::Queued { build_id, .. } => {
                    info!("[{}] Webhook for repository {} queued build {}", trace_id, repository_id, build_id)
                }
                WebhookOutcome::Ignored { reason, .. } => {
                    info!("[{}] Webhook for repository {} ignored: {}", trace_id, repository_id, reason)
                }
            }
            (StatusCode::OK, Json(outcome).into_response())
        }
        Err(e) => {
            let status = e.status_code();
            let message = match &e {
                WebhookError::Internal(inner) => {
                    warn!("[{}] Webhook processing failed: {:#}", trace_id, inner);
                    "internal error".to_string()
                }
                other => {
                    warn!("[{}] Webhook rejected: {}", trace_id, other);
                    other.to_string()
                }
            };
            (status, (status, error_body(message)).into_response())
        }
    };

    ctx.logger
        .api_exit(&trace_id, "POST", &path, timer.elapsed_ms(), status.as_u16());
    response
}
