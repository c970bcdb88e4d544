mod builds;
mod deployments;
mod stacks;
mod webhook;
mod ws;
pub mod middleware;

pub use middleware::{TraceId, TraceIdLayer};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::ServiceError;
use crate::infrastructure::logging::Timer;
use crate::state::AppContext;

/// Full HTTP surface: provider webhooks, management API and the notification socket.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/webhooks/{provider}/{repository_id}", post(webhook::receive_webhook))
        .route("/ws", get(ws::ws_handler))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TraceIdLayer)
        .with_state(ctx)
}

pub fn api_routes() -> Router<AppContext> {
    Router::new()
        .nest("/stacks", stacks::stacks_routes())
        .nest("/deployments", deployments::deployments_routes())
        .nest("/builds", builds::builds_routes())
}

pub(crate) fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": message.into() }))
}

/// Turn a service result into a JSON response and log the API exit.
pub(crate) fn respond<T: Serialize>(
    ctx: &AppContext,
    trace_id: &str,
    method: &str,
    path: &str,
    timer: &Timer,
    ok: StatusCode,
    result: Result<T, ServiceError>,
) -> Response {
    let (status, response) = match result {
        Ok(value) => (ok, (ok, Json(value)).into_response()),
        Err(e) => {
            let status = e.status_code();
            let message = match &e {
                ServiceError::Internal(inner) => {
                    warn!("[{}] {} {} failed: {:#}", trace_id, method, path, inner);
                    "internal error".to_string()
                }
                other => other.to_string(),
            };
            (status, (status, error_body(message)).into_response())
        }
    };

    ctx.logger
        .api_exit(trace_id, method, path, timer.elapsed_ms(), status.as_u16());
    response
}
