use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use super::{respond, TraceId};
use crate::infrastructure::logging::Timer;
use crate::state::AppContext;

pub fn deployments_routes() -> Router<AppContext> {
    Router::new()
        .route("/{id}", get(get_deployment))
        .route("/{id}/rollback", post(rollback))
}

#[derive(Deserialize, Default)]
struct RollbackRequest {
    triggered_by: Option<String>,
}

async fn get_deployment(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(id): Path<i64>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/deployments/{}", id);
    ctx.logger.api_entry(&trace_id, "GET", &path, "");

    let result = ctx.deployment_service.get(id).await;
    respond(&ctx, &trace_id, "GET", &path, &timer, StatusCode::OK, result)
}

/// Queue a redeploy of deployment `id`'s artifact.
async fn rollback(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(id): Path<i64>,
    body: Bytes,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/deployments/{}/rollback", id);
    ctx.logger.api_entry(&trace_id, "POST", &path, "");

    // A missing or unparsable body just means no actor name
    let request: RollbackRequest = serde_json::from_slice(&body).unwrap_or_default();

    let result = ctx
        .deployment_service
        .rollback(&trace_id, id, request.triggered_by)
        .await;
    respond(&ctx, &trace_id, "POST", &path, &timer, StatusCode::ACCEPTED, result)
}
