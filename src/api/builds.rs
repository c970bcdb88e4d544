use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Serialize;

use super::{respond, TraceId};
use crate::build::CancelOutcome;
use crate::infrastructure::logging::Timer;
use crate::state::AppContext;

pub fn builds_routes() -> Router<AppContext> {
    Router::new()
        .route("/{build_id}", get(get_build))
        .route("/{build_id}/cancel", post(cancel_build))
}

#[derive(Serialize)]
struct CancelResponse {
    build_id: String,
    outcome: CancelOutcome,
}

async fn get_build(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(build_id): Path<String>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/builds/{}", build_id);
    ctx.logger.api_entry(&trace_id, "GET", &path, "");

    let result = ctx.deployment_service.build(&build_id).await;
    respond(&ctx, &trace_id, "GET", &path, &timer, StatusCode::OK, result)
}

async fn cancel_build(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(build_id): Path<String>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/builds/{}/cancel", build_id);
    ctx.logger.api_entry(&trace_id, "POST", &path, "");

    let result = ctx
        .deployment_service
        .cancel(&trace_id, &build_id)
        .await
        .map(|outcome| CancelResponse {
            build_id: build_id.clone(),
            outcome,
        });
    respond(&ctx, &trace_id, "POST", &path, &timer, StatusCode::OK, result)
}
