use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use super::{error_body, respond, TraceId};
use crate::application::services::{BuildConfigInput, RepositoryInput, TriggerRequest};
use crate::db::models::DeploymentTrigger;
use crate::infrastructure::logging::Timer;
use crate::state::AppContext;

pub fn stacks_routes() -> Router<AppContext> {
    Router::new()
        .route(
            "/{stack_id}/repository",
            put(put_repository).get(get_repository).delete(delete_repository),
        )
        .route("/{stack_id}/build-config", put(put_build_config).get(get_build_config))
        .route("/{stack_id}/deploy", post(deploy))
        .route("/{stack_id}/deployments", get(list_deployments))
        .route("/{stack_id}/commits", get(list_commits))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn put_repository(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
    Json(input): Json<RepositoryInput>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/repository", stack_id);
    ctx.logger.api_entry(&trace_id, "PUT", &path, &input.remote_url);

    let result = ctx.repository_service.put_repository(&trace_id, &stack_id, input).await;
    respond(&ctx, &trace_id, "PUT", &path, &timer, StatusCode::OK, result)
}

async fn get_repository(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/repository", stack_id);
    ctx.logger.api_entry(&trace_id, "GET", &path, "");

    let result = ctx.repository_service.get_repository(&stack_id).await;
    respond(&ctx, &trace_id, "GET", &path, &timer, StatusCode::OK, result)
}

async fn delete_repository(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/repository", stack_id);
    ctx.logger.api_entry(&trace_id, "DELETE", &path, "");

    match ctx.repository_service.delete_repository(&trace_id, &stack_id).await {
        Ok(()) => {
            ctx.logger
                .api_exit(&trace_id, "DELETE", &path, timer.elapsed_ms(), StatusCode::NO_CONTENT.as_u16());
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => respond::<()>(&ctx, &trace_id, "DELETE", &path, &timer, StatusCode::NO_CONTENT, Err(e)),
    }
}

async fn put_build_config(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
    Json(input): Json<BuildConfigInput>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/build-config", stack_id);
    ctx.logger
        .api_entry(&trace_id, "PUT", &path, &format!("strategy={:?}", input.strategy));

    let result = ctx.repository_service.put_build_config(&trace_id, &stack_id, input).await;
    respond(&ctx, &trace_id, "PUT", &path, &timer, StatusCode::OK, result)
}

async fn get_build_config(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/build-config", stack_id);
    ctx.logger.api_entry(&trace_id, "GET", &path, "");

    let result = ctx.repository_service.get_build_config(&stack_id).await;
    respond(&ctx, &trace_id, "GET", &path, &timer, StatusCode::OK, result)
}

/// Manual/API trigger. The body is optional.
async fn deploy(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
    body: Bytes,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/deploy", stack_id);
    ctx.logger.api_entry(&trace_id, "POST", &path, "");

    let request: TriggerRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                ctx.logger
                    .api_exit(&trace_id, "POST", &path, timer.elapsed_ms(), StatusCode::BAD_REQUEST.as_u16());
                return (StatusCode::BAD_REQUEST, error_body(format!("invalid body: {}", e))).into_response();
            }
        }
    };

    let result = ctx
        .deployment_service
        .trigger(&trace_id, &stack_id, request, DeploymentTrigger::Api)
        .await;
    respond(&ctx, &trace_id, "POST", &path, &timer, StatusCode::ACCEPTED, result)
}

async fn list_deployments(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/deployments", stack_id);
    ctx.logger
        .api_entry(&trace_id, "GET", &path, &format!("limit={:?}", query.limit));

    let result = ctx.deployment_service.list(&stack_id, query.limit).await;
    respond(&ctx, &trace_id, "GET", &path, &timer, StatusCode::OK, result)
}

async fn list_commits(
    State(ctx): State<AppContext>,
    TraceId(trace_id): TraceId,
    Path(stack_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let timer = Timer::start();
    let path = format!("/api/stacks/{}/commits", stack_id);
    ctx.logger
        .api_entry(&trace_id, "GET", &path, &format!("limit={:?}", query.limit));

    let limit = query.limit.map(|l| l.max(1) as usize);
    let result = ctx.deployment_service.commits(&stack_id, limit).await;
    respond(&ctx, &trace_id, "GET", &path, &timer, StatusCode::OK, result)
}
