use axum::{
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderValue},
    response::Response,
};
use std::convert::Infallible;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::infrastructure::logging::TraceContext;

/// Trace id of the current request, set by [`TraceIdLayer`].
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for TraceId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<TraceId>()
            .cloned()
            .unwrap_or_else(|| TraceId(TraceContext::extract_or_generate(&parts.headers))))
    }
}

/// Adds a trace id to every request and echoes it in `x-trace-id`
///
/// - an inbound `x-trace-id` header is reused
/// - otherwise a new one is generated
#[derive(Clone)]
pub struct TraceIdLayer;

impl<S> Layer<S> for TraceIdLayer {
    type Service = TraceIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceIdService { inner }
    }
}

#[derive(Clone)]
pub struct TraceIdService<S> {
    inner: S,
}

impl<S> Service<Request> for TraceIdService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let trace_id = TraceContext::extract_or_generate(req.headers());
            req.extensions_mut().insert(TraceId(trace_id.clone()));

            let mut response = inner.call(req).await?;

            if let Ok(header_value) = HeaderValue::from_str(&trace_id) {
                response.headers_mut().insert("x-trace-id", header_value);
            }

            Ok(response)
        })
    }
}
