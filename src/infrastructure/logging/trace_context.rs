use axum::http::HeaderMap;

/// Trace id propagation for inbound requests and worker runs
pub struct TraceContext;

impl TraceContext {
    pub fn new_trace_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// `x-trace-id` from the request, or a fresh UUID.
    pub fn extract_or_generate(headers: &HeaderMap) -> String {
        headers
            .get("x-trace-id")
            .and_then(|h| h.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(Self::new_trace_id)
    }

    /// Trace id for a worker run of one build.
    pub fn for_build(build_id: &str) -> String {
        format!("build-{}", build_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trace_id_is_unique() {
        assert_ne!(TraceContext::new_trace_id(), TraceContext::new_trace_id());
    }

    #[test]
    fn test_extract_existing_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "trace-abc".parse().unwrap());
        assert_eq!(TraceContext::extract_or_generate(&headers), "trace-abc");
    }

    #[test]
    fn test_generates_when_missing() {
        let trace_id = TraceContext::extract_or_generate(&HeaderMap::new());
        assert!(trace_id.contains('-'));
    }
}
