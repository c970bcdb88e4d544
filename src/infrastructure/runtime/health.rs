use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_TIMEOUT_SECS: i64 = 60;

/// Post-deploy HTTP health check: polls `GET base_url + path` until a 2xx answer or the deadline.
#[derive(Clone)]
pub struct HealthCheck {
    client: reqwest::Client,
    base_url: String,
    interval: Duration,
}

impl HealthCheck {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Absolute URLs are used as-is; anything else is joined onto the base URL.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// `Err` carries the last observed failure once `timeout_seconds` has elapsed.
    pub async fn wait_healthy(&self, path: &str, timeout_seconds: Option<i64>) -> Result<(), String> {
        let url = self.url_for(path);
        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1) as u64);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_error;

        loop {
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_error = format!("{} returned {}", url, response.status()),
                Err(e) => last_error = format!("{} unreachable: {}", url, e),
            }
            debug!("Health check pending: {}", last_error);

            if tokio::time::Instant::now() + self.interval > deadline {
                return Err(format!(
                    "health check did not pass within {}s ({})",
                    timeout.as_secs(),
                    last_error
                ));
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_url_joining() {
        let health = HealthCheck::new("http://127.0.0.1:8080/");
        assert_eq!(health.url_for("/health"), "http://127.0.0.1:8080/health");
        assert_eq!(health.url_for("ready"), "http://127.0.0.1:8080/ready");
        assert_eq!(health.url_for("https://svc.local/h"), "https://svc.local/h");
    }

    #[tokio::test]
    async fn test_healthy_endpoint_passes() {
        let base = serve(Router::new().route("/health", get(|| async { "ok" }))).await;
        let health = HealthCheck::new(base).with_interval(Duration::from_millis(50));
        assert!(health.wait_healthy("/health", Some(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_endpoint_times_out() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let health = HealthCheck::new(base).with_interval(Duration::from_millis(50));

        let err = health.wait_healthy("/health", Some(1)).await.unwrap_err();
        assert!(err.contains("503"));
    }
}
