use axum::http::StatusCode;
use thiserror::Error;

/// Pipeline phase, used to attribute failures and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sync,
    PreBuild,
    Build,
    PostBuild,
    Deploy,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Sync => "sync",
            Phase::PreBuild => "pre-build",
            Phase::Build => "build",
            Phase::PostBuild => "post-build",
            Phase::Deploy => "deploy",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures raised while a build request runs. Caught by the worker and
/// recorded on the Deployment; never propagated out of the worker loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sync failed: {0}")]
    Sync(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("{phase} phase timed out after {seconds}s")]
    Timeout { phase: Phase, seconds: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Errors from git operations on a working copy.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {operation} failed: {message}")]
    Command { operation: String, message: String },

    #[error("git {operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("pull is not a fast-forward: {0}")]
    NonFastForward(String),

    #[error("path escapes repository root: {0}")]
    PathEscapes(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("credential setup failed: {0}")]
    Credentials(String),

    #[error("working copy missing at {0}")]
    MissingWorkingCopy(String),

    #[error("unexpected git output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<GitError> for PipelineError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Timeout { seconds, .. } => PipelineError::Timeout {
                phase: Phase::Sync,
                seconds,
            },
            other => PipelineError::Sync(other.to_string()),
        }
    }
}

/// Provider adapter rejection reasons.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("verification failed: {0}")]
    Verification(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Webhook ingestion outcome errors, each mapped to an HTTP status.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("repository {0} not found")]
    NotFound(i64),

    #[error("repository is configured for {configured}, not {received}")]
    ProviderMismatch { configured: String, received: String },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::NotFound(_) => StatusCode::NOT_FOUND,
            WebhookError::ProviderMismatch { .. } => StatusCode::BAD_REQUEST,
            WebhookError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WebhookError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ProviderError> for WebhookError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Verification(msg) => WebhookError::Unauthorized(msg),
            ProviderError::Malformed(msg) => WebhookError::BadRequest(msg),
        }
    }
}

/// Errors surfaced by the management API.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_error_status_codes() {
        assert_eq!(WebhookError::NotFound(3).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            WebhookError::from(ProviderError::Verification("bad".into())).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            WebhookError::from(ProviderError::Malformed("bad".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_git_timeout_maps_to_sync_phase() {
        let err: PipelineError = GitError::Timeout {
            operation: "clone".into(),
            seconds: 5,
        }
        .into();
        assert!(matches!(
            err,
            PipelineError::Timeout { phase: Phase::Sync, seconds: 5 }
        ));
    }
}
