use anyhow::Result;
use async_trait::async_trait;

use crate::db::models::*;

/// Repository trait for GitRepository records (one per stack)
#[async_trait]
pub trait GitRepositoryRepository: Send + Sync {
    async fn get_repository(&self, id: i64) -> Result<Option<GitRepository>>;

    async fn get_repository_by_stack(&self, stack_id: &str) -> Result<Option<GitRepository>>;

    /// Insert, or update the row with the same `stack_id`. Sync markers are preserved.
    async fn save_repository(&self, repo: UpsertGitRepository) -> Result<GitRepository>;

    /// Record a successful sync of `commit_sha`.
    async fn mark_repository_synced(&self, id: i64, commit_sha: &str) -> Result<()>;

    /// Delete the repository; cascades to its build config, deployments,
    /// webhook events and build requests.
    async fn delete_repository(&self, id: i64) -> Result<()>;
}

/// Repository trait for BuildConfig records (at most one per stack)
#[async_trait]
pub trait BuildConfigRepository: Send + Sync {
    async fn get_build_config(&self, stack_id: &str) -> Result<Option<BuildConfig>>;

    async fn save_build_config(&self, config: UpsertBuildConfig) -> Result<BuildConfig>;
}

/// Repository trait for the webhook audit trail
#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    async fn create_webhook_event(&self, event: NewWebhookEvent) -> Result<WebhookEvent>;

    async fn get_webhook_event(&self, id: i64) -> Result<Option<WebhookEvent>>;

    async fn find_webhook_event_by_delivery(
        &self,
        repository_id: i64,
        delivery_id: &str,
    ) -> Result<Option<WebhookEvent>>;

    /// Sets processed/processed_at/deployment_id/error. Only the first call
    /// has an effect; later calls leave the row untouched.
    async fn mark_webhook_processed(
        &self,
        id: i64,
        deployment_id: Option<i64>,
        error: Option<&str>,
    ) -> Result<()>;
}

/// Repository trait for Deployment records
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn create_deployment(&self, deployment: NewDeployment) -> Result<Deployment>;

    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>>;

    /// Persist every mutable field except the logs, which are append-only.
    async fn save_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn append_deployment_log(&self, id: i64, stream: LogStream, text: &str) -> Result<()>;

    async fn list_deployments(&self, stack_id: &str, limit: i64) -> Result<Vec<Deployment>>;

    /// Most recent `successful` deployment of the stack, optionally skipping one id.
    async fn latest_successful_deployment(
        &self,
        stack_id: &str,
        excluding: Option<i64>,
    ) -> Result<Option<Deployment>>;

    /// A deployment of `commit_sha` that is still pending, building or deploying.
    async fn find_in_flight_deployment(&self, stack_id: &str, commit_sha: &str) -> Result<Option<Deployment>>;
}

/// Repository trait for the persisted build queue
#[async_trait]
pub trait BuildRequestRepository: Send + Sync {
    async fn create_build_request(&self, request: NewBuildRequest) -> Result<BuildRequest>;

    async fn get_build_request(&self, build_id: &str) -> Result<Option<BuildRequest>>;

    async fn update_build_request_status(&self, build_id: &str, status: BuildRequestStatus) -> Result<()>;

    /// Requests in any of `statuses`, in receipt order.
    async fn list_build_requests(&self, statuses: &[BuildRequestStatus]) -> Result<Vec<BuildRequest>>;
}

/// Every entity store the pipeline needs, behind one bound.
pub trait EntityStore:
    GitRepositoryRepository
    + BuildConfigRepository
    + WebhookEventRepository
    + DeploymentRepository
    + BuildRequestRepository
    + 'static
{
}

impl<T> EntityStore for T where
    T: GitRepositoryRepository
        + BuildConfigRepository
        + WebhookEventRepository
        + DeploymentRepository
        + BuildRequestRepository
        + 'static
{
}
