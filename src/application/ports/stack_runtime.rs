use anyhow::Result;
use async_trait::async_trait;

/// The container runtime that actually runs stacks.
#[async_trait]
pub trait StackRuntime: Send + Sync {
    /// Install `compose` and `env` as the stack's definition and bring it up to date.
    /// Returns the runtime's console output for the deployment log.
    async fn apply(&self, stack_id: &str, compose: &str, env: &str) -> Result<String>;

    /// Whether an image tag is still present locally (checked before rollback).
    async fn image_exists(&self, tag: &str) -> Result<bool>;
}
