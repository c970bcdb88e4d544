pub mod deployment_service;
pub mod repository_service;
pub mod webhook_service;

pub use deployment_service::{DeploymentService, QueuedBuild, TriggerRequest};
pub use repository_service::{BuildConfigInput, RepositoryInput, RepositoryService};
pub use webhook_service::{WebhookOutcome, WebhookService};
