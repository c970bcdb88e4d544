use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::application::events::{Event, EventBus};
use crate::application::ports::{Commit, EntityStore, SourceControl};
use crate::build::{BuildQueue, CancelOutcome};
use crate::db::models::{
    BuildRequest, Deployment, DeploymentStatus, DeploymentTrigger, GitRef, NewDeployment,
};
use crate::error::{GitError, ServiceError};
use crate::git::validate_ref_name;
use crate::infrastructure::logging::{BoundaryLogger, Timer};

const MAX_LIST_LIMIT: i64 = 200;

/// Manual or API trigger parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRequest {
    /// Defaults to the tracked branch.
    pub branch: Option<String>,
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedBuild {
    pub build_id: String,
    pub deployment_id: i64,
}

/// DeploymentService - manual triggers, cancellation, rollback and queries
pub struct DeploymentService<S: EntityStore, EB: EventBus> {
    store: Arc<S>,
    event_bus: EB,
    queue: Arc<BuildQueue<S>>,
    source: Arc<dyn SourceControl>,
    logger: Arc<BoundaryLogger>,
}

impl<S: EntityStore, EB: EventBus> DeploymentService<S, EB> {
    pub fn new(
        store: Arc<S>,
        event_bus: EB,
        queue: Arc<BuildQueue<S>>,
        source: Arc<dyn SourceControl>,
        logger: Arc<BoundaryLogger>,
    ) -> Self {
        Self {
            store,
            event_bus,
            queue,
            source,
            logger,
        }
    }

    /// Queue a build of the stack's tracked branch (or `request.branch`).
    pub async fn trigger(
        &self,
        trace_id: &str,
        stack_id: &str,
        request: TriggerRequest,
        trigger_kind: DeploymentTrigger,
    ) -> Result<QueuedBuild, ServiceError> {
        let timer = Timer::start();
        self.logger
            .service_entry(trace_id, "API", "DeploymentService", "trigger", &(stack_id, &request));

        let repo = self
            .store
            .get_repository_by_stack(stack_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("repository for stack {}", stack_id)))?;
        let config = self
            .store
            .get_build_config(stack_id)
            .await?
            .ok_or_else(|| ServiceError::Invalid(format!("stack {} has no build configuration", stack_id)))?;

        let branch = request
            .branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| repo.branch.clone());
        validate_ref_name(&branch).map_err(|e| ServiceError::Invalid(e.to_string()))?;

        let (build, deployment) = self
            .queue
            .submit(
                NewDeployment {
                    stack_id: stack_id.to_string(),
                    repository_id: repo.id,
                    build_config_id: Some(config.id),
                    build_id: uuid::Uuid::new_v4().to_string(),
                    commit_sha: None,
                    commit_message: None,
                    commit_author: None,
                    git_ref: GitRef::Branch(branch),
                    trigger_kind,
                    triggered_by: request.triggered_by,
                },
                None,
                None,
            )
            .await?;

        self.logger.event_emit(trace_id, "DeploymentService", "BuildQueued");
        self.event_bus
            .emit(Event::build_queued(repo.id, &build.build_id, deployment.id))
            .await;

        self.logger
            .service_exit(trace_id, "API", "DeploymentService", "trigger", timer.elapsed_ms());
        Ok(QueuedBuild {
            build_id: build.build_id,
            deployment_id: deployment.id,
        })
    }

    pub async fn cancel(&self, trace_id: &str, build_id: &str) -> Result<CancelOutcome, ServiceError> {
        let timer = Timer::start();
        self.logger
            .service_entry(trace_id, "API", "DeploymentService", "cancel", &build_id);

        let request = self
            .store
            .get_build_request(build_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("build {}", build_id)))?;

        let outcome = self.queue.cancel(build_id).await?;
        match outcome {
            CancelOutcome::Dequeued => {
                let message = "cancelled before start".to_string();
                self.event_bus
                    .emit(Event::deployment_status(
                        request.repository_id,
                        build_id,
                        request.deployment_id,
                        DeploymentStatus::Cancelled,
                    ))
                    .await;
                self.event_bus
                    .emit(Event::build_failed(
                        request.repository_id,
                        build_id,
                        request.deployment_id,
                        DeploymentStatus::Cancelled,
                        message,
                    ))
                    .await;
            }
            CancelOutcome::Signalled => {
                info!("[{}] Build {} will stop at the next phase boundary", trace_id, build_id);
            }
            CancelOutcome::NotFound => {
                return Err(ServiceError::Conflict(format!(
                    "build {} is already {}",
                    build_id,
                    request.status.as_str()
                )));
            }
        }

        self.logger
            .service_exit(trace_id, "API", "DeploymentService", "cancel", timer.elapsed_ms());
        Ok(outcome)
    }

    /// Queue a redeploy of `target_id`'s artifact as a new Deployment.
    pub async fn rollback(
        &self,
        trace_id: &str,
        target_id: i64,
        triggered_by: Option<String>,
    ) -> Result<QueuedBuild, ServiceError> {
        let timer = Timer::start();
        self.logger
            .service_entry(trace_id, "API", "DeploymentService", "rollback", &target_id);

        let target = self.get(target_id).await?;
        if target.status != DeploymentStatus::Successful {
            return Err(ServiceError::Conflict(format!(
                "deployment {} is {}; only successful deployments can be rolled back to",
                target_id, target.status
            )));
        }
        if target.compose_snapshot.is_none() {
            return Err(ServiceError::Conflict(format!(
                "deployment {} has no artifact snapshot",
                target_id
            )));
        }

        let (build, mut deployment) = self
            .queue
            .submit(
                NewDeployment {
                    stack_id: target.stack_id.clone(),
                    repository_id: target.repository_id,
                    build_config_id: target.build_config_id,
                    build_id: uuid::Uuid::new_v4().to_string(),
                    commit_sha: target.commit_sha.clone(),
                    commit_message: target.commit_message.clone(),
                    commit_author: target.commit_author.clone(),
                    git_ref: target.git_ref(),
                    trigger_kind: DeploymentTrigger::Manual,
                    triggered_by,
                },
                None,
                Some(target.id),
            )
            .await?;

        deployment.previous_deployment_id = Some(target.id);
        self.store.save_deployment(&deployment).await?;

        self.event_bus
            .emit(Event::build_queued(target.repository_id, &build.build_id, deployment.id))
            .await;

        self.logger
            .service_exit(trace_id, "API", "DeploymentService", "rollback", timer.elapsed_ms());
        Ok(QueuedBuild {
            build_id: build.build_id,
            deployment_id: deployment.id,
        })
    }

    pub async fn get(&self, id: i64) -> Result<Deployment, ServiceError> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("deployment {}", id)))
    }

    pub async fn list(&self, stack_id: &str, limit: Option<i64>) -> Result<Vec<Deployment>, ServiceError> {
        let limit = limit.unwrap_or(50).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list_deployments(stack_id, limit).await?)
    }

    /// Recent commits of the stack's working copy.
    pub async fn commits(&self, stack_id: &str, limit: Option<usize>) -> Result<Vec<Commit>, ServiceError> {
        let repo = self
            .store
            .get_repository_by_stack(stack_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("repository for stack {}", stack_id)))?;

        let limit = limit.unwrap_or(20).clamp(1, MAX_LIST_LIMIT as usize);
        match self.source.history(&repo, limit).await {
            Ok(commits) => Ok(commits),
            Err(GitError::MissingWorkingCopy(_)) => Err(ServiceError::Conflict(format!(
                "stack {} has not been synced yet",
                stack_id
            ))),
            Err(e) => Err(ServiceError::Internal(e.into())),
        }
    }

    pub async fn build(&self, build_id: &str) -> Result<BuildRequest, ServiceError> {
        self.store
            .get_build_request(build_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("build {}", build_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::BroadcastEventBus;
    use crate::application::ports::*;
    use crate::build::testing::*;
    use crate::infrastructure::database::SqliteStore;
    use crate::db::models::BuildRequestStatus;

    fn service(h: &Harness) -> DeploymentService<SqliteStore, BroadcastEventBus> {
        DeploymentService::new(
            h.store.clone(),
            h.bus.clone(),
            h.queue.clone(),
            h.source.clone(),
            h.logger.clone(),
        )
    }

    #[tokio::test]
    async fn test_manual_trigger_requires_config() {
        let h = Harness::new().await;
        seed_repository(&h.store, "web").await;
        let svc = service(&h);

        let err = svc
            .trigger("t", "web", TriggerRequest::default(), DeploymentTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(_)));

        seed_config(&h.store, "web", |_| {}).await;
        let queued = svc
            .trigger(
                "t",
                "web",
                TriggerRequest {
                    branch: None,
                    triggered_by: Some("ops".into()),
                },
                DeploymentTrigger::Manual,
            )
            .await
            .unwrap();
        h.drain().await;

        let deployment = h.deployment(queued.deployment_id).await;
        assert_eq!(deployment.status, DeploymentStatus::Successful);
        assert_eq!(deployment.triggered_by.as_deref(), Some("ops"));
        assert_eq!(deployment.git_ref, "refs/heads/main");
    }

    #[tokio::test]
    async fn test_invalid_branch_is_rejected() {
        let h = Harness::new().await;
        seed_repository(&h.store, "web").await;
        seed_config(&h.store, "web", |_| {}).await;

        let err = service(&h)
            .trigger(
                "t",
                "web",
                TriggerRequest {
                    branch: Some("--upload-pack=evil".into()),
                    triggered_by: None,
                },
                DeploymentTrigger::Api,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_cancel_queued_build() {
        let h = Harness::new().await;
        seed_repository(&h.store, "web").await;
        seed_config(&h.store, "web", |_| {}).await;
        let svc = service(&h);

        let queued = svc
            .trigger("t", "web", TriggerRequest::default(), DeploymentTrigger::Api)
            .await
            .unwrap();
        assert_eq!(svc.cancel("t", &queued.build_id).await.unwrap(), CancelOutcome::Dequeued);
        assert_eq!(
            svc.build(&queued.build_id).await.unwrap().status,
            BuildRequestStatus::Cancelled
        );
        assert_eq!(
            h.deployment(queued.deployment_id).await.status,
            DeploymentStatus::Cancelled
        );

        // Already cancelled
        assert!(matches!(
            svc.cancel("t", &queued.build_id).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(svc.cancel("t", "nope").await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_manual_rollback_reapplies_snapshot() {
        let h = Harness::new().await;
        seed_repository(&h.store, "web").await;
        seed_config(&h.store, "web", |_| {}).await;
        let svc = service(&h);

        let first = svc
            .trigger("t", "web", TriggerRequest::default(), DeploymentTrigger::Api)
            .await
            .unwrap();
        h.drain().await;

        h.source.set_head("def456", "services:\n  web:\n    image: nginx:1.28\n");
        svc.trigger("t", "web", TriggerRequest::default(), DeploymentTrigger::Api)
            .await
            .unwrap();
        h.drain().await;

        let rollback = svc.rollback("t", first.deployment_id, Some("ops".into())).await.unwrap();
        h.drain().await;

        let done = h.deployment(rollback.deployment_id).await;
        assert_eq!(done.status, DeploymentStatus::Successful);
        assert_eq!(done.previous_deployment_id, Some(first.deployment_id));
        assert_eq!(done.commit_sha.as_deref(), Some("abc123"));

        let applied = h.runtime.applied();
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[2].1, COMPOSE);
    }

    #[tokio::test]
    async fn test_rollback_target_must_be_successful() {
        let h = Harness::new().await;
        let repo = seed_repository(&h.store, "web").await;
        let (_, pending) = h
            .queue
            .submit(new_deployment(&repo, "b-1", None), None, None)
            .await
            .unwrap();

        let err = service(&h).rollback("t", pending.id, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }
}
