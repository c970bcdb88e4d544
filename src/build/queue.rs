use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::application::ports::EntityStore;
use crate::db::models::{
    BuildRequest, BuildRequestStatus, Deployment, DeploymentStatus, NewBuildRequest, NewDeployment,
};

struct RunningBuild {
    build_id: String,
    cancel: Arc<AtomicBool>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from the queue before it started.
    Dequeued,
    /// Running; the worker stops at the next phase boundary.
    Signalled,
    NotFound,
}

/// BuildQueue - strict FIFO of build ids, backed by `build_requests`
///
/// - `submit` persists the Deployment and BuildRequest, then enqueues
/// - `next` hands the head to the single worker and marks it running
/// - `recover` reloads pending requests after a restart
pub struct BuildQueue<S: EntityStore> {
    store: Arc<S>,
    pending: Mutex<VecDeque<String>>,
    running: Mutex<Option<RunningBuild>>,
    notify: Notify,
}

impl<S: EntityStore> BuildQueue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            pending: Mutex::new(VecDeque::new()),
            running: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Create the Deployment (pending) and its BuildRequest, and enqueue it.
    pub async fn submit(
        &self,
        deployment: NewDeployment,
        webhook_event_id: Option<i64>,
        rollback_target_id: Option<i64>,
    ) -> Result<(BuildRequest, Deployment)> {
        let git_ref = deployment.git_ref.clone();
        let commit_sha = deployment.commit_sha.clone();
        let deployment = self.store.create_deployment(deployment).await?;

        let request = self
            .store
            .create_build_request(NewBuildRequest {
                build_id: deployment.build_id.clone(),
                repository_id: deployment.repository_id,
                stack_id: deployment.stack_id.clone(),
                deployment_id: deployment.id,
                webhook_event_id,
                rollback_target_id,
                git_ref,
                commit_sha,
            })
            .await?;

        self.enqueue(&request.build_id).await?;
        info!(
            "Build {} queued for stack {} (deployment {})",
            request.build_id, request.stack_id, deployment.id
        );

        let request = self
            .store
            .get_build_request(&request.build_id)
            .await?
            .context("build request vanished after enqueue")?;
        Ok((request, deployment))
    }

    async fn enqueue(&self, build_id: &str) -> Result<()> {
        self.store
            .update_build_request_status(build_id, BuildRequestStatus::Queued)
            .await?;
        self.pending.lock().await.push_back(build_id.to_string());
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the head of the queue. The returned flag is set when the
    /// build is cancelled while running.
    pub async fn next(&self) -> (String, Arc<AtomicBool>) {
        loop {
            let notified = self.notify.notified();
            {
                let mut pending = self.pending.lock().await;
                if let Some(build_id) = pending.pop_front() {
                    let cancel = Arc::new(AtomicBool::new(false));
                    *self.running.lock().await = Some(RunningBuild {
                        build_id: build_id.clone(),
                        cancel: cancel.clone(),
                    });
                    return (build_id, cancel);
                }
            }
            notified.await;
        }
    }

    /// Clear the running slot once the worker is done with `build_id`.
    pub async fn finish(&self, build_id: &str) {
        let mut running = self.running.lock().await;
        if running.as_ref().map_or(false, |r| r.build_id == build_id) {
            *running = None;
        }
    }

    pub async fn cancel(&self, build_id: &str) -> Result<CancelOutcome> {
        let mut pending = self.pending.lock().await;
        if let Some(position) = pending.iter().position(|id| id == build_id) {
            pending.remove(position);
            drop(pending);
            self.mark_cancelled(build_id).await?;
            info!("Build {} removed from queue", build_id);
            return Ok(CancelOutcome::Dequeued);
        }

        let running = self.running.lock().await;
        match running.as_ref() {
            Some(r) if r.build_id == build_id => {
                r.cancel.store(true, Ordering::SeqCst);
                info!("Build {} signalled to cancel", build_id);
                Ok(CancelOutcome::Signalled)
            }
            _ => Ok(CancelOutcome::NotFound),
        }
    }

    /// Signal whatever is running to stop. Used at shutdown.
    pub async fn cancel_running(&self) -> Option<String> {
        let running = self.running.lock().await;
        running.as_ref().map(|r| {
            r.cancel.store(true, Ordering::SeqCst);
            r.build_id.clone()
        })
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Reload the queue after a restart: interrupted requests fail, pending
    /// ones are re-enqueued in receipt order. Returns the number re-enqueued.
    pub async fn recover(&self) -> Result<usize> {
        let interrupted = self
            .store
            .list_build_requests(&[BuildRequestStatus::Running])
            .await?;
        for request in interrupted {
            warn!("Build {} was interrupted by restart", request.build_id);
            self.store
                .update_build_request_status(&request.build_id, BuildRequestStatus::Failed)
                .await?;
            if let Some(mut deployment) = self.store.get_deployment(request.deployment_id).await? {
                if !deployment.status.is_terminal() {
                    deployment.push_error("interrupted by restart");
                    deployment.finish(DeploymentStatus::Failed);
                    self.store.save_deployment(&deployment).await?;
                }
            }
        }

        let pending = self
            .store
            .list_build_requests(&[BuildRequestStatus::Requested, BuildRequestStatus::Queued])
            .await?;
        let count = pending.len();
        for request in pending {
            self.enqueue(&request.build_id).await?;
        }

        if count > 0 {
            info!("Recovered {} pending build(s)", count);
        }
        Ok(count)
    }

    async fn mark_cancelled(&self, build_id: &str) -> Result<()> {
        self.store
            .update_build_request_status(build_id, BuildRequestStatus::Cancelled)
            .await?;
        if let Some(request) = self.store.get_build_request(build_id).await? {
            if let Some(mut deployment) = self.store.get_deployment(request.deployment_id).await? {
                deployment.finish(DeploymentStatus::Cancelled);
                self.store.save_deployment(&deployment).await?;
            }
        }
        Ok(())
    }
}
