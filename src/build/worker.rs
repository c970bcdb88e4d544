use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::executor::DeploymentExecutor;
use super::log::LogSink;
use super::pipeline::{PhaseContext, Pipeline};
use super::queue::BuildQueue;
use crate::application::events::EventBus;
use crate::application::ports::{EntityStore, SourceControl};
use crate::db::models::{
    BuildConfig, BuildRequest, BuildRequestStatus, Deployment, DeploymentStatus, GitRepository,
};
use crate::error::PipelineError;
use crate::events::Event;
use crate::infrastructure::logging::{BoundaryLogger, TraceContext};

/// The single build worker: pulls build ids off the queue and runs them one at a time.
pub struct BuildWorker<S: EntityStore, EB: EventBus> {
    store: Arc<S>,
    event_bus: EB,
    queue: Arc<BuildQueue<S>>,
    pipeline: Pipeline<S, EB>,
    executor: Arc<DeploymentExecutor>,
    source: Arc<dyn SourceControl>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: EntityStore, EB: EventBus> BuildWorker<S, EB> {
    pub fn new(
        store: Arc<S>,
        event_bus: EB,
        queue: Arc<BuildQueue<S>>,
        source: Arc<dyn SourceControl>,
        executor: Arc<DeploymentExecutor>,
        logger: Arc<BoundaryLogger>,
    ) -> Self {
        let pipeline = Pipeline::new(
            store.clone(),
            event_bus.clone(),
            source.clone(),
            executor.clone(),
            logger,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            event_bus,
            queue,
            pipeline,
            executor,
            source,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the worker loop. Calling it twice keeps the first loop.
    pub fn start(self: &Arc<Self>) {
        let mut handle = match self.handle.lock() {
            Ok(handle) => handle,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handle.is_some() {
            return;
        }

        let _ = self.shutdown.send(false);
        let worker = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        *handle = Some(tokio::spawn(async move {
            info!("Build worker started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    (build_id, cancel) = worker.queue.next() => {
                        worker.process(&build_id, &cancel).await;
                        worker.queue.finish(&build_id).await;
                    }
                }
            }
            info!("Build worker stopped");
        }));
    }

    /// Stop taking new builds, cancel the running one and wait for the loop to exit.
    pub async fn stop(&self) {
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };

        if let Some(build_id) = self.queue.cancel_running().await {
            info!("Cancelling build {} for shutdown", build_id);
        }
        let _ = self.shutdown.send(true);
        if let Err(e) = handle.await {
            error!("Build worker task failed: {}", e);
        }
    }

    /// Run one build to a terminal state. Errors never escape: they end up
    /// on the Deployment.
    pub async fn process(&self, build_id: &str, cancel: &AtomicBool) {
        let trace_id = TraceContext::for_build(build_id);
        if let Err(e) = self.run_build(&trace_id, build_id, cancel).await {
            error!("[{}] Build {} could not be processed: {:#}", trace_id, build_id, e);
            if let Err(e) = self
                .store
                .update_build_request_status(build_id, BuildRequestStatus::Failed)
                .await
            {
                error!("[{}] Failed to mark build request failed: {:#}", trace_id, e);
            }
        }
    }

    async fn run_build(&self, trace_id: &str, build_id: &str, cancel: &AtomicBool) -> Result<()> {
        let request = self
            .store
            .get_build_request(build_id)
            .await?
            .with_context(|| format!("build request {} not found", build_id))?;
        if request.status == BuildRequestStatus::Cancelled {
            info!("[{}] Build {} was cancelled before it started", trace_id, build_id);
            return Ok(());
        }

        let mut deployment = self
            .store
            .get_deployment(request.deployment_id)
            .await?
            .with_context(|| format!("deployment {} not found", request.deployment_id))?;
        let repo = self
            .store
            .get_repository(request.repository_id)
            .await?
            .with_context(|| format!("repository {} not found", request.repository_id))?;
        let config = self.store.get_build_config(&repo.stack_id).await?;

        info!(
            "[{}] Starting build {} for stack {} ({})",
            trace_id, build_id, repo.stack_id, deployment.git_ref
        );

        self.store
            .update_build_request_status(build_id, BuildRequestStatus::Running)
            .await?;
        deployment.status = DeploymentStatus::Building;
        deployment.started_at = Some(Utc::now());
        self.store.save_deployment(&deployment).await?;
        self.event_bus
            .emit(Event::build_started(repo.id, build_id, deployment.id))
            .await;
        self.emit_status(&repo, &deployment).await;

        let sink = LogSink::spawn(
            self.store.clone(),
            self.event_bus.clone(),
            repo.id,
            build_id.to_string(),
            deployment.id,
        );

        let result = match request.rollback_target_id {
            Some(target_id) => {
                self.run_rollback(&request, target_id, &mut deployment, config.as_ref(), &sink)
                    .await
            }
            None => match config.as_ref() {
                Some(config) => {
                    let mut ctx = PhaseContext {
                        trace_id: trace_id.to_string(),
                        repo: &repo,
                        config,
                        deployment: &mut deployment,
                        sink: &sink,
                        cancel,
                        workdir: self.source.working_copy(&repo),
                        artifact: None,
                    };
                    self.pipeline.run(&mut ctx).await
                }
                None => Err(PipelineError::Build(format!(
                    "stack {} has no build configuration",
                    repo.stack_id
                ))),
            },
        };

        let request_status = match result {
            Ok(()) => {
                sink.build("Deployment successful");
                deployment.finish(DeploymentStatus::Successful);
                BuildRequestStatus::Completed
            }
            Err(PipelineError::Cancelled) => {
                sink.build("Build cancelled");
                deployment.finish(DeploymentStatus::Cancelled);
                BuildRequestStatus::Cancelled
            }
            Err(e) => {
                warn!("[{}] Build {} failed: {}", trace_id, build_id, e);
                sink.build(format!("ERROR: {}", e));
                deployment.push_error(&e.to_string());

                let status = match config.as_ref() {
                    Some(config) if config.rollback_on_failure && request.rollback_target_id.is_none() => {
                        self.roll_back(trace_id, &mut deployment, config, &sink).await
                    }
                    _ => DeploymentStatus::Failed,
                };
                deployment.finish(status);
                BuildRequestStatus::Failed
            }
        };

        // Logs are owned by the sink; saving the record leaves them untouched
        sink.close().await;
        self.store.save_deployment(&deployment).await?;
        self.store
            .update_build_request_status(build_id, request_status)
            .await?;

        self.emit_status(&repo, &deployment).await;
        match deployment.status {
            DeploymentStatus::Successful => {
                self.event_bus
                    .emit(Event::build_completed(repo.id, build_id, deployment.id))
                    .await
            }
            status => {
                self.event_bus
                    .emit(Event::build_failed(
                        repo.id,
                        build_id,
                        deployment.id,
                        status,
                        deployment.error.clone().unwrap_or_else(|| status.to_string()),
                    ))
                    .await
            }
        }

        info!(
            "[{}] Build {} finished: {}",
            trace_id, build_id, deployment.status
        );
        Ok(())
    }

    /// Redeploy the stack's last successful deployment. Returns `RolledBack`
    /// when that succeeds, otherwise `Failed` with the reason appended.
    async fn roll_back(
        &self,
        trace_id: &str,
        deployment: &mut Deployment,
        config: &BuildConfig,
        sink: &LogSink,
    ) -> DeploymentStatus {
        let target = match self
            .store
            .latest_successful_deployment(&deployment.stack_id, Some(deployment.id))
            .await
        {
            Ok(Some(target)) => target,
            Ok(None) => {
                sink.deploy("No previous successful deployment to roll back to");
                return DeploymentStatus::Failed;
            }
            Err(e) => {
                deployment.push_error(&format!("rollback failed: {:#}", e));
                return DeploymentStatus::Failed;
            }
        };

        info!(
            "[{}] Rolling back stack {} to deployment {}",
            trace_id, deployment.stack_id, target.id
        );
        sink.deploy(format!("Rolling back to deployment {}", target.id));

        match self.executor.redeploy(&target, Some(config), sink).await {
            Ok(()) => {
                deployment.previous_deployment_id = Some(target.id);
                sink.deploy("Rollback successful");
                DeploymentStatus::RolledBack
            }
            Err(e) => {
                warn!("[{}] Rollback of stack {} failed: {}", trace_id, deployment.stack_id, e);
                sink.deploy(format!("Rollback failed: {}", e));
                deployment.push_error(&format!("rollback failed: {}", e));
                DeploymentStatus::Failed
            }
        }
    }

    /// Manual rollback request: re-apply the target's snapshot without building.
    async fn run_rollback(
        &self,
        request: &BuildRequest,
        target_id: i64,
        deployment: &mut Deployment,
        config: Option<&BuildConfig>,
        sink: &LogSink,
    ) -> Result<(), PipelineError> {
        let target = self
            .store
            .get_deployment(target_id)
            .await
            .map_err(|e| PipelineError::Deploy(format!("{:#}", e)))?
            .filter(|t| t.stack_id == request.stack_id && t.status == DeploymentStatus::Successful)
            .ok_or_else(|| {
                PipelineError::Deploy(format!(
                    "deployment {} is not a successful deployment of {}",
                    target_id, request.stack_id
                ))
            })?;

        deployment.status = DeploymentStatus::Deploying;
        deployment.previous_deployment_id = Some(target.id);
        deployment.image_tag = target.image_tag.clone();
        deployment.compose_snapshot = target.compose_snapshot.clone();
        deployment.env_snapshot = target.env_snapshot.clone();
        self.store
            .save_deployment(deployment)
            .await
            .map_err(|e| PipelineError::Deploy(format!("{:#}", e)))?;

        self.executor.redeploy(&target, config, sink).await
    }

    async fn emit_status(&self, repo: &GitRepository, deployment: &Deployment) {
        self.event_bus
            .emit(Event::deployment_status(
                repo.id,
                &deployment.build_id,
                deployment.id,
                deployment.status,
            ))
            .await;
    }
}
