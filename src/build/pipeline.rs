use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use super::executor::{phase_failure, Artifact, DeploymentExecutor};
use super::log::LogSink;
use crate::application::events::EventBus;
use crate::application::ports::{EntityStore, SourceControl};
use crate::db::models::{BuildConfig, Deployment, DeploymentStatus, GitRepository};
use crate::error::{Phase, PipelineError};
use crate::events::Event;
use crate::infrastructure::logging::{BoundaryLogger, Timer};

/// Phases in execution order.
pub const PHASES: [Phase; 5] = [
    Phase::Sync,
    Phase::PreBuild,
    Phase::Build,
    Phase::PostBuild,
    Phase::Deploy,
];

/// State shared by the phases of one run.
pub struct PhaseContext<'a> {
    pub trace_id: String,
    pub repo: &'a GitRepository,
    pub config: &'a BuildConfig,
    pub deployment: &'a mut Deployment,
    pub sink: &'a LogSink,
    pub cancel: &'a AtomicBool,
    pub workdir: PathBuf,
    pub artifact: Option<Artifact>,
}

impl PhaseContext<'_> {
    /// Variables handed to pre/post-build commands.
    fn command_env(&self, opened: Vec<(String, String)>) -> Vec<(String, String)> {
        let mut envs = opened;
        envs.push(("STACKHOOK_STACK".into(), self.repo.stack_id.clone()));
        envs.push(("STACKHOOK_REF".into(), self.deployment.git_ref.clone()));
        envs.push(("STACKHOOK_BUILD_ID".into(), self.deployment.build_id.clone()));
        if let Some(sha) = &self.deployment.commit_sha {
            envs.push(("STACKHOOK_COMMIT".into(), sha.clone()));
        }
        if let Some(tag) = self.artifact.as_ref().and_then(|a| a.image_tag.as_ref()) {
            envs.push((super::env_file::IMAGE_VAR.into(), tag.clone()));
        }
        envs
    }
}

/// Sync → pre-build → build → post-build → deploy, stopping at the first error.
pub struct Pipeline<S: EntityStore, EB: EventBus> {
    store: Arc<S>,
    event_bus: EB,
    source: Arc<dyn SourceControl>,
    executor: Arc<DeploymentExecutor>,
    logger: Arc<BoundaryLogger>,
}

impl<S: EntityStore, EB: EventBus> Pipeline<S, EB> {
    pub fn new(
        store: Arc<S>,
        event_bus: EB,
        source: Arc<dyn SourceControl>,
        executor: Arc<DeploymentExecutor>,
        logger: Arc<BoundaryLogger>,
    ) -> Self {
        Self {
            store,
            event_bus,
            source,
            executor,
            logger,
        }
    }

    pub async fn run(&self, ctx: &mut PhaseContext<'_>) -> Result<(), PipelineError> {
        for phase in PHASES {
            // Cooperative cancellation: checked between phases only
            if ctx.cancel.load(Ordering::SeqCst) {
                return Err(PipelineError::Cancelled);
            }

            let timer = Timer::start();
            self.logger.phase_entry(&ctx.trace_id, phase.as_str(), ctx.deployment.id);
            ctx.sink.build(format!("==> {}", phase));

            match self.run_phase(phase, ctx).await {
                Ok(()) => self.logger.phase_done(&ctx.trace_id, phase.as_str(), timer.elapsed_ms()),
                Err(e) => {
                    self.logger.phase_error(&ctx.trace_id, phase.as_str(), &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_phase(&self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<(), PipelineError> {
        match phase {
            Phase::Sync => self.sync(ctx).await,
            Phase::PreBuild => {
                let commands = ctx.config.pre_build_commands.clone();
                self.commands(Phase::PreBuild, &commands, ctx).await
            }
            Phase::Build => self.build(ctx).await,
            Phase::PostBuild => {
                let commands = ctx.config.post_build_commands.clone();
                self.commands(Phase::PostBuild, &commands, ctx).await
            }
            Phase::Deploy => self.deploy(ctx).await,
        }
    }

    async fn sync(&self, ctx: &mut PhaseContext<'_>) -> Result<(), PipelineError> {
        let git_ref = ctx.deployment.git_ref();
        ctx.sink.build(format!("Syncing {} ({})", ctx.repo.remote_url, git_ref));

        self.logger.external_call(&ctx.trace_id, "Pipeline", "git", "sync");
        let timer = Timer::start();
        let head = match self.source.sync(ctx.repo, &git_ref).await {
            Ok(head) => head,
            Err(e) => {
                self.logger.external_error(&ctx.trace_id, "Pipeline", "git", "sync", &e);
                return Err(e.into());
            }
        };
        self.logger
            .external_done(&ctx.trace_id, "Pipeline", "git", "sync", timer.elapsed_ms());

        ctx.sink.build(format!(
            "HEAD is {} {}",
            head.sha,
            head.message.lines().next().unwrap_or_default()
        ));

        self.store
            .mark_repository_synced(ctx.repo.id, &head.sha)
            .await
            .map_err(|e| PipelineError::Sync(format!("{:#}", e)))?;

        ctx.deployment.commit_sha = Some(head.sha);
        ctx.deployment.commit_message = Some(head.message);
        ctx.deployment.commit_author = Some(head.author);
        self.save(Phase::Sync, ctx.deployment).await?;

        ctx.workdir = self.source.working_copy(ctx.repo);
        Ok(())
    }

    async fn commands(&self, phase: Phase, commands: &[String], ctx: &mut PhaseContext<'_>) -> Result<(), PipelineError> {
        if commands.is_empty() {
            return Ok(());
        }
        let envs = ctx.command_env(self.executor.open_env(ctx.config)?);
        self.executor
            .run_commands(
                phase,
                commands,
                &ctx.workdir,
                &envs,
                ctx.config.timeout(),
                ctx.sink,
                ctx.cancel,
            )
            .await
    }

    async fn build(&self, ctx: &mut PhaseContext<'_>) -> Result<(), PipelineError> {
        let artifact = self
            .executor
            .build(
                self.source.as_ref(),
                ctx.repo,
                ctx.config,
                &ctx.workdir,
                ctx.deployment.commit_sha.as_deref(),
                &ctx.deployment.build_id,
                ctx.sink,
            )
            .await?;
        ctx.artifact = Some(artifact);
        Ok(())
    }

    async fn deploy(&self, ctx: &mut PhaseContext<'_>) -> Result<(), PipelineError> {
        let artifact = ctx
            .artifact
            .clone()
            .ok_or_else(|| PipelineError::Deploy("no build artifact".into()))?;

        ctx.deployment.status = DeploymentStatus::Deploying;
        self.executor.snapshot(ctx.deployment, &artifact)?;
        self.save(Phase::Deploy, ctx.deployment).await?;
        self.event_bus
            .emit(Event::deployment_status(
                ctx.repo.id,
                &ctx.deployment.build_id,
                ctx.deployment.id,
                DeploymentStatus::Deploying,
            ))
            .await;

        info!("[{}] Deploying stack {}", ctx.trace_id, ctx.repo.stack_id);
        self.logger
            .external_call(&ctx.trace_id, "Pipeline", "StackRuntime", "apply");
        let timer = Timer::start();
        match self
            .executor
            .deploy(&ctx.repo.stack_id, &artifact, Some(ctx.config), ctx.sink)
            .await
        {
            Ok(()) => {
                self.logger.external_done(
                    &ctx.trace_id,
                    "Pipeline",
                    "StackRuntime",
                    "apply",
                    timer.elapsed_ms(),
                );
                Ok(())
            }
            Err(e) => {
                self.logger
                    .external_error(&ctx.trace_id, "Pipeline", "StackRuntime", "apply", &e);
                Err(e)
            }
        }
    }

    async fn save(&self, phase: Phase, deployment: &Deployment) -> Result<(), PipelineError> {
        self.store
            .save_deployment(deployment)
            .await
            .map_err(|e| phase_failure(phase, format!("failed to persist deployment: {:#}", e)))
    }
}
