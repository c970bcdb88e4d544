use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::env_file::{self, IMAGE_VAR};
use super::log::LogSink;
use crate::application::ports::{open_string, seal_string, SecretVault, SourceControl, StackRuntime};
use crate::db::models::{BuildConfig, BuildStrategy, Deployment, GitRepository};
use crate::error::{GitError, Phase, PipelineError};
use crate::git::confine;
use crate::infrastructure::process::{CommandSpec, ProcessError, ProcessRunner};
use crate::infrastructure::runtime::HealthCheck;

const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(600);

/// What the build phase hands to the deploy phase, and what a Deployment
/// snapshots for later rollback.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub image_tag: Option<String>,
    pub compose: String,
    pub env: String,
}

/// Deployment Executor: runs build strategies against a working copy and
/// applies artifacts to the stack runtime.
pub struct DeploymentExecutor {
    runtime: Arc<dyn StackRuntime>,
    vault: Arc<dyn SecretVault>,
    health: HealthCheck,
    runner: ProcessRunner,
    compose_bin: String,
}

impl DeploymentExecutor {
    pub fn new(
        runtime: Arc<dyn StackRuntime>,
        vault: Arc<dyn SecretVault>,
        health: HealthCheck,
        compose_bin: String,
    ) -> Self {
        Self {
            runtime,
            vault,
            health,
            runner: ProcessRunner::new(),
            compose_bin,
        }
    }

    /// `stackhook/<stack>:<first 12 chars of the commit>`, or of the build id
    /// when the commit is unknown.
    pub fn image_tag(stack_id: &str, commit_sha: Option<&str>, build_id: &str) -> String {
        let version: String = commit_sha
            .filter(|sha| !sha.is_empty())
            .unwrap_or(build_id)
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect();
        format!("stackhook/{}:{}", stack_id, version.to_lowercase())
    }

    /// Run `commands` in `workdir` in order. A non-zero exit aborts the phase;
    /// the cancel flag is checked before each command.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_commands(
        &self,
        phase: Phase,
        commands: &[String],
        workdir: &Path,
        envs: &[(String, String)],
        timeout: Duration,
        sink: &LogSink,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        for command in commands {
            if cancel.load(Ordering::SeqCst) {
                return Err(PipelineError::Cancelled);
            }

            sink.build(format!("$ {}", command));
            let mut spec = CommandSpec::shell(command, timeout).cwd(workdir);
            for (key, value) in envs {
                spec = spec.env(key.clone(), value.clone());
            }

            let output = self
                .runner
                .run_streaming(&spec, &|line| sink.build(line))
                .await
                .map_err(|e| process_error(phase, e))?;

            if !output.success() {
                return Err(phase_failure(
                    phase,
                    format!("command `{}` exited with {:?}", command, output.exit_code),
                ));
            }
        }
        Ok(())
    }

    /// Build phase: strategy-specific work, then resolve the compose text and
    /// env text that the deploy phase applies.
    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        &self,
        source: &dyn SourceControl,
        repo: &GitRepository,
        config: &BuildConfig,
        workdir: &Path,
        commit_sha: Option<&str>,
        build_id: &str,
        sink: &LogSink,
    ) -> Result<Artifact, PipelineError> {
        let image_tag = match config.strategy {
            BuildStrategy::DockerBuild => {
                let tag = Self::image_tag(&repo.stack_id, commit_sha, build_id);
                self.docker_build(config, workdir, &tag, sink).await?;
                Some(tag)
            }
            BuildStrategy::ComposeOnly => {
                sink.build("compose_only: using compose definition as-is");
                None
            }
            BuildStrategy::Script => {
                sink.build("script: build commands ran in pre/post-build");
                None
            }
        };

        let compose = self.read_compose(source, repo, &config.compose_path).await?;
        let env = self
            .resolve_env(source, repo, config, image_tag.as_deref())
            .await?;

        Ok(Artifact {
            image_tag,
            compose,
            env,
        })
    }

    async fn docker_build(
        &self,
        config: &BuildConfig,
        workdir: &Path,
        tag: &str,
        sink: &LogSink,
    ) -> Result<(), PipelineError> {
        let dockerfile = confine(workdir, &config.dockerfile_path).map_err(build_path_error)?;
        if !dockerfile.is_file() {
            return Err(PipelineError::Build(format!(
                "Dockerfile not found at {}",
                config.dockerfile_path
            )));
        }

        let mut spec = CommandSpec::new(&self.compose_bin, config.timeout())
            .args(["build", "-t", tag, "-f"])
            .arg(dockerfile.to_string_lossy())
            .cwd(workdir);
        for (name, value) in &config.build_args {
            spec = spec.arg("--build-arg").arg(format!("{}={}", name, value));
        }
        spec = spec.arg(workdir.to_string_lossy());

        info!("Building image {}", tag);
        sink.build(format!("Building image {}", tag));

        let output = self
            .runner
            .run_streaming(&spec, &|line| sink.build(line))
            .await
            .map_err(|e| process_error(Phase::Build, e))?;

        if !output.success() {
            return Err(PipelineError::Build(format!(
                "image build exited with {:?}",
                output.exit_code
            )));
        }
        Ok(())
    }

    async fn read_compose(
        &self,
        source: &dyn SourceControl,
        repo: &GitRepository,
        compose_path: &str,
    ) -> Result<String, PipelineError> {
        let bytes = source
            .read_file(repo, compose_path)
            .await
            .map_err(build_path_error)?;
        let text = String::from_utf8(bytes)
            .map_err(|_| PipelineError::Build(format!("{} is not valid UTF-8", compose_path)))?;

        match serde_yaml::from_str::<serde_yaml::Value>(&text) {
            Ok(serde_yaml::Value::Mapping(_)) => Ok(text),
            Ok(_) => Err(PipelineError::Build(format!(
                "{} is not a compose mapping",
                compose_path
            ))),
            Err(e) => Err(PipelineError::Build(format!(
                "{} is not valid YAML: {}",
                compose_path, e
            ))),
        }
    }

    /// `.env` next to the compose file, overlaid with the configured variables.
    async fn resolve_env(
        &self,
        source: &dyn SourceControl,
        repo: &GitRepository,
        config: &BuildConfig,
        image_tag: Option<&str>,
    ) -> Result<String, PipelineError> {
        let env_path = match Path::new(&config.compose_path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => format!("{}/.env", dir.display()),
            _ => ".env".to_string(),
        };

        let base = match source.read_file(repo, &env_path).await {
            Ok(bytes) => env_file::parse_env(&String::from_utf8_lossy(&bytes)),
            Err(GitError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(build_path_error(e)),
        };

        let mut overlay = self.open_env(config)?;
        if let Some(tag) = image_tag {
            overlay.push((IMAGE_VAR.to_string(), tag.to_string()));
        }

        Ok(env_file::assemble(&base, &overlay))
    }

    /// Configured variables with secrets opened, for commands and env text.
    pub fn open_env(&self, config: &BuildConfig) -> Result<Vec<(String, String)>, PipelineError> {
        env_file::open_env_vars(self.vault.as_ref(), &config.env_vars)
            .map_err(|e| PipelineError::Build(format!("{:#}", e)))
    }

    /// Record what is about to be applied so the deployment can be rolled back to later.
    pub fn snapshot(&self, deployment: &mut Deployment, artifact: &Artifact) -> Result<(), PipelineError> {
        let sealed_env = seal_string(self.vault.as_ref(), &artifact.env)
            .map_err(|e| PipelineError::Deploy(format!("failed to seal env snapshot: {:#}", e)))?;
        deployment.image_tag = artifact.image_tag.clone();
        deployment.compose_snapshot = Some(artifact.compose.clone());
        deployment.env_snapshot = Some(sealed_env);
        Ok(())
    }

    /// Apply the artifact and wait for the health check, if configured.
    pub async fn deploy(
        &self,
        stack_id: &str,
        artifact: &Artifact,
        config: Option<&BuildConfig>,
        sink: &LogSink,
    ) -> Result<(), PipelineError> {
        let timeout = config.map(BuildConfig::timeout).unwrap_or(DEFAULT_APPLY_TIMEOUT);

        sink.deploy(format!("Applying stack {}", stack_id));
        let applied = tokio::time::timeout(timeout, self.runtime.apply(stack_id, &artifact.compose, &artifact.env)).await;
        match applied {
            Err(_) => {
                return Err(PipelineError::Timeout {
                    phase: Phase::Deploy,
                    seconds: timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(PipelineError::Deploy(format!("{:#}", e))),
            Ok(Ok(console)) => sink.deploy(console),
        }

        if let Some(path) = config.and_then(|c| c.health_check_path.as_deref()) {
            let timeout_seconds = config.and_then(|c| c.health_check_timeout_seconds);
            sink.deploy(format!("Waiting for {} to report healthy", self.health.url_for(path)));
            self.health
                .wait_healthy(path, timeout_seconds)
                .await
                .map_err(PipelineError::Deploy)?;
            sink.deploy("Health check passed");
        }

        Ok(())
    }

    /// Re-apply `target`'s snapshot. Used by automatic and manual rollback.
    pub async fn redeploy(
        &self,
        target: &Deployment,
        config: Option<&BuildConfig>,
        sink: &LogSink,
    ) -> Result<(), PipelineError> {
        let compose = target.compose_snapshot.clone().ok_or_else(|| {
            PipelineError::Deploy(format!("deployment {} has no artifact snapshot", target.id))
        })?;
        let env = match target.env_snapshot.as_deref() {
            Some(sealed) => open_string(self.vault.as_ref(), sealed)
                .map_err(|e| PipelineError::Deploy(format!("failed to open env snapshot: {:#}", e)))?,
            None => String::new(),
        };

        if let Some(tag) = target.image_tag.as_deref() {
            match self.runtime.image_exists(tag).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(PipelineError::Deploy(format!("image {} is no longer available", tag)))
                }
                Err(e) => warn!("Could not check image {}: {:#}", tag, e),
            }
        }

        sink.deploy(format!(
            "Redeploying deployment {} ({})",
            target.id,
            target.commit_sha.as_deref().unwrap_or("unknown commit")
        ));

        let artifact = Artifact {
            image_tag: target.image_tag.clone(),
            compose,
            env,
        };
        self.deploy(&target.stack_id, &artifact, config, sink).await
    }
}

pub(crate) fn phase_failure(phase: Phase, message: String) -> PipelineError {
    match phase {
        Phase::Sync => PipelineError::Sync(message),
        Phase::Deploy => PipelineError::Deploy(message),
        Phase::PreBuild | Phase::Build | Phase::PostBuild => PipelineError::Build(message),
    }
}

fn process_error(phase: Phase, err: ProcessError) -> PipelineError {
    match err {
        ProcessError::Timeout { seconds, .. } => PipelineError::Timeout { phase, seconds },
        other => phase_failure(phase, other.to_string()),
    }
}

/// Missing files and escaping paths in the build phase are build errors.
fn build_path_error(err: GitError) -> PipelineError {
    match err {
        GitError::Timeout { seconds, .. } => PipelineError::Timeout {
            phase: Phase::Build,
            seconds,
        },
        other => PipelineError::Build(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_is_deterministic() {
        assert_eq!(
            DeploymentExecutor::image_tag("web", Some("ABCDEF0123456789"), "b-1"),
            "stackhook/web:abcdef012345"
        );
        assert_eq!(
            DeploymentExecutor::image_tag("web", None, "6f1c2d3e-aaaa-bbbb"),
            "stackhook/web:6f1c2d3eaaaa"
        );
    }

    #[test]
    fn test_process_timeout_keeps_phase() {
        let err = process_error(
            Phase::PreBuild,
            ProcessError::Timeout {
                program: "sh".into(),
                seconds: 3,
            },
        );
        assert!(matches!(
            err,
            PipelineError::Timeout { phase: Phase::PreBuild, seconds: 3 }
        ));
    }
}
