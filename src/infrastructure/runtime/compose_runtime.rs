use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::application::ports::StackRuntime;
use crate::infrastructure::process::{CommandSpec, ProcessRunner};
use crate::infrastructure::vault::aes_vault::write_private_file;

/// `docker compose` backed stack runtime.
///
/// Each stack gets a managed directory `<stacks_dir>/<stack_id>/` holding the
/// applied `docker-compose.yml` and `.env`; the compose project name is the stack id.
///
/// The managed directory is also the compose project directory, so relative
/// `build:` contexts and bind mounts resolve there and not in the repository's
/// working copy. Stacks reference images (built in the build phase or pulled)
/// and absolute host paths.
pub struct ComposeStackRuntime {
    stacks_dir: PathBuf,
    compose_bin: String,
    timeout: Duration,
    runner: ProcessRunner,
    docker: Option<Docker>,
}

impl ComposeStackRuntime {
    pub fn new(stacks_dir: PathBuf, compose_bin: String, timeout: Duration) -> Self {
        // Image lookups degrade to the CLI when the socket is unavailable
        let docker = match Docker::connect_with_local_defaults() {
            Ok(docker) => Some(docker),
            Err(e) => {
                warn!("Docker API unavailable, falling back to CLI for image checks: {}", e);
                None
            }
        };

        Self {
            stacks_dir,
            compose_bin,
            timeout,
            runner: ProcessRunner::new(),
            docker,
        }
    }

    pub fn stack_dir(&self, stack_id: &str) -> Result<PathBuf> {
        if !is_valid_stack_id(stack_id) {
            anyhow::bail!("invalid stack id: {}", stack_id);
        }
        Ok(self.stacks_dir.join(stack_id))
    }
}

/// Compose project names: lowercase alphanumerics, `-` and `_`, not leading with a separator.
pub fn is_valid_stack_id(stack_id: &str) -> bool {
    let mut chars = stack_id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    stack_id.len() <= 64
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[async_trait]
impl StackRuntime for ComposeStackRuntime {
    async fn apply(&self, stack_id: &str, compose: &str, env: &str) -> Result<String> {
        let dir = self.stack_dir(stack_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create stack directory {}", dir.display()))?;

        let compose_path = dir.join("docker-compose.yml");
        let env_path = dir.join(".env");
        tokio::fs::write(&compose_path, compose)
            .await
            .context("Failed to write compose file")?;
        write_private_file(&env_path, env.as_bytes())?;

        info!("Applying stack {} from {}", stack_id, dir.display());

        let spec = CommandSpec::new(&self.compose_bin, self.timeout)
            .arg("compose")
            .args(["-p", stack_id])
            .arg("--project-directory")
            .arg(dir.to_string_lossy())
            .arg("-f")
            .arg(compose_path.to_string_lossy())
            .arg("--env-file")
            .arg(env_path.to_string_lossy())
            .args(["up", "-d", "--remove-orphans"])
            .cwd(&dir);

        let output = self.runner.run(&spec).await?;
        let console = format!("{}{}", output.stdout, output.stderr);
        if !output.success() {
            anyhow::bail!(
                "compose up exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(console)
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        if let Some(docker) = &self.docker {
            return match docker.inspect_image(tag).await {
                Ok(_) => Ok(true),
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
                Err(e) => Err(e).context("Failed to inspect image"),
            };
        }

        let spec = CommandSpec::new(&self.compose_bin, self.timeout).args(["image", "inspect", tag]);
        let output = self.runner.run(&spec).await?;
        Ok(output.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_id_validation() {
        assert!(is_valid_stack_id("web"));
        assert!(is_valid_stack_id("api-v2_blue"));
        assert!(!is_valid_stack_id(""));
        assert!(!is_valid_stack_id("-web"));
        assert!(!is_valid_stack_id("../etc"));
        assert!(!is_valid_stack_id("Web"));
        assert!(!is_valid_stack_id("a b"));
    }

    #[tokio::test]
    async fn test_apply_writes_managed_files_before_invoking_runtime() {
        let dir = tempfile::tempdir().unwrap();
        // `false` stands in for the compose binary: files are written, the invocation fails
        let runtime = ComposeStackRuntime::new(dir.path().to_path_buf(), "false".into(), Duration::from_secs(5));

        let result = runtime.apply("web", "services: {}\n", "A=1\n").await;

        assert!(result.is_err());
        let stack_dir = dir.path().join("web");
        assert_eq!(std::fs::read_to_string(stack_dir.join("docker-compose.yml")).unwrap(), "services: {}\n");
        assert_eq!(std::fs::read_to_string(stack_dir.join(".env")).unwrap(), "A=1\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compose_runs_with_managed_project_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-docker");
        std::fs::write(&bin, "#!/bin/sh\necho \"cwd=$(pwd -P)\"\necho \"args=$*\"\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let stacks = dir.path().join("stacks");
        let runtime = ComposeStackRuntime::new(stacks.clone(), bin.display().to_string(), Duration::from_secs(5));

        let console = runtime.apply("web", "services: {}\n", "").await.unwrap();

        let stack_dir = stacks.join("web").canonicalize().unwrap();
        assert!(console.contains(&format!("cwd={}", stack_dir.display())), "{}", console);
        assert!(
            console.contains(&format!("--project-directory {}", stacks.join("web").display())),
            "{}",
            console
        );
        assert!(console.contains("up -d --remove-orphans"));
    }

    #[tokio::test]
    async fn test_apply_rejects_unsafe_stack_id() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ComposeStackRuntime::new(dir.path().to_path_buf(), "true".into(), Duration::from_secs(5));
        assert!(runtime.apply("../escape", "", "").await.is_err());
    }
}
