use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::application::ports::{seal_string, EntityStore, SecretVault, SourceControl};
use crate::db::models::{
    AuthKind, BuildConfig, BuildStrategy, EnvVar, GitRepository, ProviderKind, UpsertBuildConfig,
    UpsertGitRepository,
};
use crate::error::ServiceError;
use crate::git::{validate_ref_name, validate_relative};
use crate::infrastructure::logging::{BoundaryLogger, Timer};
use crate::infrastructure::runtime::compose_runtime::is_valid_stack_id;

/// Placeholder returned for secret values, and accepted back as "unchanged".
pub const MASK: &str = "***";

/// Body of `PUT /api/stacks/{stack_id}/repository`. Secrets arrive in plaintext.
#[derive(Deserialize)]
pub struct RepositoryInput {
    pub remote_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_auth_kind")]
    pub auth_kind: AuthKind,
    /// `{"private_key", "known_hosts"?}` for ssh_key, `{"username"?, "token"}` for http_token.
    /// Omitted on update keeps the stored credentials.
    #[serde(default)]
    pub credentials: Option<serde_json::Value>,
    /// Omitted keeps the stored secret; an empty string clears it.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
}

impl std::fmt::Debug for RepositoryInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryInput")
            .field("remote_url", &self.remote_url)
            .field("branch", &self.branch)
            .field("auth_kind", &self.auth_kind)
            .field("provider", &self.provider)
            .finish()
    }
}

fn default_auth_kind() -> AuthKind {
    AuthKind::None
}

fn default_provider() -> ProviderKind {
    ProviderKind::Generic
}

/// Body of `PUT /api/stacks/{stack_id}/build-config`; omitted fields take defaults.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BuildConfigInput {
    pub strategy: BuildStrategy,
    pub dockerfile_path: String,
    pub compose_path: String,
    pub pre_build_commands: Vec<String>,
    pub post_build_commands: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    pub env_vars: Vec<EnvVar>,
    pub timeout_seconds: i64,
    pub auto_deploy: bool,
    pub branch_patterns: Vec<String>,
    pub rollback_on_failure: bool,
    pub health_check_path: Option<String>,
    pub health_check_timeout_seconds: Option<i64>,
}

impl Default for BuildConfigInput {
    fn default() -> Self {
        let d = UpsertBuildConfig::defaults("");
        Self {
            strategy: d.strategy,
            dockerfile_path: d.dockerfile_path,
            compose_path: d.compose_path,
            pre_build_commands: d.pre_build_commands,
            post_build_commands: d.post_build_commands,
            build_args: d.build_args,
            env_vars: d.env_vars,
            timeout_seconds: d.timeout_seconds,
            auto_deploy: d.auto_deploy,
            branch_patterns: d.branch_patterns,
            rollback_on_failure: d.rollback_on_failure,
            health_check_path: d.health_check_path,
            health_check_timeout_seconds: d.health_check_timeout_seconds,
        }
    }
}

/// RepositoryService - opting stacks into Git-driven builds
///
/// Owns the GitRepository and BuildConfig records. Credentials, webhook
/// secrets and secret env values are sealed on the way in and never returned.
pub struct RepositoryService<S: EntityStore> {
    store: Arc<S>,
    vault: Arc<dyn SecretVault>,
    source: Arc<dyn SourceControl>,
    logger: Arc<BoundaryLogger>,
}

impl<S: EntityStore> RepositoryService<S> {
    pub fn new(
        store: Arc<S>,
        vault: Arc<dyn SecretVault>,
        source: Arc<dyn SourceControl>,
        logger: Arc<BoundaryLogger>,
    ) -> Self {
        Self {
            store,
            vault,
            source,
            logger,
        }
    }

    pub async fn put_repository(
        &self,
        trace_id: &str,
        stack_id: &str,
        input: RepositoryInput,
    ) -> Result<GitRepository, ServiceError> {
        let timer = Timer::start();
        self.logger
            .service_entry(trace_id, "API", "RepositoryService", "put_repository", &input);

        if !is_valid_stack_id(stack_id) {
            return Err(ServiceError::Invalid(format!("invalid stack id: {}", stack_id)));
        }
        let remote_url = input.remote_url.trim().to_string();
        validate_remote_url(&remote_url)?;

        let existing = self.store.get_repository_by_stack(stack_id).await?;

        let credentials = match (input.auth_kind, input.credentials) {
            (AuthKind::None, _) => None,
            (kind, Some(value)) => {
                validate_credentials(kind, &value)?;
                Some(seal_string(self.vault.as_ref(), &value.to_string())?)
            }
            (kind, None) => match existing.as_ref() {
                Some(repo) if repo.auth_kind == kind && repo.credentials.is_some() => repo.credentials.clone(),
                _ => {
                    return Err(ServiceError::Invalid(format!(
                        "credentials are required for {:?} auth",
                        kind
                    )))
                }
            },
        };

        let webhook_secret = match input.webhook_secret {
            Some(secret) if secret.is_empty() => None,
            Some(secret) => Some(seal_string(self.vault.as_ref(), &secret)?),
            None => existing.as_ref().and_then(|r| r.webhook_secret.clone()),
        };

        let branch = match input.branch.map(|b| b.trim().to_string()).filter(|b| !b.is_empty()) {
            Some(branch) => branch,
            None => {
                let now = Utc::now();
                let candidate = GitRepository {
                    id: existing.as_ref().map_or(0, |r| r.id),
                    stack_id: stack_id.to_string(),
                    remote_url: remote_url.clone(),
                    branch: String::new(),
                    auth_kind: input.auth_kind,
                    credentials: credentials.clone(),
                    webhook_secret: None,
                    provider: input.provider,
                    last_synced_commit: None,
                    last_synced_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.logger
                    .external_call(trace_id, "RepositoryService", "git", "resolve_default_branch");
                let branch = self
                    .source
                    .resolve_default_branch(&candidate)
                    .await
                    .map_err(|e| ServiceError::Invalid(format!("could not resolve default branch: {}", e)))?;
                info!("[{}] Resolved default branch of {}: {}", trace_id, remote_url, branch);
                branch
            }
        };
        validate_ref_name(&branch).map_err(|e| ServiceError::Invalid(e.to_string()))?;

        let repo = self
            .store
            .save_repository(UpsertGitRepository {
                stack_id: stack_id.to_string(),
                remote_url,
                branch,
                auth_kind: input.auth_kind,
                credentials,
                webhook_secret,
                provider: input.provider,
            })
            .await?;

        self.logger
            .service_exit(trace_id, "API", "RepositoryService", "put_repository", timer.elapsed_ms());
        Ok(repo)
    }

    pub async fn get_repository(&self, stack_id: &str) -> Result<GitRepository, ServiceError> {
        self.store
            .get_repository_by_stack(stack_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("repository for stack {}", stack_id)))
    }

    /// Delete the repository with its build config, deployments and webhook events.
    pub async fn delete_repository(&self, trace_id: &str, stack_id: &str) -> Result<(), ServiceError> {
        let timer = Timer::start();
        self.logger
            .service_entry(trace_id, "API", "RepositoryService", "delete_repository", &stack_id);

        let repo = self.get_repository(stack_id).await?;
        self.store.delete_repository(repo.id).await?;
        info!("[{}] Stack {} detached from {}", trace_id, stack_id, repo.remote_url);

        self.logger
            .service_exit(trace_id, "API", "RepositoryService", "delete_repository", timer.elapsed_ms());
        Ok(())
    }

    pub async fn put_build_config(
        &self,
        trace_id: &str,
        stack_id: &str,
        input: BuildConfigInput,
    ) -> Result<BuildConfig, ServiceError> {
        let timer = Timer::start();
        self.logger
            .service_entry(trace_id, "API", "RepositoryService", "put_build_config", &input.strategy);

        if !is_valid_stack_id(stack_id) {
            return Err(ServiceError::Invalid(format!("invalid stack id: {}", stack_id)));
        }
        for path in [&input.dockerfile_path, &input.compose_path] {
            if path.trim().is_empty() {
                return Err(ServiceError::Invalid("paths must not be empty".into()));
            }
            validate_relative(path).map_err(|e| ServiceError::Invalid(e.to_string()))?;
        }
        if input.timeout_seconds <= 0 {
            return Err(ServiceError::Invalid("timeout_seconds must be positive".into()));
        }
        if let Some(seconds) = input.health_check_timeout_seconds {
            if seconds <= 0 {
                return Err(ServiceError::Invalid("health_check_timeout_seconds must be positive".into()));
            }
        }
        for pattern in &input.branch_patterns {
            globset::Glob::new(pattern)
                .map_err(|e| ServiceError::Invalid(format!("invalid branch pattern {:?}: {}", pattern, e)))?;
        }

        let existing = self.store.get_build_config(stack_id).await?;
        let env_vars = self.seal_env_vars(input.env_vars, existing.as_ref())?;

        let config = self
            .store
            .save_build_config(UpsertBuildConfig {
                stack_id: stack_id.to_string(),
                strategy: input.strategy,
                dockerfile_path: input.dockerfile_path,
                compose_path: input.compose_path,
                pre_build_commands: input.pre_build_commands,
                post_build_commands: input.post_build_commands,
                build_args: input.build_args,
                env_vars,
                timeout_seconds: input.timeout_seconds,
                auto_deploy: input.auto_deploy,
                branch_patterns: input.branch_patterns,
                rollback_on_failure: input.rollback_on_failure,
                health_check_path: input.health_check_path.filter(|p| !p.is_empty()),
                health_check_timeout_seconds: input.health_check_timeout_seconds,
            })
            .await?;

        self.logger
            .service_exit(trace_id, "API", "RepositoryService", "put_build_config", timer.elapsed_ms());
        Ok(mask_config(config))
    }

    /// Stored config with secret values masked.
    pub async fn get_build_config(&self, stack_id: &str) -> Result<BuildConfig, ServiceError> {
        self.store
            .get_build_config(stack_id)
            .await?
            .map(mask_config)
            .ok_or_else(|| ServiceError::NotFound(format!("build config for stack {}", stack_id)))
    }

    /// Seal secret values. A masked value keeps the stored one.
    fn seal_env_vars(&self, vars: Vec<EnvVar>, existing: Option<&BuildConfig>) -> Result<Vec<EnvVar>, ServiceError> {
        let mut sealed = Vec::with_capacity(vars.len());
        for var in vars {
            if var.name.trim().is_empty() || var.name.contains('=') {
                return Err(ServiceError::Invalid(format!("invalid variable name {:?}", var.name)));
            }
            if !var.secret {
                sealed.push(var);
                continue;
            }

            let kept = (var.value == MASK)
                .then(|| {
                    existing.and_then(|c| c.env_vars.iter().find(|v| v.secret && v.name == var.name))
                })
                .flatten();
            let value = match kept {
                Some(stored) => stored.value.clone(),
                None if var.value == MASK => {
                    return Err(ServiceError::Invalid(format!("no stored value for secret {}", var.name)))
                }
                None => seal_string(self.vault.as_ref(), &var.value)?,
            };
            sealed.push(EnvVar {
                name: var.name,
                value,
                secret: true,
            });
        }
        Ok(sealed)
    }
}

fn mask_config(mut config: BuildConfig) -> BuildConfig {
    for var in config.env_vars.iter_mut().filter(|v| v.secret) {
        var.value = MASK.to_string();
    }
    config
}

/// `http(s)://`, `ssh://`, `git://`, `file://` URLs, or scp-style `user@host:path`.
fn validate_remote_url(url: &str) -> Result<(), ServiceError> {
    if url.is_empty() || url.starts_with('-') || url.chars().any(char::is_whitespace) {
        return Err(ServiceError::Invalid(format!("invalid remote URL: {:?}", url)));
    }
    if url.contains("://") {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ServiceError::Invalid(format!("invalid remote URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https" | "ssh" | "git" | "file") {
            return Err(ServiceError::Invalid(format!("unsupported URL scheme: {}", parsed.scheme())));
        }
        let http_user = parsed.scheme().starts_with("http") && !parsed.username().is_empty();
        if parsed.password().is_some() || http_user {
            return Err(ServiceError::Invalid("put credentials in `credentials`, not in the URL".into()));
        }
        return Ok(());
    }
    match url.split_once(':') {
        Some((host, path)) if !host.is_empty() && !path.is_empty() => Ok(()),
        _ => Err(ServiceError::Invalid(format!("invalid remote URL: {:?}", url))),
    }
}

fn validate_credentials(kind: AuthKind, value: &serde_json::Value) -> Result<(), ServiceError> {
    let field = match kind {
        AuthKind::SshKey => "private_key",
        AuthKind::HttpToken => "token",
        AuthKind::None => return Ok(()),
    };
    match value[field].as_str() {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(ServiceError::Invalid(format!("{:?} credentials need a `{}`", kind, field))),
    }
}
