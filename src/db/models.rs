use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

// =============================================================================
// Enumerations (stored as snake_case TEXT)
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    SshKey,
    HttpToken,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProviderKind {
    Github,
    Gitlab,
    Bitbucket,
    Generic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Github => "github",
            ProviderKind::Gitlab => "gitlab",
            ProviderKind::Bitbucket => "bitbucket",
            ProviderKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(ProviderKind::Github),
            "gitlab" => Ok(ProviderKind::Gitlab),
            "bitbucket" => Ok(ProviderKind::Bitbucket),
            "generic" => Ok(ProviderKind::Generic),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BuildStrategy {
    DockerBuild,
    ComposeOnly,
    Script,
}

/// Deployment lifecycle.
///
/// `pending → building → deploying → successful | failed | rolled_back | cancelled`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Successful,
    Failed,
    RolledBack,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Successful => "successful",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Successful
                | DeploymentStatus::Failed
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeploymentTrigger {
    Manual,
    Webhook,
    Scheduled,
    Api,
}

/// Build request lifecycle: `requested → queued → running → completed | failed`.
/// `cancelled` covers requests withdrawn before or while running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BuildRequestStatus {
    Requested,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BuildRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildRequestStatus::Requested => "requested",
            BuildRequestStatus::Queued => "queued",
            BuildRequestStatus::Running => "running",
            BuildRequestStatus::Completed => "completed",
            BuildRequestStatus::Failed => "failed",
            BuildRequestStatus::Cancelled => "cancelled",
        }
    }
}

// =============================================================================
// Git refs
// =============================================================================

/// A branch or tag, stored in full `refs/...` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    /// Parses `refs/heads/x`, `refs/tags/x`, or a bare name (treated as a branch).
    pub fn parse(value: &str) -> Self {
        if let Some(branch) = value.strip_prefix("refs/heads/") {
            GitRef::Branch(branch.to_string())
        } else if let Some(tag) = value.strip_prefix("refs/tags/") {
            GitRef::Tag(tag.to_string())
        } else {
            GitRef::Branch(value.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            GitRef::Branch(name) | GitRef::Tag(name) => name,
        }
    }

    pub fn full(&self) -> String {
        match self {
            GitRef::Branch(name) => format!("refs/heads/{}", name),
            GitRef::Tag(name) => format!("refs/tags/{}", name),
        }
    }
}

impl std::fmt::Display for GitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full())
    }
}

// =============================================================================
// GitRepository
// =============================================================================

/// One per stack. `credentials` and `webhook_secret` hold vault-sealed text only.
#[derive(Clone, Serialize, FromRow)]
pub struct GitRepository {
    pub id: i64,
    pub stack_id: String,
    pub remote_url: String,
    pub branch: String,
    pub auth_kind: AuthKind,
    #[serde(skip_serializing)]
    pub credentials: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub provider: ProviderKind,
    pub last_synced_commit: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GitRepository {
    pub fn has_webhook_secret(&self) -> bool {
        self.webhook_secret.as_deref().map_or(false, |s| !s.is_empty())
    }
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("id", &self.id)
            .field("stack_id", &self.stack_id)
            .field("remote_url", &self.remote_url)
            .field("branch", &self.branch)
            .field("auth_kind", &self.auth_kind)
            .field("credentials", &self.credentials.as_ref().map(|_| "***"))
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "***"))
            .field("provider", &self.provider)
            .field("last_synced_commit", &self.last_synced_commit)
            .finish()
    }
}

/// Insert-or-update payload; secret fields are already sealed.
#[derive(Clone)]
pub struct UpsertGitRepository {
    pub stack_id: String,
    pub remote_url: String,
    pub branch: String,
    pub auth_kind: AuthKind,
    pub credentials: Option<String>,
    pub webhook_secret: Option<String>,
    pub provider: ProviderKind,
}

// =============================================================================
// BuildConfig
// =============================================================================

/// Environment variable handed to the stack. `value` is sealed when `secret` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildConfig {
    pub id: i64,
    pub stack_id: String,
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
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }
}

/// Raw `build_configs` row; list-valued columns are JSON text.
#[derive(Debug, FromRow)]
pub struct BuildConfigRow {
    pub id: i64,
    pub stack_id: String,
    pub strategy: BuildStrategy,
    pub dockerfile_path: String,
    pub compose_path: String,
    pub pre_build_commands: String,
    pub post_build_commands: String,
    pub build_args: String,
    pub env_vars: String,
    pub timeout_seconds: i64,
    pub auto_deploy: bool,
    pub branch_patterns: String,
    pub rollback_on_failure: bool,
    pub health_check_path: Option<String>,
    pub health_check_timeout_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BuildConfigRow> for BuildConfig {
    type Error = serde_json::Error;

    fn try_from(row: BuildConfigRow) -> Result<Self, Self::Error> {
        Ok(BuildConfig {
            id: row.id,
            stack_id: row.stack_id,
            strategy: row.strategy,
            dockerfile_path: row.dockerfile_path,
            compose_path: row.compose_path,
            pre_build_commands: serde_json::from_str(&row.pre_build_commands)?,
            post_build_commands: serde_json::from_str(&row.post_build_commands)?,
            build_args: serde_json::from_str(&row.build_args)?,
            env_vars: serde_json::from_str(&row.env_vars)?,
            timeout_seconds: row.timeout_seconds,
            auto_deploy: row.auto_deploy,
            branch_patterns: serde_json::from_str(&row.branch_patterns)?,
            rollback_on_failure: row.rollback_on_failure,
            health_check_path: row.health_check_path,
            health_check_timeout_seconds: row.health_check_timeout_seconds,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertBuildConfig {
    pub stack_id: String,
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

impl UpsertBuildConfig {
    /// compose_only defaults for a stack.
    pub fn defaults(stack_id: &str) -> Self {
        Self {
            stack_id: stack_id.to_string(),
            strategy: BuildStrategy::ComposeOnly,
            dockerfile_path: "Dockerfile".to_string(),
            compose_path: "docker-compose.yml".to_string(),
            pre_build_commands: Vec::new(),
            post_build_commands: Vec::new(),
            build_args: BTreeMap::new(),
            env_vars: Vec::new(),
            timeout_seconds: 600,
            auto_deploy: true,
            branch_patterns: Vec::new(),
            rollback_on_failure: false,
            health_check_path: None,
            health_check_timeout_seconds: None,
        }
    }
}

// =============================================================================
// WebhookEvent
// =============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WebhookEvent {
    pub id: i64,
    pub repository_id: i64,
    pub provider: ProviderKind,
    pub event_type: String,
    pub delivery_id: Option<String>,
    pub payload: String,
    pub headers: String,
    pub signature: Option<String>,
    pub verified: bool,
    pub processed: bool,
    pub deployment_id: Option<i64>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub repository_id: i64,
    pub provider: ProviderKind,
    pub event_type: String,
    pub delivery_id: Option<String>,
    pub payload: String,
    pub headers: String,
    pub signature: Option<String>,
    pub verified: bool,
}

// =============================================================================
// Deployment
// =============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Deployment {
    pub id: i64,
    pub stack_id: String,
    pub repository_id: i64,
    pub build_config_id: Option<i64>,
    pub build_id: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub git_ref: String,
    pub status: DeploymentStatus,
    pub trigger_kind: DeploymentTrigger,
    pub triggered_by: Option<String>,
    pub previous_deployment_id: Option<i64>,
    pub build_log: String,
    pub deployment_log: String,
    pub error: Option<String>,
    pub image_tag: Option<String>,
    pub compose_snapshot: Option<String>,
    #[serde(skip_serializing)]
    pub env_snapshot: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn git_ref(&self) -> GitRef {
        GitRef::parse(&self.git_ref)
    }

    /// Marks completion and derives `duration_ms` from `started_at`.
    pub fn finish(&mut self, status: DeploymentStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds());
    }

    /// Appends to `error`, keeping earlier text.
    pub fn push_error(&mut self, message: &str) {
        self.error = Some(match self.error.take() {
            Some(existing) if !existing.is_empty() => format!("{}; {}", existing, message),
            _ => message.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub stack_id: String,
    pub repository_id: i64,
    pub build_config_id: Option<i64>,
    pub build_id: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub git_ref: GitRef,
    pub trigger_kind: DeploymentTrigger,
    pub triggered_by: Option<String>,
}

/// Which append-only log column a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Build,
    Deploy,
}

// =============================================================================
// BuildRequest
// =============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BuildRequest {
    pub build_id: String,
    pub repository_id: i64,
    pub stack_id: String,
    pub deployment_id: i64,
    pub webhook_event_id: Option<i64>,
    /// Set for rollback requests: re-apply this deployment's snapshot instead of building.
    pub rollback_target_id: Option<i64>,
    pub git_ref: String,
    pub commit_sha: Option<String>,
    pub status: BuildRequestStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewBuildRequest {
    pub build_id: String,
    pub repository_id: i64,
    pub stack_id: String,
    pub deployment_id: i64,
    pub webhook_event_id: Option<i64>,
    pub rollback_target_id: Option<i64>,
    pub git_ref: GitRef,
    pub commit_sha: Option<String>,
}
