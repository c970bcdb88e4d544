//! In-process fakes and seed helpers for pipeline and service tests.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BuildQueue, BuildWorker, DeploymentExecutor};
use crate::application::events::BroadcastEventBus;
use crate::application::ports::*;
use crate::db::models::*;
use crate::error::GitError;
use crate::git::confine;
use crate::infrastructure::database::sqlite_store::{test_store, SqliteStore};
use crate::infrastructure::logging::BoundaryLogger;
use crate::infrastructure::runtime::HealthCheck;
use crate::infrastructure::vault::aes_vault::{AesGcmVault, KeySource};

pub const COMPOSE: &str = "services:\n  web:\n    image: nginx:1.27\n";

/// Working copies are plain directories; "syncing" writes the configured files.
pub struct FakeSource {
    root: tempfile::TempDir,
    pub files: Mutex<HashMap<String, String>>,
    pub head: Mutex<Commit>,
    pub fail_sync: Mutex<Option<String>>,
}

impl FakeSource {
    pub fn new() -> Self {
        let mut files = HashMap::new();
        files.insert("docker-compose.yml".to_string(), COMPOSE.to_string());
        Self {
            root: tempfile::tempdir().expect("tempdir"),
            files: Mutex::new(files),
            head: Mutex::new(commit("abc123", "initial")),
            fail_sync: Mutex::new(None),
        }
    }

    pub fn set_head(&self, sha: &str, compose: &str) {
        *self.head.lock().unwrap() = commit(sha, "update");
        self.files
            .lock()
            .unwrap()
            .insert("docker-compose.yml".to_string(), compose.to_string());
    }

    fn write_files(&self, repo: &GitRepository) -> Result<(), GitError> {
        let dir = self.working_copy(repo);
        std::fs::create_dir_all(dir.join(".git"))?;
        for (path, content) in self.files.lock().unwrap().iter() {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }
}

pub fn commit(sha: &str, message: &str) -> Commit {
    Commit {
        sha: sha.to_string(),
        message: message.to_string(),
        author: "a".to_string(),
        email: "a@example.com".to_string(),
        committed_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    fn working_copy(&self, repo: &GitRepository) -> PathBuf {
        self.root.path().join(repo.id.to_string())
    }

    async fn clone_repo(&self, repo: &GitRepository, _git_ref: &GitRef) -> Result<(), GitError> {
        self.write_files(repo)
    }

    async fn pull(&self, repo: &GitRepository, _branch: &str) -> Result<(), GitError> {
        if let Some(message) = self.fail_sync.lock().unwrap().clone() {
            return Err(GitError::NonFastForward(message));
        }
        self.write_files(repo)
    }

    async fn checkout(&self, _repo: &GitRepository, _git_ref: &GitRef) -> Result<(), GitError> {
        Ok(())
    }

    async fn current_commit(&self, _repo: &GitRepository) -> Result<Commit, GitError> {
        Ok(self.head.lock().unwrap().clone())
    }

    async fn history(&self, _repo: &GitRepository, limit: usize) -> Result<Vec<Commit>, GitError> {
        Ok(vec![self.head.lock().unwrap().clone()].into_iter().take(limit).collect())
    }

    async fn read_file(&self, repo: &GitRepository, path: &str) -> Result<Vec<u8>, GitError> {
        let resolved = confine(&self.working_copy(repo), path)?;
        Ok(tokio::fs::read(resolved).await?)
    }

    async fn list_files(&self, _repo: &GitRepository, _dir: &str) -> Result<Vec<String>, GitError> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    async fn resolve_default_branch(&self, _repo: &GitRepository) -> Result<String, GitError> {
        Ok("main".to_string())
    }
}

/// Records every apply; fails applies whose compose text contains `fail_marker`.
#[derive(Default)]
pub struct FakeRuntime {
    pub applied: Mutex<Vec<(String, String, String)>>,
    pub fail_marker: Mutex<Option<String>>,
}

impl FakeRuntime {
    pub fn applied(&self) -> Vec<(String, String, String)> {
        self.applied.lock().unwrap().clone()
    }

    /// The stack is healthy unless the last applied compose mentions [`UNHEALTHY`].
    pub fn healthy(&self) -> bool {
        self.applied
            .lock()
            .unwrap()
            .last()
            .is_some_and(|(_, compose, _)| !compose.contains(UNHEALTHY))
    }
}

pub const UNHEALTHY: &str = "unhealthy";

/// Serve `GET /healthz` on an ephemeral port, answering from `runtime.healthy()`.
pub async fn serve_runtime_health(runtime: Arc<FakeRuntime>) -> String {
    use axum::{http::StatusCode, routing::get, Router};

    let router = Router::new().route(
        "/healthz",
        get(move || {
            let runtime = runtime.clone();
            async move {
                if runtime.healthy() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[async_trait]
impl StackRuntime for FakeRuntime {
    async fn apply(&self, stack_id: &str, compose: &str, env: &str) -> Result<String> {
        if let Some(marker) = self.fail_marker.lock().unwrap().as_deref() {
            if compose.contains(marker) {
                anyhow::bail!("container exited with code 1");
            }
        }
        self.applied
            .lock()
            .unwrap()
            .push((stack_id.to_string(), compose.to_string(), env.to_string()));
        Ok(format!("stack {} up to date", stack_id))
    }

    async fn image_exists(&self, _tag: &str) -> Result<bool> {
        Ok(true)
    }
}

pub fn test_vault() -> Arc<AesGcmVault> {
    Arc::new(AesGcmVault::new(KeySource::Inline(
        base64::engine::general_purpose::STANDARD.encode([7_u8; 32]),
    )))
}

pub async fn seed_repository(store: &SqliteStore, stack_id: &str) -> GitRepository {
    store
        .save_repository(UpsertGitRepository {
            stack_id: stack_id.to_string(),
            remote_url: format!("https://git.example.com/{}.git", stack_id),
            branch: "main".to_string(),
            auth_kind: AuthKind::None,
            credentials: None,
            webhook_secret: None,
            provider: ProviderKind::Generic,
        })
        .await
        .unwrap()
}

pub async fn seed_config(store: &SqliteStore, stack_id: &str, edit: impl FnOnce(&mut UpsertBuildConfig)) -> BuildConfig {
    let mut config = UpsertBuildConfig::defaults(stack_id);
    edit(&mut config);
    store.save_build_config(config).await.unwrap()
}

pub fn new_deployment(repo: &GitRepository, build_id: &str, sha: Option<&str>) -> NewDeployment {
    NewDeployment {
        stack_id: repo.stack_id.clone(),
        repository_id: repo.id,
        build_config_id: None,
        build_id: build_id.to_string(),
        commit_sha: sha.map(str::to_string),
        commit_message: None,
        commit_author: None,
        git_ref: GitRef::Branch(repo.branch.clone()),
        trigger_kind: DeploymentTrigger::Manual,
        triggered_by: None,
    }
}

/// Store, bus, fakes, queue and worker wired together; the worker is not started.
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub bus: BroadcastEventBus,
    pub source: Arc<FakeSource>,
    pub runtime: Arc<FakeRuntime>,
    pub vault: Arc<AesGcmVault>,
    pub queue: Arc<BuildQueue<SqliteStore>>,
    pub worker: Arc<BuildWorker<SqliteStore, BroadcastEventBus>>,
    pub logger: Arc<BoundaryLogger>,
}

impl Harness {
    /// Health checks go to a closed port and always fail.
    pub async fn new() -> Self {
        Self::build(Arc::new(FakeRuntime::default()), "http://127.0.0.1:9".to_string()).await
    }

    /// Health checks go to [`serve_runtime_health`] for this harness' runtime.
    pub async fn with_runtime_health() -> Self {
        let runtime = Arc::new(FakeRuntime::default());
        let base = serve_runtime_health(runtime.clone()).await;
        Self::build(runtime, base).await
    }

    async fn build(runtime: Arc<FakeRuntime>, health_base: String) -> Self {
        let store = Arc::new(test_store().await);
        let logger = Arc::new(BoundaryLogger::new());
        let bus = BroadcastEventBus::new_default(logger.clone());
        let source = Arc::new(FakeSource::new());
        let vault = test_vault();

        let executor = Arc::new(DeploymentExecutor::new(
            runtime.clone(),
            vault.clone(),
            HealthCheck::new(health_base).with_interval(Duration::from_millis(50)),
            "docker".to_string(),
        ));
        let queue = Arc::new(BuildQueue::new(store.clone()));
        let worker = Arc::new(BuildWorker::new(
            store.clone(),
            bus.clone(),
            queue.clone(),
            source.clone(),
            executor,
            logger.clone(),
        ));

        Self {
            store,
            bus,
            source,
            runtime,
            vault,
            queue,
            worker,
            logger,
        }
    }

    /// Run queued builds on the current task until the queue is drained.
    pub async fn drain(&self) {
        while !self.queue.is_empty().await {
            let (build_id, cancel) = self.queue.next().await;
            self.worker.process(&build_id, &cancel).await;
            self.queue.finish(&build_id).await;
        }
    }

    pub async fn deployment(&self, id: i64) -> Deployment {
        self.store.get_deployment(id).await.unwrap().unwrap()
    }
}
