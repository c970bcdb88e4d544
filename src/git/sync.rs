use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::auth::StagedAuth;
use super::paths::confine;
use super::refs::{validate_ref, validate_ref_name};
use crate::application::ports::{Commit, SecretVault, SourceControl};
use crate::db::models::{GitRef, GitRepository};
use crate::error::GitError;
use crate::infrastructure::process::{CommandOutput, CommandSpec, ProcessError, ProcessRunner};
use crate::providers::default_branch::parse_symref_head;

const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%ae%x1f%cI%x1f%B%x1e";

/// `git` CLI implementation of [`SourceControl`].
///
/// Working copies live at `<workspaces_root>/<repository id>`. Credentials are
/// staged per operation and removed when it finishes.
pub struct GitCliSync {
    workspaces_root: PathBuf,
    credentials_root: PathBuf,
    vault: Arc<dyn SecretVault>,
    runner: ProcessRunner,
    timeout: Duration,
}

impl GitCliSync {
    pub fn new(
        workspaces_root: PathBuf,
        credentials_root: PathBuf,
        vault: Arc<dyn SecretVault>,
        timeout: Duration,
    ) -> Self {
        Self {
            workspaces_root,
            credentials_root,
            vault,
            runner: ProcessRunner::new(),
            timeout,
        }
    }

    async fn stage(&self, repo: &GitRepository) -> Result<StagedAuth, GitError> {
        StagedAuth::stage(
            repo,
            self.vault.as_ref(),
            &self.credentials_root,
            &self.runner,
            self.timeout,
        )
        .await
    }

    async fn run(&self, operation: &str, auth: &StagedAuth, spec: CommandSpec) -> Result<CommandOutput, GitError> {
        debug!("git {}: {:?}", operation, spec.args);

        let output = self.runner.run(&spec).await.map_err(|e| match e {
            ProcessError::Timeout { seconds, .. } => GitError::Timeout {
                operation: operation.to_string(),
                seconds,
            },
            other => GitError::Command {
                operation: operation.to_string(),
                message: auth.scrub(&other.to_string()),
            },
        })?;

        if !output.success() {
            return Err(GitError::Command {
                operation: operation.to_string(),
                message: auth.scrub(output.stderr.trim()),
            });
        }
        Ok(output)
    }

    fn existing_working_copy(&self, repo: &GitRepository) -> Result<PathBuf, GitError> {
        let path = self.working_copy(repo);
        if !path.join(".git").exists() {
            return Err(GitError::MissingWorkingCopy(path.display().to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl SourceControl for GitCliSync {
    fn working_copy(&self, repo: &GitRepository) -> PathBuf {
        self.workspaces_root.join(repo.id.to_string())
    }

    async fn clone_repo(&self, repo: &GitRepository, git_ref: &GitRef) -> Result<(), GitError> {
        validate_ref(git_ref)?;
        let path = self.working_copy(repo);

        // Leftovers of an interrupted clone
        if path.exists() && !path.join(".git").exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&self.workspaces_root).await?;

        info!("Cloning {} ({}) into {}", repo.remote_url, git_ref, path.display());
        let auth = self.stage(repo).await?;
        let spec = auth.git_command(
            [
                "clone".to_string(),
                "--depth".to_string(),
                "1".to_string(),
                "--single-branch".to_string(),
                "--branch".to_string(),
                git_ref.name().to_string(),
                "--".to_string(),
                repo.remote_url.clone(),
                path.display().to_string(),
            ],
            self.timeout,
        );
        self.run("clone", &auth, spec).await?;
        Ok(())
    }

    async fn pull(&self, repo: &GitRepository, branch: &str) -> Result<(), GitError> {
        validate_ref_name(branch)?;
        let path = self.existing_working_copy(repo)?;
        let auth = self.stage(repo).await?;

        let spec = auth
            .git_command(["pull", "--ff-only", "origin", branch], self.timeout)
            .cwd(&path);
        match self.run("pull", &auth, spec).await {
            Err(GitError::Command { message, .. })
                if message.contains("fast-forward") || message.contains("diverge") =>
            {
                Err(GitError::NonFastForward(message))
            }
            other => other.map(|_| ()),
        }
    }

    async fn checkout(&self, repo: &GitRepository, git_ref: &GitRef) -> Result<(), GitError> {
        validate_ref(git_ref)?;
        let path = self.existing_working_copy(repo)?;
        let auth = self.stage(repo).await?;

        let (refspec, target) = match git_ref {
            GitRef::Branch(branch) => (
                format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch),
                branch.clone(),
            ),
            GitRef::Tag(tag) => (format!("+refs/tags/{0}:refs/tags/{0}", tag), git_ref.full()),
        };

        // No --depth here: re-shallowing at the new tip cuts it off from HEAD and
        // every later fast-forward check fails
        let fetch = auth
            .git_command(["fetch", "origin", refspec.as_str()], self.timeout)
            .cwd(&path);
        self.run("fetch", &auth, fetch).await?;

        let args: Vec<String> = match git_ref {
            GitRef::Branch(branch) => {
                let local_ref = format!("refs/heads/{}", branch);
                let local = auth
                    .git_command(["rev-parse", "--verify", "--quiet", local_ref.as_str()], self.timeout)
                    .cwd(&path);
                if self.run("rev-parse", &auth, local).await.is_ok() {
                    vec!["checkout".into(), target]
                } else {
                    vec![
                        "checkout".into(),
                        "-b".into(),
                        target,
                        "--track".into(),
                        format!("origin/{}", branch),
                    ]
                }
            }
            GitRef::Tag(_) => vec!["checkout".into(), "--detach".into(), target],
        };

        // Never forced: local modifications fail the checkout instead of being discarded
        let checkout = auth.git_command(args, self.timeout).cwd(&path);
        self.run("checkout", &auth, checkout).await?;
        Ok(())
    }

    async fn current_commit(&self, repo: &GitRepository) -> Result<Commit, GitError> {
        self.history(repo, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GitError::Parse("no commits in working copy".into()))
    }

    async fn history(&self, repo: &GitRepository, limit: usize) -> Result<Vec<Commit>, GitError> {
        let path = self.existing_working_copy(repo)?;
        let auth = StagedAuth::anonymous();
        let spec = auth
            .git_command(
                ["log".to_string(), "-n".to_string(), limit.max(1).to_string(), LOG_FORMAT.to_string()],
                self.timeout,
            )
            .cwd(&path);
        let output = self.run("log", &auth, spec).await?;
        parse_log(&output.stdout)
    }

    async fn read_file(&self, repo: &GitRepository, path: &str) -> Result<Vec<u8>, GitError> {
        let root = self.working_copy(repo);
        let resolved = confine(&root, path)?;
        if !root.join(".git").exists() {
            return Err(GitError::MissingWorkingCopy(root.display().to_string()));
        }
        Ok(tokio::fs::read(&resolved).await?)
    }

    async fn list_files(&self, repo: &GitRepository, dir: &str) -> Result<Vec<String>, GitError> {
        let root = self.working_copy(repo);
        let resolved = confine(&root, dir)?;
        if !root.join(".git").exists() {
            return Err(GitError::MissingWorkingCopy(root.display().to_string()));
        }

        let prefix = dir.trim_start_matches("./").trim_end_matches('/');
        let mut entries = tokio::fs::read_dir(&resolved).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ".git" {
                continue;
            }
            if prefix.is_empty() || prefix == "." {
                files.push(name);
            } else {
                files.push(format!("{}/{}", prefix, name));
            }
        }
        files.sort();
        Ok(files)
    }

    async fn resolve_default_branch(&self, repo: &GitRepository) -> Result<String, GitError> {
        let auth = self.stage(repo).await?;
        let spec = auth.git_command(
            ["ls-remote", "--symref", "--", repo.remote_url.as_str(), "HEAD"],
            self.timeout,
        );
        let output = self.run("ls-remote", &auth, spec).await?;
        parse_symref_head(&output.stdout)
            .ok_or_else(|| GitError::Parse("remote did not advertise a HEAD symref".into()))
    }
}

/// Parse `git log` output written with [`LOG_FORMAT`].
fn parse_log(output: &str) -> Result<Vec<Commit>, GitError> {
    output
        .split('\x1e')
        .map(|record| record.trim_start_matches(['\n', '\r']))
        .filter(|record| !record.trim().is_empty())
        .map(|record| {
            let fields: Vec<&str> = record.splitn(5, '\x1f').collect();
            if fields.len() != 5 {
                return Err(GitError::Parse(format!("unexpected log record: {:?}", record)));
            }
            Ok(Commit {
                sha: fields[0].to_string(),
                author: fields[1].to_string(),
                email: fields[2].to_string(),
                committed_at: fields[3].to_string(),
                message: fields[4].trim_end().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AuthKind, ProviderKind};
    use crate::infrastructure::vault::aes_vault::{AesGcmVault, KeySource};
    use chrono::Utc;
    use std::path::Path;

    fn repo() -> GitRepository {
        let now = Utc::now();
        GitRepository {
            id: 1,
            stack_id: "web".into(),
            remote_url: "https://git.example.com/acme/web.git".into(),
            branch: "main".into(),
            auth_kind: AuthKind::None,
            credentials: None,
            webhook_secret: None,
            provider: ProviderKind::Generic,
            last_synced_commit: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sync(root: &std::path::Path) -> GitCliSync {
        GitCliSync::new(
            root.join("workspaces"),
            root.join("credentials"),
            Arc::new(AesGcmVault::new(KeySource::File(root.join("vault.key")))),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_parse_log_records() {
        let out = "abc\x1fAlice\x1fa@example.com\x1f2024-05-01T10:00:00+00:00\x1ffix: thing\n\nbody line\n\x1e\n\
                   def\x1fBob\x1fb@example.com\x1f2024-04-30T09:00:00+00:00\x1finitial\n\x1e\n";

        let commits = parse_log(out).unwrap();

        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].sha, "abc");
        assert_eq!(commits[0].author, "Alice");
        assert_eq!(commits[0].message, "fix: thing\n\nbody line");
        assert_eq!(commits[1].email, "b@example.com");
    }

    #[test]
    fn test_parse_log_rejects_garbage() {
        assert!(matches!(parse_log("nonsense\x1e"), Err(GitError::Parse(_))));
        assert!(parse_log("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_file_rejects_traversal_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync(dir.path());

        // No working copy exists at all; the lexical check still fires first
        let result = sync.read_file(&repo(), "../../etc/passwd").await;
        assert!(matches!(result, Err(GitError::PathEscapes(_))));
    }

    #[tokio::test]
    async fn test_read_and_list_inside_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync(dir.path());
        let wc = sync.working_copy(&repo());
        std::fs::create_dir_all(wc.join(".git")).unwrap();
        std::fs::create_dir_all(wc.join("deploy")).unwrap();
        std::fs::write(wc.join("deploy/docker-compose.yml"), "services: {}\n").unwrap();
        std::fs::write(wc.join("README.md"), "hi").unwrap();

        let bytes = sync.read_file(&repo(), "deploy/docker-compose.yml").await.unwrap();
        assert_eq!(bytes, b"services: {}\n");

        assert_eq!(sync.list_files(&repo(), "").await.unwrap(), vec!["README.md", "deploy"]);
        assert_eq!(
            sync.list_files(&repo(), "deploy").await.unwrap(),
            vec!["deploy/docker-compose.yml"]
        );
    }

    #[tokio::test]
    async fn test_missing_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let result = sync(dir.path()).history(&repo(), 5).await;
        assert!(matches!(result, Err(GitError::MissingWorkingCopy(_))));
    }

    /// Run git in `dir` with a fixed identity; panics on failure.
    fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(["-c", "commit.gpgsign=false", "-c", "tag.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Dev")
            .env("GIT_AUTHOR_EMAIL", "dev@example.com")
            .env("GIT_COMMITTER_NAME", "Dev")
            .env("GIT_COMMITTER_EMAIL", "dev@example.com")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// A bare `origin.git` plus an `author` clone used to push to it.
    struct Remote {
        _dir: tempfile::TempDir,
        bare: PathBuf,
        author: PathBuf,
    }

    impl Remote {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bare = dir.path().join("origin.git");
            let author = dir.path().join("author");
            git(dir.path(), &["init", "--bare", "--initial-branch=main", "origin.git"]);
            git(dir.path(), &["init", "--initial-branch=main", "author"]);
            git(&author, &["remote", "add", "origin", bare.to_str().unwrap()]);
            Self { _dir: dir, bare, author }
        }

        fn url(&self) -> String {
            format!("file://{}", self.bare.display())
        }

        /// Commit `compose` as docker-compose.yml and return the new sha.
        fn commit(&self, compose: &str, message: &str) -> String {
            std::fs::write(self.author.join("docker-compose.yml"), compose).unwrap();
            git(&self.author, &["add", "docker-compose.yml"]);
            git(&self.author, &["commit", "-q", "-m", message]);
            git(&self.author, &["rev-parse", "HEAD"])
        }

        fn push(&self, args: &[&str]) {
            let mut full = vec!["push", "-q", "origin"];
            full.extend_from_slice(args);
            git(&self.author, &full);
        }
    }

    fn remote_repo(remote: &Remote) -> GitRepository {
        GitRepository {
            remote_url: remote.url(),
            ..repo()
        }
    }

    fn main_ref() -> GitRef {
        GitRef::Branch("main".into())
    }

    #[tokio::test]
    async fn test_first_sync_clones_remote() {
        let remote = Remote::new();
        let one = remote.commit("services: {}\n", "one");
        remote.push(&["main"]);
        let dir = tempfile::tempdir().unwrap();
        let sync = sync(dir.path());
        let repo = remote_repo(&remote);

        let head = sync.sync(&repo, &main_ref()).await.unwrap();

        assert_eq!(head.sha, one);
        assert_eq!(head.message, "one");
        assert_eq!(head.email, "dev@example.com");
        assert_eq!(sync.read_file(&repo, "docker-compose.yml").await.unwrap(), b"services: {}\n");
    }

    #[tokio::test]
    async fn test_linear_pushes_fast_forward_the_working_copy() {
        let remote = Remote::new();
        remote.commit("one\n", "one");
        remote.push(&["main"]);
        let dir = tempfile::tempdir().unwrap();
        let sync = sync(dir.path());
        let repo = remote_repo(&remote);
        sync.sync(&repo, &main_ref()).await.unwrap();

        let two = remote.commit("two\n", "two");
        remote.push(&["main"]);
        let head = sync.sync(&repo, &main_ref()).await.unwrap();
        assert_eq!(head.sha, two);

        let three = remote.commit("three\n", "three");
        remote.push(&["main"]);
        let head = sync.sync(&repo, &main_ref()).await.unwrap();
        assert_eq!(head.sha, three);
        assert_eq!(sync.read_file(&repo, "docker-compose.yml").await.unwrap(), b"three\n");

        let history = sync.history(&repo, 10).await.unwrap();
        assert_eq!(history[0].message, "three");
        assert_eq!(history[1].message, "two");
    }

    #[tokio::test]
    async fn test_rewritten_history_is_not_fast_forwarded() {
        let remote = Remote::new();
        remote.commit("base\n", "base");
        let one = remote.commit("one\n", "one");
        remote.push(&["main"]);
        let dir = tempfile::tempdir().unwrap();
        let sync = sync(dir.path());
        let repo = remote_repo(&remote);
        sync.sync(&repo, &main_ref()).await.unwrap();

        git(&remote.author, &["reset", "-q", "--hard", "HEAD~1"]);
        remote.commit("rewritten\n", "rewritten");
        remote.push(&["--force", "main"]);

        let result = sync.sync(&repo, &main_ref()).await;
        assert!(matches!(result, Err(GitError::NonFastForward(_))), "{:?}", result);

        // Working copy left as it was
        assert_eq!(sync.current_commit(&repo).await.unwrap().sha, one);
        assert_eq!(sync.read_file(&repo, "docker-compose.yml").await.unwrap(), b"one\n");
    }

    #[tokio::test]
    async fn test_tag_checkout_is_detached_at_the_tag() {
        let remote = Remote::new();
        let tagged = remote.commit("v1\n", "release 1");
        git(&remote.author, &["tag", "v1.0"]);
        remote.commit("v2\n", "work after release");
        remote.push(&["main", "--tags"]);
        let dir = tempfile::tempdir().unwrap();
        let sync = sync(dir.path());
        let repo = remote_repo(&remote);
        sync.sync(&repo, &main_ref()).await.unwrap();

        let head = sync.sync(&repo, &GitRef::Tag("v1.0".into())).await.unwrap();

        assert_eq!(head.sha, tagged);
        assert_eq!(sync.read_file(&repo, "docker-compose.yml").await.unwrap(), b"v1\n");
        let wc = sync.working_copy(&repo);
        assert_eq!(git(&wc, &["rev-parse", "--abbrev-ref", "HEAD"]), "HEAD");
    }

    #[tokio::test]
    async fn test_default_branch_from_remote_head() {
        let remote = Remote::new();
        remote.commit("one\n", "one");
        remote.push(&["main:develop"]);
        git(&remote.bare, &["symbolic-ref", "HEAD", "refs/heads/develop"]);
        let dir = tempfile::tempdir().unwrap();

        let branch = sync(dir.path())
            .resolve_default_branch(&remote_repo(&remote))
            .await
            .unwrap();

        assert_eq!(branch, "develop");
    }

    #[tokio::test]
    async fn test_invalid_ref_is_rejected_before_running_git() {
        let dir = tempfile::tempdir().unwrap();
        let result = sync(dir.path())
            .clone_repo(&repo(), &GitRef::Branch("--upload-pack=evil".into()))
            .await;
        assert!(matches!(result, Err(GitError::InvalidRef(_))));
    }
}
