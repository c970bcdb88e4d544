use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;

use crate::db::models::{GitRef, GitRepository};
use crate::error::GitError;

/// Commit metadata read from a working copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub email: String,
    pub committed_at: String,
}

/// Git Sync: keeps one working copy per repository in step with its remote.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// On-disk location of the repository's working copy.
    fn working_copy(&self, repo: &GitRepository) -> PathBuf;

    /// Shallow, single-branch clone of `git_ref`. Later fetches extend it incrementally.
    async fn clone_repo(&self, repo: &GitRepository, git_ref: &GitRef) -> Result<(), GitError>;

    /// Fast-forward-only pull of `branch`.
    async fn pull(&self, repo: &GitRepository, branch: &str) -> Result<(), GitError>;

    async fn checkout(&self, repo: &GitRepository, git_ref: &GitRef) -> Result<(), GitError>;

    async fn current_commit(&self, repo: &GitRepository) -> Result<Commit, GitError>;

    async fn history(&self, repo: &GitRepository, limit: usize) -> Result<Vec<Commit>, GitError>;

    /// Reads a file relative to the repository root; paths escaping the root are rejected.
    async fn read_file(&self, repo: &GitRepository, path: &str) -> Result<Vec<u8>, GitError>;

    /// Lists files (relative paths) directly under `dir`; same confinement as `read_file`.
    async fn list_files(&self, repo: &GitRepository, dir: &str) -> Result<Vec<String>, GitError>;

    /// Default branch of the remote, without cloning.
    async fn resolve_default_branch(&self, repo: &GitRepository) -> Result<String, GitError>;

    /// Clone if the working copy is missing, otherwise checkout and pull.
    /// Returns the checked-out HEAD.
    async fn sync(&self, repo: &GitRepository, git_ref: &GitRef) -> Result<Commit, GitError> {
        let working_copy = self.working_copy(repo);
        if !working_copy.join(".git").exists() {
            self.clone_repo(repo, git_ref).await?;
        } else {
            self.checkout(repo, git_ref).await?;
            if let GitRef::Branch(branch) = git_ref {
                self.pull(repo, branch).await?;
            }
        }
        self.current_commit(repo).await
    }
}
