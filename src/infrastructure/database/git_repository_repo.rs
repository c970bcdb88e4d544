use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::SqliteStore;
use crate::application::ports::GitRepositoryRepository;
use crate::db::models::{GitRepository, UpsertGitRepository};

#[async_trait]
impl GitRepositoryRepository for SqliteStore {
    async fn get_repository(&self, id: i64) -> Result<Option<GitRepository>> {
        let repo = sqlx::query_as::<_, GitRepository>("SELECT * FROM git_repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(repo)
    }

    async fn get_repository_by_stack(&self, stack_id: &str) -> Result<Option<GitRepository>> {
        let repo = sqlx::query_as::<_, GitRepository>("SELECT * FROM git_repositories WHERE stack_id = ?")
            .bind(stack_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(repo)
    }

    async fn save_repository(&self, repo: UpsertGitRepository) -> Result<GitRepository> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO git_repositories (
                stack_id, remote_url, branch, auth_kind, credentials,
                webhook_secret, provider, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(stack_id) DO UPDATE SET
                remote_url = excluded.remote_url,
                branch = excluded.branch,
                auth_kind = excluded.auth_kind,
                credentials = excluded.credentials,
                webhook_secret = excluded.webhook_secret,
                provider = excluded.provider,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&repo.stack_id)
        .bind(&repo.remote_url)
        .bind(&repo.branch)
        .bind(repo.auth_kind)
        .bind(&repo.credentials)
        .bind(&repo.webhook_secret)
        .bind(repo.provider)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_repository_by_stack(&repo.stack_id)
            .await?
            .context("Repository vanished after upsert")
    }

    async fn mark_repository_synced(&self, id: i64, commit_sha: &str) -> Result<()> {
        sqlx::query("UPDATE git_repositories SET last_synced_commit = ?, last_synced_at = ? WHERE id = ?")
            .bind(commit_sha)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_repository(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let stack_id: Option<String> = sqlx::query_scalar("SELECT stack_id FROM git_repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(stack_id) = stack_id {
            sqlx::query("DELETE FROM build_configs WHERE stack_id = ?")
                .bind(&stack_id)
                .execute(&mut *tx)
                .await?;
            // Webhook events, deployments and build requests cascade
            sqlx::query("DELETE FROM git_repositories WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::sqlite_store::test_store;
    use crate::application::ports::*;
    use crate::db::models::*;

    fn upsert(stack_id: &str) -> UpsertGitRepository {
        UpsertGitRepository {
            stack_id: stack_id.to_string(),
            remote_url: "https://git.example.com/acme/web.git".to_string(),
            branch: "main".to_string(),
            auth_kind: AuthKind::None,
            credentials: None,
            webhook_secret: None,
            provider: ProviderKind::Generic,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_unique_per_stack() {
        let store = test_store().await;

        let first = store.save_repository(upsert("web")).await.unwrap();
        let mut changed = upsert("web");
        changed.branch = "develop".to_string();
        let second = store.save_repository(changed).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.branch, "develop");
    }

    #[tokio::test]
    async fn test_mark_synced() {
        let store = test_store().await;
        let repo = store.save_repository(upsert("web")).await.unwrap();

        store.mark_repository_synced(repo.id, "abc123").await.unwrap();

        let reloaded = store.get_repository(repo.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_synced_commit.as_deref(), Some("abc123"));
        assert!(reloaded.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = test_store().await;
        let repo = store.save_repository(upsert("web")).await.unwrap();
        store
            .save_build_config(UpsertBuildConfig::defaults("web"))
            .await
            .unwrap();
        let deployment = store
            .create_deployment(NewDeployment {
                stack_id: "web".into(),
                repository_id: repo.id,
                build_config_id: None,
                build_id: "b-1".into(),
                commit_sha: None,
                commit_message: None,
                commit_author: None,
                git_ref: GitRef::Branch("main".into()),
                trigger_kind: DeploymentTrigger::Manual,
                triggered_by: None,
            })
            .await
            .unwrap();
        let event = store
            .create_webhook_event(NewWebhookEvent {
                repository_id: repo.id,
                provider: ProviderKind::Generic,
                event_type: "push".into(),
                delivery_id: None,
                payload: "{}".into(),
                headers: "{}".into(),
                signature: None,
                verified: true,
            })
            .await
            .unwrap();

        store.delete_repository(repo.id).await.unwrap();

        assert!(store.get_repository(repo.id).await.unwrap().is_none());
        assert!(store.get_build_config("web").await.unwrap().is_none());
        assert!(store.get_deployment(deployment.id).await.unwrap().is_none());
        assert!(store.get_webhook_event(event.id).await.unwrap().is_none());
    }
}
