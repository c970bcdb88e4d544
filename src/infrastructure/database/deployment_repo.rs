use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::SqliteStore;
use crate::application::ports::DeploymentRepository;
use crate::db::models::{Deployment, DeploymentStatus, LogStream, NewDeployment};

#[async_trait]
impl DeploymentRepository for SqliteStore {
    async fn create_deployment(&self, deployment: NewDeployment) -> Result<Deployment> {
        let result = sqlx::query(
            r#"
            INSERT INTO deployments (
                stack_id, repository_id, build_config_id, build_id,
                commit_sha, commit_message, commit_author, git_ref,
                status, trigger_kind, triggered_by, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&deployment.stack_id)
        .bind(deployment.repository_id)
        .bind(deployment.build_config_id)
        .bind(&deployment.build_id)
        .bind(&deployment.commit_sha)
        .bind(&deployment.commit_message)
        .bind(&deployment.commit_author)
        .bind(deployment.git_ref.full())
        .bind(DeploymentStatus::Pending)
        .bind(deployment.trigger_kind)
        .bind(&deployment.triggered_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_deployment(result.last_insert_rowid())
            .await?
            .context("Deployment vanished after insert")
    }

    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deployment)
    }

    async fn save_deployment(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deployments SET
                commit_sha = ?,
                commit_message = ?,
                commit_author = ?,
                status = ?,
                previous_deployment_id = ?,
                error = ?,
                image_tag = ?,
                compose_snapshot = ?,
                env_snapshot = ?,
                started_at = ?,
                completed_at = ?,
                duration_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(&deployment.commit_sha)
        .bind(&deployment.commit_message)
        .bind(&deployment.commit_author)
        .bind(deployment.status)
        .bind(deployment.previous_deployment_id)
        .bind(&deployment.error)
        .bind(&deployment.image_tag)
        .bind(&deployment.compose_snapshot)
        .bind(&deployment.env_snapshot)
        .bind(deployment.started_at)
        .bind(deployment.completed_at)
        .bind(deployment.duration_ms)
        .bind(deployment.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_deployment_log(&self, id: i64, stream: LogStream, text: &str) -> Result<()> {
        let sql = match stream {
            LogStream::Build => "UPDATE deployments SET build_log = build_log || ? WHERE id = ?",
            LogStream::Deploy => "UPDATE deployments SET deployment_log = deployment_log || ? WHERE id = ?",
        };

        sqlx::query(sql).bind(text).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_deployments(&self, stack_id: &str, limit: i64) -> Result<Vec<Deployment>> {
        let deployments = sqlx::query_as::<_, Deployment>(
            "SELECT * FROM deployments WHERE stack_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(stack_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(deployments)
    }

    async fn latest_successful_deployment(
        &self,
        stack_id: &str,
        excluding: Option<i64>,
    ) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>(
            r#"
            SELECT * FROM deployments
            WHERE stack_id = ? AND status = ? AND id != ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(stack_id)
        .bind(DeploymentStatus::Successful)
        .bind(excluding.unwrap_or(-1))
        .fetch_optional(&self.pool)
        .await?;
        Ok(deployment)
    }

    async fn find_in_flight_deployment(&self, stack_id: &str, commit_sha: &str) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>(
            r#"
            SELECT * FROM deployments
            WHERE stack_id = ? AND commit_sha = ? AND status IN (?, ?, ?)
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(stack_id)
        .bind(commit_sha)
        .bind(DeploymentStatus::Pending)
        .bind(DeploymentStatus::Building)
        .bind(DeploymentStatus::Deploying)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::super::sqlite_store::test_store;
    use super::super::SqliteStore;
    use crate::application::ports::*;
    use crate::db::models::*;

    async fn seed(store: &SqliteStore) -> GitRepository {
        store
            .save_repository(UpsertGitRepository {
                stack_id: "web".into(),
                remote_url: "https://git.example.com/web.git".into(),
                branch: "main".into(),
                auth_kind: AuthKind::None,
                credentials: None,
                webhook_secret: None,
                provider: ProviderKind::Generic,
            })
            .await
            .unwrap()
    }

    fn new_deployment(repo: &GitRepository, build_id: &str, sha: &str) -> NewDeployment {
        NewDeployment {
            stack_id: repo.stack_id.clone(),
            repository_id: repo.id,
            build_config_id: None,
            build_id: build_id.into(),
            commit_sha: Some(sha.into()),
            commit_message: Some("change".into()),
            commit_author: Some("dev".into()),
            git_ref: GitRef::Branch("main".into()),
            trigger_kind: DeploymentTrigger::Webhook,
            triggered_by: None,
        }
    }

    #[tokio::test]
    async fn test_created_deployment_is_pending() {
        let store = test_store().await;
        let repo = seed(&store).await;

        let deployment = store.create_deployment(new_deployment(&repo, "b-1", "aaa")).await.unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Pending);
        assert_eq!(deployment.git_ref, "refs/heads/main");
        assert_eq!(deployment.build_log, "");
        assert!(deployment.started_at.is_none());
    }

    #[tokio::test]
    async fn test_logs_are_append_only() {
        let store = test_store().await;
        let repo = seed(&store).await;
        let deployment = store.create_deployment(new_deployment(&repo, "b-1", "aaa")).await.unwrap();

        store.append_deployment_log(deployment.id, LogStream::Build, "step 1\n").await.unwrap();
        store.append_deployment_log(deployment.id, LogStream::Build, "step 2\n").await.unwrap();
        store.append_deployment_log(deployment.id, LogStream::Deploy, "up\n").await.unwrap();

        // Saving other fields must not clobber the log columns
        let mut reloaded = store.get_deployment(deployment.id).await.unwrap().unwrap();
        reloaded.status = DeploymentStatus::Building;
        reloaded.build_log.clear();
        store.save_deployment(&reloaded).await.unwrap();

        let reloaded = store.get_deployment(deployment.id).await.unwrap().unwrap();
        assert_eq!(reloaded.build_log, "step 1\nstep 2\n");
        assert_eq!(reloaded.deployment_log, "up\n");
        assert_eq!(reloaded.status, DeploymentStatus::Building);
    }

    #[tokio::test]
    async fn test_latest_successful_and_in_flight() {
        let store = test_store().await;
        let repo = seed(&store).await;

        let mut first = store.create_deployment(new_deployment(&repo, "b-1", "aaa")).await.unwrap();
        first.finish(DeploymentStatus::Successful);
        store.save_deployment(&first).await.unwrap();

        let mut second = store.create_deployment(new_deployment(&repo, "b-2", "bbb")).await.unwrap();
        second.finish(DeploymentStatus::Successful);
        store.save_deployment(&second).await.unwrap();

        let third = store.create_deployment(new_deployment(&repo, "b-3", "ccc")).await.unwrap();

        let latest = store.latest_successful_deployment("web", None).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        let before = store
            .latest_successful_deployment("web", Some(second.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.id, first.id);

        let in_flight = store.find_in_flight_deployment("web", "ccc").await.unwrap();
        assert_eq!(in_flight.map(|d| d.id), Some(third.id));
        assert!(store.find_in_flight_deployment("web", "aaa").await.unwrap().is_none());

        let listed = store.list_deployments("web", 2).await.unwrap();
        assert_eq!(listed.iter().map(|d| d.id).collect::<Vec<_>>(), vec![third.id, second.id]);
    }
}
