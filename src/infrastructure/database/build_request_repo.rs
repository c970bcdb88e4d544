use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::SqliteStore;
use crate::application::ports::BuildRequestRepository;
use crate::db::models::{BuildRequest, BuildRequestStatus, NewBuildRequest};

#[async_trait]
impl BuildRequestRepository for SqliteStore {
    async fn create_build_request(&self, request: NewBuildRequest) -> Result<BuildRequest> {
        sqlx::query(
            r#"
            INSERT INTO build_requests (
                build_id, repository_id, stack_id, deployment_id, webhook_event_id,
                rollback_target_id, git_ref, commit_sha, status, enqueued_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.build_id)
        .bind(request.repository_id)
        .bind(&request.stack_id)
        .bind(request.deployment_id)
        .bind(request.webhook_event_id)
        .bind(request.rollback_target_id)
        .bind(request.git_ref.full())
        .bind(&request.commit_sha)
        .bind(BuildRequestStatus::Requested)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_build_request(&request.build_id)
            .await?
            .context("Build request vanished after insert")
    }

    async fn get_build_request(&self, build_id: &str) -> Result<Option<BuildRequest>> {
        let request = sqlx::query_as::<_, BuildRequest>("SELECT * FROM build_requests WHERE build_id = ?")
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(request)
    }

    async fn update_build_request_status(&self, build_id: &str, status: BuildRequestStatus) -> Result<()> {
        let now = Utc::now();
        let sql = match status {
            BuildRequestStatus::Running => "UPDATE build_requests SET status = ?, started_at = ? WHERE build_id = ?",
            BuildRequestStatus::Completed | BuildRequestStatus::Failed | BuildRequestStatus::Cancelled => {
                "UPDATE build_requests SET status = ?, finished_at = ? WHERE build_id = ?"
            }
            BuildRequestStatus::Requested | BuildRequestStatus::Queued => {
                "UPDATE build_requests SET status = ?, enqueued_at = COALESCE(enqueued_at, ?) WHERE build_id = ?"
            }
        };

        sqlx::query(sql)
            .bind(status)
            .bind(now)
            .bind(build_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_build_requests(&self, statuses: &[BuildRequestStatus]) -> Result<Vec<BuildRequest>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM build_requests WHERE status IN ({}) ORDER BY rowid ASC",
            placeholders
        );

        let mut query = sqlx::query_as::<_, BuildRequest>(&sql);
        for status in statuses {
            query = query.bind(*status);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }
}
