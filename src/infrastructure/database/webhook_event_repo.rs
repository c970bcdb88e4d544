use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::SqliteStore;
use crate::application::ports::WebhookEventRepository;
use crate::db::models::{NewWebhookEvent, WebhookEvent};

#[async_trait]
impl WebhookEventRepository for SqliteStore {
    async fn create_webhook_event(&self, event: NewWebhookEvent) -> Result<WebhookEvent> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (
                repository_id, provider, event_type, delivery_id, payload,
                headers, signature, verified, processed, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(event.repository_id)
        .bind(event.provider)
        .bind(&event.event_type)
        .bind(&event.delivery_id)
        .bind(&event.payload)
        .bind(&event.headers)
        .bind(&event.signature)
        .bind(event.verified)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_webhook_event(result.last_insert_rowid())
            .await?
            .context("Webhook event vanished after insert")
    }

    async fn get_webhook_event(&self, id: i64) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>("SELECT * FROM webhook_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn find_webhook_event_by_delivery(
        &self,
        repository_id: i64,
        delivery_id: &str,
    ) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM webhook_events WHERE repository_id = ? AND delivery_id = ? ORDER BY id LIMIT 1",
        )
        .bind(repository_id)
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn mark_webhook_processed(
        &self,
        id: i64,
        deployment_id: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = 1, processed_at = ?, deployment_id = ?, error = ?
            WHERE id = ? AND processed = 0
            "#,
        )
        .bind(Utc::now())
        .bind(deployment_id)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::sqlite_store::test_store;
    use crate::application::ports::*;
    use crate::db::models::*;

    #[tokio::test]
    async fn test_processed_fields_are_set_once() {
        let store = test_store().await;
        let repo = store
            .save_repository(UpsertGitRepository {
                stack_id: "web".into(),
                remote_url: "https://git.example.com/web.git".into(),
                branch: "main".into(),
                auth_kind: AuthKind::None,
                credentials: None,
                webhook_secret: None,
                provider: ProviderKind::Github,
            })
            .await
            .unwrap();

        let event = store
            .create_webhook_event(NewWebhookEvent {
                repository_id: repo.id,
                provider: ProviderKind::Github,
                event_type: "push".into(),
                delivery_id: Some("d-1".into()),
                payload: "{}".into(),
                headers: "{}".into(),
                signature: Some("sha256=00".into()),
                verified: true,
            })
            .await
            .unwrap();
        assert!(!event.processed);

        store.mark_webhook_processed(event.id, None, Some("filtered")).await.unwrap();
        store.mark_webhook_processed(event.id, None, Some("second")).await.unwrap();

        let reloaded = store.get_webhook_event(event.id).await.unwrap().unwrap();
        assert!(reloaded.processed);
        assert_eq!(reloaded.error.as_deref(), Some("filtered"));

        let found = store
            .find_webhook_event_by_delivery(repo.id, "d-1")
            .await
            .unwrap();
        assert_eq!(found.map(|e| e.id), Some(event.id));
    }
}
