use axum::http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::application::events::{Event, EventBus};
use crate::application::ports::{open_string, EntityStore, SecretVault};
use crate::build::BuildQueue;
use crate::db::models::{
    BuildConfig, DeploymentTrigger, GitRepository, NewDeployment, NewWebhookEvent, ProviderKind,
};
use crate::error::WebhookError;
use crate::infrastructure::logging::{BoundaryLogger, Timer};
use crate::providers::{adapter_for, ref_matches, NormalizedEvent};

/// Headers whose values are never stored.
const MASKED_HEADERS: [&str; 4] = ["authorization", "x-gitlab-token", "x-webhook-token", "cookie"];

/// What happened to an accepted webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Queued {
        build_id: String,
        deployment_id: i64,
        webhook_event_id: i64,
    },
    Ignored {
        reason: String,
        webhook_event_id: i64,
    },
}

/// WebhookService - webhook ingestion
///
/// Resolves the repository, verifies and normalizes the event with the
/// provider adapter, records it, and enqueues a build when it qualifies.
pub struct WebhookService<S: EntityStore, EB: EventBus> {
    store: Arc<S>,
    event_bus: EB,
    queue: Arc<BuildQueue<S>>,
    vault: Arc<dyn SecretVault>,
    logger: Arc<BoundaryLogger>,
    // Duplicate checks and enqueue happen as one step
    admission: Mutex<()>,
}

impl<S: EntityStore, EB: EventBus> WebhookService<S, EB> {
    pub fn new(
        store: Arc<S>,
        event_bus: EB,
        queue: Arc<BuildQueue<S>>,
        vault: Arc<dyn SecretVault>,
        logger: Arc<BoundaryLogger>,
    ) -> Self {
        Self {
            store,
            event_bus,
            queue,
            vault,
            logger,
            admission: Mutex::new(()),
        }
    }

    pub async fn receive(
        &self,
        trace_id: &str,
        provider: &str,
        repository_id: i64,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<WebhookOutcome, WebhookError> {
        let timer = Timer::start();
        self.logger
            .service_entry(trace_id, "API", "WebhookService", "receive", &(provider, repository_id));

        let result = self
            .receive_inner(trace_id, provider, repository_id, payload, headers)
            .await;
        match &result {
            Ok(_) => self
                .logger
                .service_exit(trace_id, "API", "WebhookService", "receive", timer.elapsed_ms()),
            Err(e) => self
                .logger
                .service_error(trace_id, "API", "WebhookService", "receive", e),
        }
        result
    }

    async fn receive_inner(
        &self,
        trace_id: &str,
        provider: &str,
        repository_id: i64,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<WebhookOutcome, WebhookError> {
        let kind: ProviderKind = provider.parse().map_err(WebhookError::BadRequest)?;

        let repo = self
            .store
            .get_repository(repository_id)
            .await?
            .ok_or(WebhookError::NotFound(repository_id))?;

        if repo.provider != kind {
            return Err(WebhookError::ProviderMismatch {
                configured: repo.provider.to_string(),
                received: kind.to_string(),
            });
        }

        let secret = match repo.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(sealed) => Some(open_string(self.vault.as_ref(), sealed)?),
            None => None,
        };

        let event = match adapter_for(kind).verify_and_parse(payload, headers, secret.as_deref()) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "[{}] Rejected {} webhook for repository {}: {}",
                    trace_id, kind, repository_id, e
                );
                return Err(e.into());
            }
        };

        let _admission = self.admission.lock().await;

        // Looked up before this delivery is recorded
        let duplicate_delivery = match event.delivery_id.as_deref() {
            Some(delivery_id) => self
                .store
                .find_webhook_event_by_delivery(repo.id, delivery_id)
                .await?
                .is_some(),
            None => false,
        };

        let recorded = self
            .store
            .create_webhook_event(NewWebhookEvent {
                repository_id: repo.id,
                provider: kind,
                event_type: event.event_type.clone(),
                delivery_id: event.delivery_id.clone(),
                payload: String::from_utf8_lossy(payload).into_owned(),
                headers: masked_headers(headers),
                signature: event.signature.clone(),
                verified: event.verified,
            })
            .await?;

        self.logger.event_emit(trace_id, "WebhookService", "WebhookReceived");
        self.event_bus
            .emit(Event::webhook_received(
                repo.id,
                recorded.id,
                kind.to_string(),
                event.event_type.clone(),
            ))
            .await;

        let config = self.store.get_build_config(&repo.stack_id).await?;
        let skip = if duplicate_delivery {
            Some("duplicate delivery".to_string())
        } else {
            self.skip_reason(&repo, config.as_ref(), &event).await?
        };

        if let Some(reason) = skip {
            info!(
                "[{}] Webhook {} for stack {} accepted without build: {}",
                trace_id, recorded.id, repo.stack_id, reason
            );
            self.store
                .mark_webhook_processed(recorded.id, None, Some(&reason))
                .await?;
            return Ok(WebhookOutcome::Ignored {
                reason,
                webhook_event_id: recorded.id,
            });
        }

        let git_ref = event
            .git_ref
            .clone()
            .ok_or_else(|| WebhookError::BadRequest("event has no ref".into()))?;
        let (request, deployment) = self
            .queue
            .submit(
                NewDeployment {
                    stack_id: repo.stack_id.clone(),
                    repository_id: repo.id,
                    build_config_id: config.as_ref().map(|c| c.id),
                    build_id: uuid::Uuid::new_v4().to_string(),
                    commit_sha: event.commit_sha.clone(),
                    commit_message: event.commit_message.clone(),
                    commit_author: event.author.clone(),
                    git_ref,
                    trigger_kind: DeploymentTrigger::Webhook,
                    triggered_by: event.author.clone(),
                },
                Some(recorded.id),
                None,
            )
            .await?;
        self.store
            .mark_webhook_processed(recorded.id, Some(deployment.id), None)
            .await?;

        self.logger.event_emit(trace_id, "WebhookService", "BuildQueued");
        self.event_bus
            .emit(Event::build_queued(repo.id, &request.build_id, deployment.id))
            .await;

        info!(
            "[{}] Webhook {} queued build {} for stack {}",
            trace_id, recorded.id, request.build_id, repo.stack_id
        );
        Ok(WebhookOutcome::Queued {
            build_id: request.build_id,
            deployment_id: deployment.id,
            webhook_event_id: recorded.id,
        })
    }

    /// Why a verified event does not lead to a build, if it doesn't.
    async fn skip_reason(
        &self,
        repo: &GitRepository,
        config: Option<&BuildConfig>,
        event: &NormalizedEvent,
    ) -> anyhow::Result<Option<String>> {
        let git_ref = match event.build_ref() {
            Ok(git_ref) => git_ref,
            Err(reason) => return Ok(Some(reason)),
        };
        let Some(config) = config else {
            return Ok(Some("stack has no build configuration".into()));
        };
        if !config.auto_deploy {
            return Ok(Some("auto-deploy is disabled".into()));
        }
        if !ref_matches(git_ref, &repo.branch, &config.branch_patterns) {
            return Ok(Some(format!("{} does not match tracked branch {}", git_ref, repo.branch)));
        }

        if let Some(sha) = event.commit_sha.as_deref() {
            let latest = self
                .store
                .latest_successful_deployment(&repo.stack_id, None)
                .await?;
            if latest.and_then(|d| d.commit_sha).as_deref() == Some(sha) {
                return Ok(Some(format!("commit {} is already deployed", sha)));
            }
            if let Some(in_flight) = self.store.find_in_flight_deployment(&repo.stack_id, sha).await? {
                return Ok(Some(format!(
                    "commit {} is already being deployed (deployment {})",
                    sha, in_flight.id
                )));
            }
        }

        Ok(None)
    }
}

/// Header map as JSON text with credential-bearing values masked.
fn masked_headers(headers: &HeaderMap) -> String {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            let value = if MASKED_HEADERS.contains(&name.as_str()) {
                "***".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.as_str().to_string(), serde_json::Value::String(value))
        })
        .collect();
    serde_json::Value::Object(map).to_string()
}
