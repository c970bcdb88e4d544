use std::sync::Arc;
use tokio::sync::broadcast;

use crate::application::events::{BroadcastEventBus, Event, EventBus};
use crate::application::ports::{SecretVault, SourceControl};
use crate::application::services::{DeploymentService, RepositoryService, WebhookService};
use crate::build::{BuildQueue, BuildWorker};
use crate::infrastructure::database::SqliteStore;
use crate::infrastructure::logging::BoundaryLogger;

/// AppContext - service-based DI container shared by every handler
///
/// Services are generic over the store and event bus; the context pins them
/// to SQLite and the broadcast bus.
#[derive(Clone)]
pub struct AppContext {
    // Services (Application Layer)
    pub webhook_service: Arc<WebhookService<SqliteStore, BroadcastEventBus>>,
    pub deployment_service: Arc<DeploymentService<SqliteStore, BroadcastEventBus>>,
    pub repository_service: Arc<RepositoryService<SqliteStore>>,

    // Infrastructure
    pub store: Arc<SqliteStore>,
    pub event_bus: BroadcastEventBus,
    pub queue: Arc<BuildQueue<SqliteStore>>,
    pub worker: Arc<BuildWorker<SqliteStore, BroadcastEventBus>>,
    pub logger: Arc<BoundaryLogger>,
}

impl AppContext {
    /// Wire the services around an already-built queue and worker.
    pub fn new(
        store: Arc<SqliteStore>,
        event_bus: BroadcastEventBus,
        queue: Arc<BuildQueue<SqliteStore>>,
        worker: Arc<BuildWorker<SqliteStore, BroadcastEventBus>>,
        vault: Arc<dyn SecretVault>,
        source: Arc<dyn SourceControl>,
        logger: Arc<BoundaryLogger>,
    ) -> Self {
        let webhook_service = Arc::new(WebhookService::new(
            store.clone(),
            event_bus.clone(),
            queue.clone(),
            vault.clone(),
            logger.clone(),
        ));

        let deployment_service = Arc::new(DeploymentService::new(
            store.clone(),
            event_bus.clone(),
            queue.clone(),
            source.clone(),
            logger.clone(),
        ));

        let repository_service = Arc::new(RepositoryService::new(store.clone(), vault, source, logger.clone()));

        Self {
            webhook_service,
            deployment_service,
            repository_service,
            store,
            event_bus,
            queue,
            worker,
            logger,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_bus.subscribe()
    }
}
