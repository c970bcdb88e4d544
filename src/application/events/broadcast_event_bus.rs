use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::event_bus::EventBus;
use crate::events::Event;
use crate::infrastructure::logging::BoundaryLogger;

/// `tokio::sync::broadcast` backed EventBus
#[derive(Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
    logger: Arc<BoundaryLogger>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize, logger: Arc<BoundaryLogger>) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx, logger }
    }

    /// 1000 buffered events; slow websocket clients lag rather than block the worker.
    pub fn new_default(logger: Arc<BoundaryLogger>) -> Self {
        Self::new(1000, logger)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn emit(&self, event: Event) {
        // Log lines are too chatty for the boundary log
        if !matches!(event, Event::Log { .. }) {
            self.logger.event_emit("pipeline", "EventBus", event.kind());
        }

        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DeploymentStatus;

    #[tokio::test]
    async fn test_event_bus_emit_and_subscribe() {
        let bus = BroadcastEventBus::new_default(Arc::new(BoundaryLogger::new()));
        let mut rx = bus.subscribe();

        bus.emit(Event::deployment_status(1, "b-1", 4, DeploymentStatus::Building))
            .await;

        match rx.recv().await.unwrap() {
            Event::DeploymentStatus {
                deployment_id,
                status,
                ..
            } => {
                assert_eq!(deployment_id, Some(4));
                assert_eq!(status, DeploymentStatus::Building);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = BroadcastEventBus::new_default(Arc::new(BoundaryLogger::new()));
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(Event::build_completed(2, "b-2", 2)).await;

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = BroadcastEventBus::new_default(Arc::new(BoundaryLogger::new()));
        bus.emit(Event::build_queued(1, "b-3", 1)).await;
    }
}
