use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::events::Event;

/// Fan-out of pipeline notifications to live observers.
#[async_trait]
pub trait EventBus: Send + Sync + Clone + 'static {
    /// Emit an event to all current subscribers. Never fails; events with no
    /// subscriber are dropped.
    async fn emit(&self, event: Event);

    fn subscribe(&self) -> broadcast::Receiver<Event>;
}
