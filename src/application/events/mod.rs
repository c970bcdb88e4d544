pub mod event_bus;
pub mod broadcast_event_bus;

pub use crate::events::Event;
pub use event_bus::EventBus;
pub use broadcast_event_bus::BroadcastEventBus;
