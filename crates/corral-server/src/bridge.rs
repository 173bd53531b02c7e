use std::sync::Arc;

use async_trait::async_trait;

use corral_core::events::ExecutionEvent;
use corral_engine::bus::EventHandler;
use corral_engine::{EngineError, EventBus};

use crate::delivery::DeliveryLayer;
use crate::wire::WireFrame;

/// Bus subscriber that turns execution events into wire frames and fans
/// them out to every session of the event's sandbox.
pub struct EventBridge {
    delivery: Arc<DeliveryLayer>,
}

impl EventBridge {
    pub const SUBSCRIBER_NAME: &'static str = "realtime";

    pub fn new(delivery: Arc<DeliveryLayer>) -> Self {
        Self { delivery }
    }

    /// Subscribe the bridge to all event types on the bus.
    pub fn install(delivery: Arc<DeliveryLayer>, bus: &EventBus) {
        bus.subscribe(Self::SUBSCRIBER_NAME, None, Arc::new(Self::new(delivery)));
    }
}

#[async_trait]
impl EventHandler for EventBridge {
    async fn handle(&self, event: ExecutionEvent) -> Result<(), EngineError> {
        let frame = WireFrame::from_event(&event);
        self.delivery
            .broadcast_to_sandbox(event.sandbox_id(), frame);
        Ok(())
    }
}
