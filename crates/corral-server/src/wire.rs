use serde::{Deserialize, Serialize};

use corral_core::events::ExecutionEvent;
use corral_core::ids::{CorrelationId, SandboxId};

/// Envelope delivered to WebSocket clients. `data` holds the full event
/// so clients never need a second lookup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub correlation_id: CorrelationId,
    pub sandbox_id: SandboxId,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl WireFrame {
    pub fn from_event(event: &ExecutionEvent) -> Self {
        Self {
            frame_type: event.event_type().to_string(),
            correlation_id: event.correlation_id().clone(),
            sandbox_id: event.sandbox_id().clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            data: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        }
    }
}
