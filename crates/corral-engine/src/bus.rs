use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use corral_core::events::ExecutionEvent;

use crate::error::EngineError;

/// A named consumer of execution events. Handlers run on their own drain
/// task; a slow or failing handler never blocks publishers or its peers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ExecutionEvent) -> Result<(), EngineError>;
}

struct Subscription {
    filter: Option<HashSet<String>>,
    tx: mpsc::UnboundedSender<ExecutionEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    fn wants(&self, event_type: &str) -> bool {
        match &self.filter {
            Some(types) => types.contains(event_type),
            None => true,
        }
    }
}

/// In-process fan-out for execution events. Each subscriber gets its own
/// unbounded queue drained in publish order, so one subscriber observes
/// events in exactly the order they were published.
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<String, Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler under a unique name. `event_types` of None
    /// means all events. Re-subscribing a name replaces (and stops) the
    /// previous subscription.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        event_types: Option<&[&str]>,
        handler: Arc<dyn EventHandler>,
    ) {
        let name = name.into();
        let filter =
            event_types.map(|types| types.iter().map(|t| t.to_string()).collect::<HashSet<_>>());

        let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionEvent>();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handler.handle(event).await {
                    warn!(subscriber = %task_name, error = %e, "event handler failed");
                }
            }
        });

        if let Some(old) = self.subscribers.insert(name, Subscription { filter, tx, task }) {
            old.task.abort();
        }
    }

    /// Remove a subscriber and stop its drain task.
    pub fn unsubscribe(&self, name: &str) -> bool {
        match self.subscribers.remove(name) {
            Some((_, sub)) => {
                sub.task.abort();
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every matching subscriber's queue. Returns how
    /// many subscribers the event was queued for.
    pub fn publish(&self, event: &ExecutionEvent) -> usize {
        let event_type = event.event_type();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for entry in self.subscribers.iter() {
            if !entry.value().wants(event_type) {
                continue;
            }
            if entry.value().tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }

        for name in dead {
            debug!(subscriber = %name, "dropping dead subscriber");
            self.subscribers.remove(&name);
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
