use tokio::sync::broadcast;

use corral_core::ids::{SandboxId, SessionId};

use crate::wire::WireFrame;

/// Fan-out topic. Sandbox topics carry execution events for every
/// session of a sandbox; session topics address one session, wherever
/// its mailbox lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topic {
    Sandbox(SandboxId),
    Session(SessionId),
}

impl Topic {
    pub fn as_string(&self) -> String {
        match self {
            Self::Sandbox(id) => format!("sandbox:{id}"),
            Self::Session(id) => format!("session:{id}"),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, id) = raw.split_once(':')?;
        match kind {
            "sandbox" => Some(Self::Sandbox(SandboxId::from_raw(id))),
            "session" => Some(Self::Session(SessionId::from_raw(id))),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayMessage {
    pub topic: String,
    pub frame: WireFrame,
}

/// Cross-instance fan-out seam. Every server instance publishes frames
/// here and pumps its own subscription into local session mailboxes, so
/// a frame published on one instance reaches sessions attached anywhere.
pub trait BroadcastGateway: Send + Sync {
    /// Returns the number of active subscribers the message reached.
    fn publish(&self, topic: &Topic, frame: WireFrame) -> usize;

    fn subscribe(&self) -> broadcast::Receiver<GatewayMessage>;
}

/// Single-process gateway over a tokio broadcast channel. Stands in for
/// an external pub/sub system when running one instance, and lets tests
/// wire several delivery layers to one shared bus.
pub struct LocalGateway {
    tx: broadcast::Sender<GatewayMessage>,
}

impl LocalGateway {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalGateway {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl BroadcastGateway for LocalGateway {
    fn publish(&self, topic: &Topic, frame: WireFrame) -> usize {
        self.tx
            .send(GatewayMessage {
                topic: topic.as_string(),
                frame,
            })
            .unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayMessage> {
        self.tx.subscribe()
    }
}
