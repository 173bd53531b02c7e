use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_core::ids::{InstanceId, SandboxId, SessionId};

use crate::gateway::{BroadcastGateway, GatewayMessage, Topic};
use crate::wire::WireFrame;

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Most frames a detached mailbox will hold; the oldest is dropped
    /// when a new frame arrives at capacity.
    pub queue_capacity: usize,
    /// Queued frames older than this are discarded at flush time.
    pub message_ttl: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            message_ttl: Duration::from_secs(60),
        }
    }
}

struct QueuedFrame {
    frame: WireFrame,
    queued_at: Instant,
}

enum MailboxState {
    Attached(mpsc::UnboundedSender<WireFrame>),
    Detached(VecDeque<QueuedFrame>),
}

struct Mailbox {
    sandbox_id: SandboxId,
    state: MailboxState,
}

/// Routes wire frames to per-session mailboxes. A session with a live
/// WebSocket is attached and gets frames immediately; a detached session
/// accumulates a bounded queue that is flushed, minus expired frames, on
/// the next attach. All frames travel through the gateway, so sessions
/// attached to other instances receive them too.
pub struct DeliveryLayer {
    instance_id: InstanceId,
    gateway: Arc<dyn BroadcastGateway>,
    mailboxes: DashMap<SessionId, Mailbox>,
    config: DeliveryConfig,
}

impl DeliveryLayer {
    pub fn new(gateway: Arc<dyn BroadcastGateway>, config: DeliveryConfig) -> Self {
        Self {
            instance_id: InstanceId::new(),
            gateway,
            mailboxes: DashMap::new(),
            config,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Create a detached mailbox for a session. Idempotent.
    pub fn register_session(&self, session_id: &SessionId, sandbox_id: &SandboxId) {
        self.mailboxes
            .entry(session_id.clone())
            .or_insert_with(|| Mailbox {
                sandbox_id: sandbox_id.clone(),
                state: MailboxState::Detached(VecDeque::new()),
            });
    }

    pub fn remove_session(&self, session_id: &SessionId) {
        self.mailboxes.remove(session_id);
    }

    /// Attach a client: flush still-fresh queued frames into a channel
    /// and deliver everything after directly. Returns None for sessions
    /// never registered here.
    pub fn attach(&self, session_id: &SessionId) -> Option<mpsc::UnboundedReceiver<WireFrame>> {
        let mut mailbox = self.mailboxes.get_mut(session_id)?;
        let (tx, rx) = mpsc::unbounded_channel();

        if let MailboxState::Detached(queue) = &mut mailbox.state {
            let ttl = self.config.message_ttl;
            let mut expired = 0usize;
            for queued in queue.drain(..) {
                if queued.queued_at.elapsed() > ttl {
                    expired += 1;
                    continue;
                }
                let _ = tx.send(queued.frame);
            }
            if expired > 0 {
                debug!(session_id = %session_id, expired, "expired frames discarded at flush");
            }
        }

        mailbox.state = MailboxState::Attached(tx);
        info!(session_id = %session_id, "session attached");
        Some(rx)
    }

    /// Detach a client, reverting the mailbox to queueing.
    pub fn detach(&self, session_id: &SessionId) {
        if let Some(mut mailbox) = self.mailboxes.get_mut(session_id) {
            mailbox.state = MailboxState::Detached(VecDeque::new());
            info!(session_id = %session_id, "session detached");
        }
    }

    /// Publish a frame for every session of a sandbox, on this instance
    /// and any other sharing the gateway.
    pub fn broadcast_to_sandbox(&self, sandbox_id: &SandboxId, frame: WireFrame) {
        self.gateway.publish(&Topic::Sandbox(sandbox_id.clone()), frame);
    }

    /// Publish a frame addressed to one session. It travels through the
    /// gateway, so the instance holding the session's mailbox delivers
    /// it no matter where the call originated.
    pub fn send_to_session(&self, session_id: &SessionId, frame: WireFrame) {
        self.gateway.publish(&Topic::Session(session_id.clone()), frame);
    }

    /// Frames currently queued for a detached session.
    pub fn queued_count(&self, session_id: &SessionId) -> usize {
        match self.mailboxes.get(session_id) {
            Some(mailbox) => match &mailbox.state {
                MailboxState::Detached(queue) => queue.len(),
                MailboxState::Attached(_) => 0,
            },
            None => 0,
        }
    }

    pub fn session_count(&self) -> usize {
        self.mailboxes.len()
    }

    fn handle_message(&self, message: GatewayMessage) {
        match Topic::parse(&message.topic) {
            Some(Topic::Sandbox(sandbox_id)) => {
                let capacity = self.config.queue_capacity;
                for mut entry in self.mailboxes.iter_mut() {
                    if entry.value().sandbox_id == sandbox_id {
                        deliver(entry.value_mut(), message.frame.clone(), capacity);
                    }
                }
            }
            Some(Topic::Session(session_id)) => {
                if let Some(mut mailbox) = self.mailboxes.get_mut(&session_id) {
                    let capacity = self.config.queue_capacity;
                    deliver(&mut mailbox, message.frame, capacity);
                }
            }
            None => warn!(topic = %message.topic, "unroutable gateway message"),
        }
    }

    /// Spawn the task that drains the gateway subscription into local
    /// mailboxes. One pump per instance.
    pub fn start_pump(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let layer = Arc::clone(self);
        let mut rx = layer.gateway.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(instance_id = %layer.instance_id, "delivery pump stopping");
                        break;
                    }
                    received = rx.recv() => match received {
                        Ok(message) => layer.handle_message(message),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "delivery pump lagged behind gateway");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

fn deliver(mailbox: &mut Mailbox, frame: WireFrame, capacity: usize) {
    match &mut mailbox.state {
        MailboxState::Attached(tx) => {
            if tx.send(frame).is_err() {
                // Receiver went away without a clean detach
                mailbox.state = MailboxState::Detached(VecDeque::new());
            }
        }
        MailboxState::Detached(queue) => {
            if queue.len() >= capacity {
                queue.pop_front();
            }
            queue.push_back(QueuedFrame {
                frame,
                queued_at: Instant::now(),
            });
        }
    }
}
