use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use corral_core::ids::SessionId;

use crate::delivery::DeliveryLayer;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Drive one WebSocket connection: attach the session's mailbox, forward
/// frames until either side goes away, then detach so frames queue again.
pub async fn run_client(socket: WebSocket, session_id: SessionId, delivery: Arc<DeliveryLayer>) {
    let Some(mut frames) = delivery.attach(&session_id) else {
        debug!(session_id = %session_id, "ws connect for unregistered session");
        return;
    };

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                // Clients never drive state over the socket; REST is the
                // write path.
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    delivery.detach(&session_id);
    info!(session_id = %session_id, "ws client disconnected");
}
