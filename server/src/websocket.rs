//! Broadcast hub fanning `{type, payload}` events out to WebSocket clients.
//!
//! A single task owns the subscriber set. Every change to it arrives as a command
//! on one channel, so changes apply in submission order. A
//! subscriber whose queue is full is dropped instead of slowing the publisher.

use alloc::sync::Arc;
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::collections::HashMap;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval, timeout},
};
use tracing::{Instrument as _, debug, info, warn};

use crate::app::AppState;

pub const BOOK_CREATED: &str = "book_created";
pub const BOOK_UPDATED: &str = "book_updated";
pub const BOOK_DELETED: &str = "book_deleted";
pub const WISHLIST_CREATED: &str = "wishlist_created";
pub const WISHLIST_UPDATED: &str = "wishlist_updated";
pub const WISHLIST_DELETED: &str = "wishlist_deleted";
pub const QUOTE_CREATED: &str = "quote_created";
pub const QUOTE_DELETED: &str = "quote_deleted";
pub const EXTERNAL_STATUS: &str = "external_status";
pub const EXTERNAL_CONFIG_SAVED: &str = "external_config_saved";

/// Outbound queue length per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 256;

const PING_INTERVAL: Duration = Duration::from_secs(54);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire format of every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

pub type SubscriberId = u64;

enum Command {
    Register {
        id: SubscriberId,
        tx: mpsc::Sender<Arc<str>>,
    },
    Unregister(SubscriberId),
    Publish(Arc<str>),
    Count(oneshot::Sender<usize>),
}

/// Receiving end handed to one client.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Arc<str>>,
}

/// Cloneable handle to the coordinator task.
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    /// Spawns the coordinator. It runs until every handle is dropped.
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hub(rx).instrument(tracing::info_span!("ws.hub")));
        Self {
            commands,
            next_id: Arc::default(),
        }
    }

    /// Adds a subscriber. Never blocks.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.send(Command::Register { id, tx });
        Subscription { id, rx }
    }

    /// Removes a subscriber and drops its queue. Unknown ids are ignored.
    pub fn unregister(&self, id: SubscriberId) {
        self.send(Command::Unregister(id));
    }

    /// Serializes and enqueues an event for every subscriber. Never fails.
    pub fn publish(&self, kind: &str, payload: impl Serialize) {
        let message = serde_json::to_value(payload).and_then(|payload| {
            serde_json::to_string(&WsMessage {
                kind: kind.to_owned(),
                payload,
            })
        });
        match message {
            Ok(json) => self.send(Command::Publish(json.into())),
            Err(e) => warn!(kind, "Dropping event that failed to serialize: {e}"),
        }
    }

    /// Current number of subscribers, after all previously submitted commands.
    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Count(tx));
        rx.await.unwrap_or(0)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Hub coordinator is gone, command dropped");
        }
    }
}

async fn run_hub(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<str>>> = HashMap::new();
    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { id, tx } => {
                subscribers.insert(id, tx);
                debug!(id, total = subscribers.len(), "Subscriber registered");
            }
            Command::Unregister(id) => {
                if subscribers.remove(&id).is_some() {
                    debug!(id, total = subscribers.len(), "Subscriber unregistered");
                }
            }
            Command::Publish(message) => {
                subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(id, "Subscriber too slow, dropping it");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(id, "Subscriber gone");
                        false
                    }
                });
            }
            Command::Count(reply) => drop(reply.send(subscribers.len())),
        }
    }
    debug!("Hub stopped");
}

/// Upgrades `/ws` and streams hub events, starting with the current external status.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.orchestrator.status();
    let subscription = state.hub.subscribe();
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| {
        let id = subscription.id;
        async move {
            let initial = serde_json::to_string(&WsMessage {
                kind: EXTERNAL_STATUS.to_owned(),
                payload: serde_json::to_value(&snapshot).unwrap_or(Value::Null),
            });
            match initial {
                Ok(initial) => serve_socket(socket, subscription, initial).await,
                Err(e) => warn!("Failed to serialize initial status: {e}"),
            }
            hub.unregister(id);
        }
        .instrument(tracing::info_span!("ws.subscriber", id))
    })
}

async fn serve_socket(socket: WebSocket, subscription: Subscription, initial: String) {
    let (mut sink, mut stream) = socket.split();
    let Subscription { mut rx, .. } = subscription;

    let writer = async move {
        let mut ping = interval(PING_INTERVAL);
        ping.tick().await;
        let mut next = Some(initial);
        loop {
            let frame = if let Some(text) = next.take() {
                Message::Text(text.into())
            } else {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => Message::Text(msg.as_ref().into()),
                        None => break,
                    },
                    _ = ping.tick() => Message::Ping(Vec::new().into()),
                }
            };
            match timeout(WRITE_TIMEOUT, sink.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("WebSocket write failed: {e}");
                    break;
                }
                Err(_elapsed) => {
                    warn!("WebSocket write timed out");
                    break;
                }
            }
        }
        drop(sink.close().await);
    };

    let reader = async move {
        loop {
            match timeout(READ_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(Message::Close(_)) | Err(_)) | None) => break,
                // any frame, pongs included, proves the client is alive
                Ok(Some(Ok(_))) => {}
                Err(_elapsed) => {
                    info!("WebSocket client silent for too long");
                    break;
                }
            }
        }
    };

    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
    debug!("WebSocket connection closed");
}
