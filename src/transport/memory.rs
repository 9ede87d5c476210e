//! In-process backend and transport
//!
//! `MemoryBackend` behaves like the real event source closely enough to
//! drive the whole core without a network: it acknowledges (or rejects, or
//! ignores) subscribe requests, tracks which subscriptions are live on the
//! current link, streams change events and can drop the link on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{CloseReason, Transport, TransportLink, TransportSignal, LINK_CHANNEL_CAPACITY};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerMessage};

/// How the backend answers subscribe/unsubscribe requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Immediate,
    Delayed(Duration),
    /// Never answer (exercise request timeouts)
    Silent,
}

#[derive(Debug)]
struct BackendState {
    ack_mode: AckMode,
    refuse: usize,
    rejections: HashMap<String, (String, String)>,
    connects: usize,
    generation: u64,
    requests: Vec<ClientMessage>,
    active: BTreeMap<String, String>,
    link: Option<mpsc::Sender<TransportSignal>>,
    seq: HashMap<String, u64>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Immediate,
            refuse: 0,
            rejections: HashMap::new(),
            connects: 0,
            generation: 0,
            requests: Vec::new(),
            active: BTreeMap::new(),
            link: None,
            seq: HashMap::new(),
        }
    }
}

type Shared = Arc<Mutex<BackendState>>;

/// Client side: hand this to the connection manager
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Shared,
}

/// Server side: drive and inspect the fake backend
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Shared,
}

impl MemoryBackend {
    /// Create a connected transport/backend pair
    pub fn new() -> (MemoryTransport, MemoryBackend) {
        let state: Shared = Arc::new(Mutex::new(BackendState::default()));
        (
            MemoryTransport {
                state: state.clone(),
            },
            MemoryBackend { state },
        )
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        self.state.lock().ack_mode = mode;
    }

    /// Refuse the next `n` connect attempts
    pub fn refuse_connections(&self, n: usize) {
        self.state.lock().refuse = n;
    }

    /// Reject every subscribe request for `collection`
    pub fn reject(&self, collection: &str, code: &str, message: &str) {
        self.state.lock().rejections.insert(
            collection.to_string(),
            (code.to_string(), message.to_string()),
        );
    }

    pub fn clear_rejections(&self) {
        self.state.lock().rejections.clear();
    }

    /// Connect attempts seen so far, refused ones included
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// Every subscribe request received, across all links
    pub fn subscribe_requests(&self) -> Vec<ClientMessage> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|m| matches!(m, ClientMessage::Subscribe { .. }))
            .cloned()
            .collect()
    }

    /// Every client message received, in arrival order
    pub fn requests(&self) -> Vec<ClientMessage> {
        self.state.lock().requests.clone()
    }

    /// Uids of every unsubscribe request received
    pub fn unsubscribe_requests(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Unsubscribe { uid } => Some(uid.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of subscriptions live on the current link
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Collections with a live subscription on the current link, one per subscription
    pub fn active_collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = self.state.lock().active.values().cloned().collect();
        collections.sort();
        collections
    }

    /// Send a raw message on the current link. Returns false when not connected.
    pub async fn send(&self, message: ServerMessage) -> bool {
        let link = self.state.lock().link.clone();
        match link {
            Some(tx) => tx.send(TransportSignal::Message(message)).await.is_ok(),
            None => false,
        }
    }

    /// Emit a change with the next backend sequence number for `collection`
    pub async fn push_change(&self, collection: &str, action: &str, data: Value) -> bool {
        let seq = {
            let mut state = self.state.lock();
            let next = state.seq.entry(collection.to_string()).or_insert(0);
            *next += 1;
            *next
        };
        self.push_change_with_seq(collection, action, data, Some(seq))
            .await
    }

    /// Emit a change with an explicit (possibly missing) sequence number
    pub async fn push_change_with_seq(
        &self,
        collection: &str,
        action: &str,
        data: Value,
        seq: Option<u64>,
    ) -> bool {
        self.send(ServerMessage::Change {
            collection: collection.to_string(),
            action: action.to_string(),
            data,
            seq,
        })
        .await
    }

    /// Acknowledge a subscribe request by hand (useful with `AckMode::Silent`)
    pub async fn acknowledge(&self, uid: &str) -> bool {
        let collection = self.state.lock().requests.iter().find_map(|m| match m {
            ClientMessage::Subscribe {
                uid: u, collection, ..
            } if u == uid => Some(collection.clone()),
            _ => None,
        });
        if let Some(collection) = collection {
            self.state.lock().active.insert(uid.to_string(), collection);
        }
        self.send(ServerMessage::Subscribed {
            uid: uid.to_string(),
        })
        .await
    }

    /// Close the current link as the server would
    pub async fn drop_connection(&self, reason: CloseReason) {
        let link = {
            let mut state = self.state.lock();
            state.active.clear();
            state.link.take()
        };
        if let Some(tx) = link {
            let _ = tx.send(TransportSignal::Closed(reason)).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> SyncResult<TransportLink> {
        let (out_tx, out_rx) = mpsc::channel::<ClientMessage>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportSignal>(LINK_CHANNEL_CAPACITY);

        let generation = {
            let mut state = self.state.lock();
            state.connects += 1;
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(SyncError::Connection(
                    "connection refused by memory backend".to_string(),
                ));
            }
            state.generation += 1;
            state.active.clear();
            state.link = Some(in_tx.clone());
            state.generation
        };

        tokio::spawn(serve(self.state.clone(), generation, out_rx, in_tx));
        Ok(TransportLink::new(out_tx, in_rx))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Answer client requests for one link until the client drops it
async fn serve(
    state: Shared,
    generation: u64,
    mut requests: mpsc::Receiver<ClientMessage>,
    replies: mpsc::Sender<TransportSignal>,
) {
    while let Some(message) = requests.recv().await {
        let reply = {
            let mut s = state.lock();
            if s.generation != generation || s.link.is_none() {
                // link was dropped server-side; swallow late requests
                continue;
            }
            s.requests.push(message.clone());
            handle_request(&mut s, message)
        };

        match reply {
            Reply::None => {}
            Reply::Now(message) => {
                let _ = replies.send(TransportSignal::Message(message)).await;
            }
            Reply::Later {
                delay,
                message,
                activate,
            } => {
                let state = state.clone();
                let replies = replies.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut s = state.lock();
                        if s.generation != generation || s.link.is_none() {
                            return;
                        }
                        if let Some((uid, collection)) = activate {
                            s.active.insert(uid, collection);
                        }
                    }
                    let _ = replies.send(TransportSignal::Message(message)).await;
                });
            }
        }
    }

    let mut s = state.lock();
    if s.generation == generation {
        debug!(generation, "Memory link closed by client");
        s.link = None;
        s.active.clear();
    }
}

enum Reply {
    None,
    Now(ServerMessage),
    Later {
        delay: Duration,
        message: ServerMessage,
        activate: Option<(String, String)>,
    },
}

fn handle_request(state: &mut BackendState, message: ClientMessage) -> Reply {
    match message {
        ClientMessage::Subscribe {
            uid, collection, ..
        } => {
            if let Some((code, msg)) = state.rejections.get(&collection) {
                return Reply::Now(ServerMessage::Error {
                    uid: Some(uid),
                    code: code.clone(),
                    message: msg.clone(),
                });
            }
            match state.ack_mode {
                AckMode::Immediate => {
                    state.active.insert(uid.clone(), collection);
                    Reply::Now(ServerMessage::Subscribed { uid })
                }
                AckMode::Delayed(delay) => Reply::Later {
                    delay,
                    message: ServerMessage::Subscribed { uid: uid.clone() },
                    activate: Some((uid, collection)),
                },
                AckMode::Silent => Reply::None,
            }
        }
        ClientMessage::Unsubscribe { uid } => {
            state.active.remove(&uid);
            match state.ack_mode {
                AckMode::Immediate => Reply::Now(ServerMessage::Unsubscribed { uid }),
                AckMode::Delayed(delay) => Reply::Later {
                    delay,
                    message: ServerMessage::Unsubscribed { uid },
                    activate: None,
                },
                AckMode::Silent => Reply::None,
            }
        }
        ClientMessage::Pong => Reply::None,
    }
}
