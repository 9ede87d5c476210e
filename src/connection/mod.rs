//! Connection manager
//!
//! Owns the single logical connection to the backend event source:
//!
//! - Lifecycle `Disconnected → Connecting → Open → Closing → Disconnected`,
//!   with a transient `Error` state that schedules a reconnect
//! - Automatic reconnection with exponential backoff and full jitter,
//!   cancellable at any point by `disconnect()`
//! - Request/acknowledge plumbing for subscribe and unsubscribe, with a
//!   deadline on every request
//! - Sequencing of incoming changes into one ordered event channel
//!
//! Every successful open starts a new *epoch*. Subscriptions acknowledged in
//! an earlier epoch are gone server-side; the registry watches the epoch to
//! re-attach them.

mod backoff;
mod sequencer;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::Backoff;
use sequencer::Sequencer;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{CloseReason, Transport, TransportLink, TransportSignal};
use crate::types::{ChangeEvent, SubscriptionKey};

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// Transport failed; a reconnect is scheduled
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Latest state, as published on the watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Number of successful opens so far; 0 before the first
    pub epoch: u64,
    /// Why the last link closed or the last attempt failed
    pub reason: Option<CloseReason>,
}

/// One state transition, as seen by observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub epoch: u64,
    pub reason: Option<CloseReason>,
}

/// Observer invoked on every transition
pub type StateObserver = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestKind {
    Subscribe,
    Unsubscribe,
}

type PendingKey = (RequestKind, String);

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The single logical connection to the backend
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    connect_timeout: Duration,
    request_timeout: Duration,
    state_tx: watch::Sender<ConnectionSnapshot>,
    observers: RwLock<Vec<StateObserver>>,
    outbound: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<SyncResult<()>>>>,
    events_tx: mpsc::Sender<ChangeEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
    events_taken: AtomicBool,
    session: Mutex<Option<Session>>,
    stale_dropped: AtomicU64,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: &SyncConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Disconnected,
            epoch: 0,
            reason: None,
        });
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));

        Arc::new(Self {
            transport,
            backoff: config.backoff.into(),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            state_tx,
            observers: RwLock::new(Vec::new()),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            events_taken: AtomicBool::new(false),
            session: Mutex::new(None),
            stale_dropped: AtomicU64::new(0),
        })
    }

    // ==================== Lifecycle ====================

    /// Start the connection, resolving with the outcome of the first attempt.
    ///
    /// Idempotent while connecting or open. When the first attempt fails the
    /// error is returned but reconnection continues in the background until
    /// [`disconnect`](Self::disconnect).
    pub async fn connect(self: &Arc<Self>) -> SyncResult<()> {
        let mut state_rx = self.state_tx.subscribe();
        {
            let mut session = self.session.lock();
            let running = session
                .as_ref()
                .map(|s| !s.task.is_finished())
                .unwrap_or(false);
            if !running {
                self.transition(ConnectionState::Connecting, None);
                let cancel = CancellationToken::new();
                let task = tokio::spawn(self.clone().supervise(cancel.clone()));
                *session = Some(Session { cancel, task });
            }
        }

        loop {
            let snapshot = state_rx.borrow_and_update().clone();
            match snapshot.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Error => {
                    let reason = snapshot
                        .reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "connection failed".to_string());
                    return Err(SyncError::Connection(reason));
                }
                ConnectionState::Closing | ConnectionState::Disconnected => {
                    return Err(SyncError::Closed)
                }
                ConnectionState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(SyncError::Closed);
            }
        }
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Cancels a pending backoff delay, so no scheduled attempt runs after
    /// this returns.
    pub async fn disconnect(&self) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return;
        };
        if self.state() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Closing, None);
        }
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            warn!(error = %e, "Connection supervisor ended abnormally");
        }
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.transition(ConnectionState::Connecting, None);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = tokio::time::timeout(self.connect_timeout, self.transport.connect()) => outcome,
            };

            let reason = match outcome {
                Ok(Ok(link)) => {
                    attempt = 0;
                    match self.run_link(link, &cancel).await {
                        Some(reason) => reason,
                        None => break,
                    }
                }
                Ok(Err(e)) => CloseReason::new(e.to_string()),
                Err(_) => CloseReason::new(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                )),
            };

            if reason.is_unauthorized() {
                warn!(reason = %reason, "Backend refused credentials");
            } else {
                warn!(reason = %reason, "Connection lost");
            }
            self.transition(ConnectionState::Error, Some(reason));

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Attempting reconnection"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(ConnectionState::Disconnected, None);
    }

    /// Pump one link until it closes (`Some(reason)`) or we are cancelled (`None`)
    async fn run_link(&self, link: TransportLink, cancel: &CancellationToken) -> Option<CloseReason> {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;

        *self.outbound.lock() = Some(outbound);
        self.transition(ConnectionState::Open, None);
        info!(
            epoch = self.epoch(),
            target = %self.transport.describe(),
            "Connection open"
        );

        let mut sequencer = Sequencer::new();
        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                signal = inbound.recv() => match signal {
                    Some(TransportSignal::Message(message)) => {
                        self.dispatch(message, &mut sequencer).await;
                    }
                    Some(TransportSignal::Closed(reason)) => break Some(reason),
                    Some(TransportSignal::Error(e)) => break Some(CloseReason::new(e)),
                    None => break Some(CloseReason::new("transport closed")),
                },
            }
        };

        self.outbound.lock().take();
        let why = reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "connection closed".to_string());
        self.fail_pending(&why);
        self.stale_dropped
            .fetch_add(sequencer.dropped(), Ordering::Relaxed);
        reason
    }

    async fn dispatch(&self, message: ServerMessage, sequencer: &mut Sequencer) {
        match message {
            ServerMessage::Change {
                collection,
                action,
                data,
                seq,
            } => {
                let Some(event) = sequencer.admit(collection, &action, data, seq) else {
                    return;
                };
                if !self.events_taken.load(Ordering::Acquire) {
                    debug!(kind = %event.resource_kind, "No event reader attached; change dropped");
                    return;
                }
                if self.events_tx.send(event).await.is_err() {
                    debug!("Event reader gone; change dropped");
                }
            }
            ServerMessage::Subscribed { uid } => {
                if !self.resolve(RequestKind::Subscribe, &uid, Ok(())) {
                    debug!(uid = %uid, "Acknowledgement for unknown subscribe");
                }
            }
            ServerMessage::Unsubscribed { uid } => {
                self.resolve(RequestKind::Unsubscribe, &uid, Ok(()));
            }
            ServerMessage::Error {
                uid: Some(uid),
                code,
                message,
            } => {
                let err = SyncError::subscription(code, message);
                if !self.resolve(RequestKind::Subscribe, &uid, Err(err.clone()))
                    && !self.resolve(RequestKind::Unsubscribe, &uid, Err(err.clone()))
                {
                    warn!(uid = %uid, error = %err, "Unsolicited subscription error");
                }
            }
            ServerMessage::Error {
                uid: None,
                code,
                message,
            } => {
                warn!(code = %code, message = %message, "Backend reported an error");
            }
            ServerMessage::Ping => {
                if let Err(e) = self.send(ClientMessage::Pong).await {
                    debug!(error = %e, "Could not answer ping");
                }
            }
            ServerMessage::Unknown => debug!("Ignoring message of unknown type"),
        }
    }

    fn transition(&self, to: ConnectionState, reason: Option<CloseReason>) {
        let mut change = None;
        self.state_tx.send_if_modified(|snapshot| {
            if snapshot.state == to {
                return false;
            }
            let from = snapshot.state;
            snapshot.state = to;
            if to == ConnectionState::Open {
                snapshot.epoch += 1;
            }
            snapshot.reason = reason.clone();
            change = Some(StateChange {
                from,
                to,
                epoch: snapshot.epoch,
                reason: reason.clone(),
            });
            true
        });

        let Some(change) = change else {
            return;
        };
        debug!(from = %change.from, to = %change.to, epoch = change.epoch, "Connection state changed");
        let observers: Vec<StateObserver> = self.observers.read().clone();
        for observer in observers {
            observer(&change);
        }
    }

    // ==================== Requests ====================

    /// Send a message on the open link
    pub async fn send(&self, message: ClientMessage) -> SyncResult<()> {
        if self.state() != ConnectionState::Open {
            return Err(SyncError::NotConnected);
        }
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(SyncError::NotConnected)?;
        sender
            .send(message)
            .await
            .map_err(|_| SyncError::NotConnected)
    }

    /// Open a backend subscription and wait for its acknowledgement.
    ///
    /// Returns the epoch the subscription is live in.
    pub async fn subscribe(&self, uid: &str, key: &SubscriptionKey) -> SyncResult<u64> {
        self.request(RequestKind::Subscribe, ClientMessage::subscribe(uid, key))
            .await
    }

    /// Close a backend subscription and wait for its acknowledgement
    pub async fn unsubscribe(&self, uid: &str) -> SyncResult<()> {
        self.request(RequestKind::Unsubscribe, ClientMessage::unsubscribe(uid))
            .await
            .map(|_| ())
    }

    async fn request(&self, kind: RequestKind, message: ClientMessage) -> SyncResult<u64> {
        let uid = message.uid().unwrap_or_default().to_string();
        let epoch = {
            let snapshot = self.state_tx.borrow();
            if snapshot.state != ConnectionState::Open {
                return Err(SyncError::NotConnected);
            }
            snapshot.epoch
        };

        let (tx, rx) = oneshot::channel();
        let key: PendingKey = (kind, uid);
        self.pending.lock().insert(key.clone(), tx);

        if let Err(e) = self.send(message).await {
            self.pending.lock().remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(epoch),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(SyncError::Connection(
                "connection lost before acknowledgement".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&key);
                Err(SyncError::SubscriptionTimeout(self.request_timeout))
            }
        }
    }

    fn resolve(&self, kind: RequestKind, uid: &str, result: SyncResult<()>) -> bool {
        let waiter = self.pending.lock().remove(&(kind, uid.to_string()));
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(SyncError::Connection(reason.to_string())));
        }
    }

    // ==================== Observation ====================

    /// Register an observer for every state transition
    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(handler));
    }

    /// Watch the latest snapshot
    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state_tx.subscribe()
    }

    /// Snapshots as a stream, starting with the current one
    pub fn state_stream(&self) -> WatchStream<ConnectionSnapshot> {
        WatchStream::new(self.state_tx.subscribe())
    }

    /// Take the ordered change-event stream. Only one reader may exist, so
    /// this returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ChangeEvent>> {
        let rx = self.events_rx.lock().take();
        if rx.is_some() {
            self.events_taken.store(true, Ordering::Release);
        }
        rx
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().state
    }

    pub fn epoch(&self) -> u64 {
        self.state_tx.borrow().epoch
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Changes dropped as stale or replayed on closed links
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AckMode, MemoryBackend};
    use serde_json::json;

    fn test_config() -> SyncConfig {
        SyncConfig::default()
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .with_request_timeout(Duration::from_millis(100))
    }

    fn manager() -> (Arc<ConnectionManager>, MemoryBackend) {
        let (transport, backend) = MemoryBackend::new();
        (ConnectionManager::new(Arc::new(transport), &test_config()), backend)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ConnectionSnapshot>,
        pred: impl Fn(&ConnectionSnapshot) -> bool,
    ) -> ConnectionSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state not reached in time")
    }

    #[tokio::test]
    async fn test_connect_opens_first_epoch() {
        let (conn, backend) = manager();
        conn.connect().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.epoch(), 1);
        assert!(backend.is_connected());
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (conn, backend) = manager();
        conn.connect().await.unwrap();
        conn.connect().await.unwrap();

        assert_eq!(backend.connect_count(), 1);
        assert_eq!(conn.epoch(), 1);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let (conn, _backend) = manager();
        assert_eq!(
            conn.send(ClientMessage::Pong).await,
            Err(SyncError::NotConnected)
        );
        assert_eq!(
            conn.subscribe("sub_1", &SubscriptionKey::new("tickets")).await,
            Err(SyncError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_subscribe_ack_and_rejection() {
        let (conn, backend) = manager();
        backend.reject("secrets", "FORBIDDEN", "no access");
        conn.connect().await.unwrap();

        let epoch = conn
            .subscribe("sub_1", &SubscriptionKey::new("tickets"))
            .await
            .unwrap();
        assert_eq!(epoch, 1);

        let err = conn
            .subscribe("sub_2", &SubscriptionKey::new("secrets"))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::subscription("FORBIDDEN", "no access"));

        conn.unsubscribe("sub_1").await.unwrap();
        assert_eq!(backend.unsubscribe_requests(), vec!["sub_1".to_string()]);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let (conn, backend) = manager();
        backend.set_ack_mode(AckMode::Silent);
        conn.connect().await.unwrap();

        let err = conn
            .subscribe("sub_1", &SubscriptionKey::new("tickets"))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::SubscriptionTimeout(Duration::from_millis(100)));
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_pending_request_fails_on_drop() {
        let (conn, backend) = manager();
        backend.set_ack_mode(AckMode::Silent);
        conn.connect().await.unwrap();

        let c = conn.clone();
        let request =
            tokio::spawn(async move { c.subscribe("sub_1", &SubscriptionKey::new("tickets")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.drop_connection(CloseReason::new("restart")).await;

        let result = request.await.unwrap();
        assert!(matches!(result, Err(SyncError::Connection(_))));
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let (conn, backend) = manager();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        conn.on_state_change(move |change| seen.lock().push(change.to));

        conn.connect().await.unwrap();
        let mut rx = conn.watch_state();
        backend
            .drop_connection(CloseReason::with_code(1012, "service restart"))
            .await;

        let snapshot = wait_for(&mut rx, |s| s.state == ConnectionState::Open && s.epoch == 2).await;
        assert_eq!(snapshot.epoch, 2);
        assert_eq!(backend.connect_count(), 2);

        let states = changes.lock().clone();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Error,
                ConnectionState::Connecting,
                ConnectionState::Open,
            ]
        );
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_first_attempt_failure_keeps_retrying() {
        let (conn, backend) = manager();
        backend.refuse_connections(2);

        assert!(matches!(conn.connect().await, Err(SyncError::Connection(_))));

        let mut rx = conn.watch_state();
        wait_for(&mut rx, |s| s.state == ConnectionState::Open).await;
        assert_eq!(backend.connect_count(), 3);
        conn.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (transport, backend) = MemoryBackend::new();
        let config = SyncConfig::default();
        let conn = ConnectionManager::new(Arc::new(transport), &config);
        backend.refuse_connections(usize::MAX);

        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
        conn.disconnect().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.connect_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_changes_are_sequenced() {
        let (conn, backend) = manager();
        let mut events = conn.take_events().unwrap();
        assert!(conn.take_events().is_none());
        conn.connect().await.unwrap();

        backend
            .push_change_with_seq("tickets", "create", json!({"id": 1}), Some(1))
            .await;
        backend
            .push_change_with_seq("tickets", "update", json!({"id": 1}), Some(1))
            .await;
        backend
            .push_change_with_seq("tickets", "bogus", json!({"id": 1}), Some(2))
            .await;
        backend
            .push_change_with_seq("tickets", "update", json!({"id": 1}), Some(2))
            .await;

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!((first.server_seq, second.server_seq), (1, 2));
        assert_eq!(second.action, crate::types::Action::Update);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (conn, backend) = manager();
        conn.connect().await.unwrap();
        backend.send(ServerMessage::Ping).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !backend.requests().contains(&ClientMessage::Pong) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        conn.disconnect().await;
    }
}
