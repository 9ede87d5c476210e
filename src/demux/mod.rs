//! Event demultiplexer
//!
//! The single sequential reader of the connection's event stream. For each
//! change it asks the registry which consumers match, delivers the event to
//! each matched (consumer, key) handler in registration order, then hands
//! the matched keys to the invalidation bridge and the notification policy.
//!
//! Handlers run inline on the demux task. A failing or panicking handler is
//! reported to the diagnostic sink and does not stop delivery to the rest.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::InvalidationBridge;
use crate::notify::NotificationPolicy;
use crate::registry::SubscriptionRegistry;
use crate::sink::{Diagnostic, DiagnosticSink};
use crate::types::{ChangeEvent, ConsumerId, HandlerResult, SubscriptionKey};

/// Receives the change events a consumer subscribed to
pub trait ChangeHandler: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> HandlerResult;
}

impl<F> ChangeHandler for F
where
    F: Fn(&ChangeEvent) -> HandlerResult + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> HandlerResult {
        self(event)
    }
}

/// Delivery takes the slot lock, so clearing the slot waits for an
/// in-flight call to return
struct HandlerSlot {
    handler: Mutex<Option<Arc<dyn ChangeHandler>>>,
}

pub struct Demultiplexer {
    registry: Arc<SubscriptionRegistry>,
    handlers: DashMap<(ConsumerId, SubscriptionKey), Arc<HandlerSlot>>,
    bridge: Arc<InvalidationBridge>,
    policy: Arc<NotificationPolicy>,
    diagnostics: Arc<dyn DiagnosticSink>,
    dispatched: AtomicU64,
}

impl Demultiplexer {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        bridge: Arc<InvalidationBridge>,
        policy: Arc<NotificationPolicy>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            registry,
            handlers: DashMap::new(),
            bridge,
            policy,
            diagnostics,
            dispatched: AtomicU64::new(0),
        }
    }

    /// Set the handler for `consumer`'s attachment to `key`, replacing any
    /// previous one for that pair
    pub fn register(&self, consumer: ConsumerId, key: SubscriptionKey, handler: Arc<dyn ChangeHandler>) {
        let slot = Arc::new(HandlerSlot {
            handler: Mutex::new(Some(handler)),
        });
        if let Some(previous) = self.handlers.insert((consumer, key), slot) {
            previous.handler.lock().take();
        }
    }

    /// Remove the handler for `consumer` on `key`. Blocks until a delivery
    /// to it that is already running has returned; no delivery starts
    /// afterwards. Handlers the consumer holds on other keys are untouched.
    pub fn unregister(&self, consumer: ConsumerId, key: &SubscriptionKey) {
        if let Some((_, slot)) = self.handlers.remove(&(consumer, key.clone())) {
            slot.handler.lock().take();
        }
    }

    pub fn is_registered(&self, consumer: ConsumerId, key: &SubscriptionKey) -> bool {
        self.handlers.contains_key(&(consumer, key.clone()))
    }

    /// Events dispatched so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Route one event. Returns the number of handlers that accepted it.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let matched = self.registry.matching(event);
        if matched.is_empty() {
            debug!(kind = %event.resource_kind, seq = event.server_seq, "No subscriber for change");
            return 0;
        }

        let mut delivered = 0;
        for delivery in &matched.deliveries {
            let consumer = &delivery.0;
            let Some(slot) = self.handlers.get(delivery).map(|s| s.value().clone()) else {
                continue;
            };
            let guard = slot.handler.lock();
            let Some(handler) = guard.as_ref() else {
                continue;
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_change(event)));
            drop(guard);

            let failure = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            warn!(consumer = %consumer, kind = %event.resource_kind, error = %failure, "Change handler failed");
            self.diagnostics.report(Diagnostic::HandlerFailed {
                consumer: *consumer,
                resource_kind: event.resource_kind.clone(),
                server_seq: event.server_seq,
                message: failure,
            });
        }

        self.bridge.on_event(&matched.keys, event);
        self.policy.on_event(&matched.keys, event);
        delivered
    }

    /// Consume `events` until the stream ends or `cancel` fires
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) {
        info!("Demultiplexer started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.dispatch(&event);
                    }
                    None => break,
                },
            }
        }
        info!(dispatched = self.dispatched(), "Demultiplexer stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::connection::ConnectionManager;
    use crate::notify::NotifyTemplates;
    use crate::query_key;
    use crate::sink::RecordingSink;
    use crate::transport::MemoryBackend;
    use crate::types::{Action, SubscriptionKey};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct Fixture {
        demux: Arc<Demultiplexer>,
        registry: Arc<SubscriptionRegistry>,
        bridge: Arc<InvalidationBridge>,
        policy: Arc<NotificationPolicy>,
        connection: Arc<ConnectionManager>,
        sink: Arc<RecordingSink>,
    }

    async fn fixture() -> Fixture {
        let (transport, _backend) = MemoryBackend::new();
        let connection = ConnectionManager::new(Arc::new(transport), &SyncConfig::default());
        connection.connect().await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let registry = SubscriptionRegistry::new(connection.clone(), sink.clone(), CancellationToken::new());
        let bridge = InvalidationBridge::new(sink.clone(), Duration::ZERO, CancellationToken::new());
        let policy = Arc::new(NotificationPolicy::new(sink.clone(), sink.clone(), Duration::ZERO));
        let demux = Arc::new(Demultiplexer::new(
            registry.clone(),
            bridge.clone(),
            policy.clone(),
            sink.clone(),
        ));
        Fixture {
            demux,
            registry,
            bridge,
            policy,
            connection,
            sink,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<(String, u64)>>>, name: &str) -> Arc<dyn ChangeHandler> {
        let log = log.clone();
        let name = name.to_string();
        Arc::new(move |event: &ChangeEvent| -> HandlerResult {
            log.lock().push((name.clone(), event.server_seq));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_delivers_in_registration_order() {
        let f = fixture().await;
        let key = SubscriptionKey::new("tickets");
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (ConsumerId::new(), ConsumerId::new());

        f.demux.register(b, key.clone(), recorder(&log, "b"));
        f.demux.register(a, key.clone(), recorder(&log, "a"));
        f.registry.attach(a, key.clone()).await.unwrap();
        f.registry.attach(b, key.clone()).await.unwrap();

        for seq in 1..=3 {
            let delivered = f
                .demux
                .dispatch(&ChangeEvent::new("tickets", Action::Update, json!({"id": seq}), seq));
            assert_eq!(delivered, 2);
        }

        let expected: Vec<(String, u64)> = (1..=3)
            .flat_map(|seq| vec![("a".to_string(), seq), ("b".to_string(), seq)])
            .collect();
        assert_eq!(*log.lock(), expected);
        f.connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let f = fixture().await;
        let key = SubscriptionKey::new("tickets");
        let log = Arc::new(Mutex::new(Vec::new()));
        let (failing, panicking, healthy) = (ConsumerId::new(), ConsumerId::new(), ConsumerId::new());

        f.demux.register(
            failing,
            key.clone(),
            Arc::new(|_: &ChangeEvent| -> HandlerResult { Err("view is gone".into()) }),
        );
        f.demux.register(
            panicking,
            key.clone(),
            Arc::new(|_: &ChangeEvent| -> HandlerResult { panic!("boom") }),
        );
        f.demux.register(healthy, key.clone(), recorder(&log, "healthy"));
        for consumer in [failing, panicking, healthy] {
            f.registry.attach(consumer, key.clone()).await.unwrap();
        }
        f.bridge.bind_invalidation(key.clone(), query_key!["tickets"]);

        let delivered = f
            .demux
            .dispatch(&ChangeEvent::new("tickets", Action::Update, json!({"id": 1}), 1));

        assert_eq!(delivered, 1);
        assert_eq!(log.lock().len(), 1);
        let messages: Vec<String> = f
            .sink
            .diagnostics()
            .into_iter()
            .map(|d| match d {
                Diagnostic::HandlerFailed { message, .. } => message,
                other => panic!("unexpected diagnostic: {:?}", other),
            })
            .collect();
        assert_eq!(messages, vec!["view is gone".to_string(), "panicked: boom".to_string()]);
        // invalidation still happens
        assert_eq!(f.sink.invalidations(), vec![query_key!["tickets"]]);
        f.connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_forwards_to_bridge_and_policy() {
        let f = fixture().await;
        let key = SubscriptionKey::new("tickets");
        let consumer = ConsumerId::new();
        f.registry.attach(consumer, key.clone()).await.unwrap();
        f.bridge.bind_invalidation(key.clone(), query_key!["tickets"]);
        f.policy
            .bind_notification(consumer, key, NotifyTemplates::defaults_for("tickets"));

        // no handler registered: invalidation and notification only
        let delivered = f
            .demux
            .dispatch(&ChangeEvent::new("tickets", Action::Create, json!({"id": 4}), 1));
        assert_eq!(delivered, 0);
        assert_eq!(f.sink.invalidations(), vec![query_key!["tickets"]]);
        assert_eq!(f.sink.notifications().len(), 1);

        // unrelated kind matches nothing
        f.demux
            .dispatch(&ChangeEvent::new("projects", Action::Create, json!({"id": 1}), 1));
        assert_eq!(f.sink.events().len(), 2);
        f.connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_handlers_are_per_key() {
        let f = fixture().await;
        let tickets = SubscriptionKey::new("tickets");
        let projects = SubscriptionKey::new("projects");
        let log = Arc::new(Mutex::new(Vec::new()));
        let consumer = ConsumerId::new();

        f.demux.register(consumer, tickets.clone(), recorder(&log, "tickets"));
        f.demux.register(consumer, projects.clone(), recorder(&log, "projects"));
        f.registry.attach(consumer, tickets.clone()).await.unwrap();
        f.registry.attach(consumer, projects.clone()).await.unwrap();

        f.demux
            .dispatch(&ChangeEvent::new("tickets", Action::Update, json!({}), 1));
        f.demux
            .dispatch(&ChangeEvent::new("projects", Action::Update, json!({}), 1));

        f.demux.unregister(consumer, &projects);
        assert!(f.demux.is_registered(consumer, &tickets));
        f.demux
            .dispatch(&ChangeEvent::new("tickets", Action::Update, json!({}), 2));
        f.demux
            .dispatch(&ChangeEvent::new("projects", Action::Update, json!({}), 2));

        assert_eq!(
            *log.lock(),
            vec![
                ("tickets".to_string(), 1),
                ("projects".to_string(), 1),
                ("tickets".to_string(), 2),
            ]
        );
        f.connection.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unregister_waits_for_inflight_delivery() {
        let f = fixture().await;
        let key = SubscriptionKey::new("tickets");
        let consumer = ConsumerId::new();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU64::new(0));

        let (s, fin, c) = (started.clone(), finished.clone(), calls.clone());
        f.demux.register(
            consumer,
            key.clone(),
            Arc::new(move |_: &ChangeEvent| -> HandlerResult {
                c.fetch_add(1, Ordering::SeqCst);
                s.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                fin.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        f.registry.attach(consumer, key.clone()).await.unwrap();

        let demux = f.demux.clone();
        let delivery = tokio::task::spawn_blocking(move || {
            demux.dispatch(&ChangeEvent::new("tickets", Action::Update, json!({}), 1))
        });
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        f.demux.unregister(consumer, &key);
        assert!(finished.load(Ordering::SeqCst));
        assert!(!f.demux.is_registered(consumer, &key));
        assert_eq!(delivery.await.unwrap(), 1);

        f.demux
            .dispatch(&ChangeEvent::new("tickets", Action::Update, json!({}), 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        f.connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture().await;
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(f.demux.clone().run(rx, cancel.clone()));

        tx.send(ChangeEvent::new("tickets", Action::Create, json!({}), 1))
            .await
            .unwrap();
        cancel.cancel();
        task.await.unwrap();
        assert!(f.demux.dispatched() <= 1);
        f.connection.disconnect().await;
    }
}
