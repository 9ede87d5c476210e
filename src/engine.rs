//! Sync engine: wires the connection, registry, demultiplexer, bridge and
//! notification policy together behind one handle.
//!
//! ```no_run
//! use realtime_sync::{query_key, ConsumerBinding, NotifyTemplates, SubscriptionKey, SyncConfig, SyncEngine};
//!
//! # async fn demo() -> realtime_sync::SyncResult<()> {
//! let engine = SyncEngine::builder(SyncConfig::default()).build();
//! engine.start().await?;
//!
//! let tickets = engine
//!     .bind(
//!         ConsumerBinding::new(SubscriptionKey::new("tickets"))
//!             .query_key(query_key!["tickets"])
//!             .templates(NotifyTemplates::defaults_for("tickets")),
//!     )
//!     .await?;
//!
//! tickets.release().await;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::InvalidationBridge;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState, StateChange};
use crate::demux::{ChangeHandler, Demultiplexer};
use crate::error::{SyncError, SyncResult};
use crate::notify::{NotificationPolicy, NotifyTemplates};
use crate::registry::{EntryStatus, SubscriptionHandle, SubscriptionRegistry};
use crate::sink::{CacheInvalidator, DiagnosticSink, LogSink, Notifier};
use crate::transport::{Transport, WebSocketTransport};
use crate::types::{ChangeEvent, ConsumerId, HandlerResult, QueryKey, SubscriptionKey};

/// Builder for [`SyncEngine`]. Collaborators default to the WebSocket
/// transport from the config and [`LogSink`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    transport: Option<Arc<dyn Transport>>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
    notifier: Option<Arc<dyn Notifier>>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl SyncEngineBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> SyncEngine {
        let config = self.config;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WebSocketTransport::from_config(&config)),
        };
        let invalidator: Arc<dyn CacheInvalidator> = match self.invalidator {
            Some(invalidator) => invalidator,
            None => Arc::new(LogSink),
        };
        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(LogSink),
        };
        let diagnostics: Arc<dyn DiagnosticSink> = match self.diagnostics {
            Some(diagnostics) => diagnostics,
            None => Arc::new(LogSink),
        };

        let cancel = CancellationToken::new();
        let connection = ConnectionManager::new(transport, &config);
        let registry =
            SubscriptionRegistry::new(connection.clone(), diagnostics.clone(), cancel.child_token());
        let bridge = InvalidationBridge::new(
            invalidator,
            config.invalidation_debounce,
            cancel.child_token(),
        );
        let policy = Arc::new(NotificationPolicy::new(
            notifier,
            diagnostics.clone(),
            config.dedup_window,
        ));
        let demux = Arc::new(Demultiplexer::new(
            registry.clone(),
            bridge.clone(),
            policy.clone(),
            diagnostics,
        ));

        SyncEngine {
            inner: Arc::new(EngineInner {
                config,
                connection,
                registry,
                demux,
                bridge,
                policy,
                bound: DashSet::new(),
                cancel,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct EngineInner {
    config: SyncConfig,
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    demux: Arc<Demultiplexer>,
    bridge: Arc<InvalidationBridge>,
    policy: Arc<NotificationPolicy>,
    /// (consumer, key) pairs with a live `Binding`
    bound: DashSet<(ConsumerId, SubscriptionKey)>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl EngineInner {
    async fn unbind(&self, parts: BindingParts) {
        let BindingParts {
            consumer,
            key,
            query_key,
            has_handler,
            has_templates,
        } = parts;

        if has_handler {
            self.demux.unregister(consumer, &key);
        }
        if let Some(query_key) = &query_key {
            self.bridge.unbind_invalidation(&key, query_key);
        }
        if has_templates {
            self.policy.unbind_notification(consumer, &key);
        }
        self.registry.detach(consumer, &key).await;
        self.bound.remove(&(consumer, key.clone()));
        debug!(consumer = %consumer, key = %key, "Binding released");
    }
}

/// Handle to the whole sync core. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            transport: None,
            invalidator: None,
            notifier: None,
            diagnostics: None,
        }
    }

    /// Start the background loops (once) and connect.
    ///
    /// Resolves with the outcome of the first connect attempt; reconnection
    /// continues in the background either way.
    pub async fn start(&self) -> SyncResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }

        if !self.inner.started.swap(true, Ordering::AcqRel) {
            let mut tasks = self.inner.tasks.lock();
            if let Some(events) = self.inner.connection.take_events() {
                let demux = self.inner.demux.clone();
                tasks.push(tokio::spawn(demux.run(events, self.inner.cancel.child_token())));
            }
            tasks.push(tokio::spawn(self.inner.registry.clone().run_reattach()));
            info!(url = %self.inner.config.url, "Sync engine started");
        }

        self.inner.connection.connect().await
    }

    /// Attach a consumer: register its handler, invalidation and
    /// notification bindings, then join (or open) the shared subscription.
    ///
    /// A consumer may bind several keys, each with its own handler, but only
    /// one binding per key: a second one fails with `AlreadyBound` until the
    /// first is released. On failure every registration made here is rolled
    /// back.
    pub async fn bind(&self, binding: ConsumerBinding) -> SyncResult<Binding> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }

        let ConsumerBinding {
            key,
            consumer,
            query_key,
            templates,
            handler,
        } = binding;
        let consumer = consumer.unwrap_or_default();
        if !self.inner.bound.insert((consumer, key.clone())) {
            return Err(SyncError::AlreadyBound(consumer, key));
        }

        let parts = BindingParts {
            consumer,
            key: key.clone(),
            query_key: query_key.clone(),
            has_handler: handler.is_some(),
            has_templates: templates.is_some(),
        };

        if let Some(handler) = handler {
            self.inner.demux.register(consumer, key.clone(), handler);
        }
        if let Some(query_key) = query_key {
            self.inner.bridge.bind_invalidation(key.clone(), query_key);
        }
        if let Some(templates) = templates {
            self.inner
                .policy
                .bind_notification(consumer, key.clone(), templates);
        }

        match self.inner.registry.attach(consumer, key).await {
            Ok(handle) => Ok(Binding {
                engine: self.inner.clone(),
                parts,
                status: handle,
                released: false,
            }),
            Err(e) => {
                self.inner.unbind(parts).await;
                Err(e)
            }
        }
    }

    /// Stop everything: cancel background loops and pending retries, close
    /// the connection and wait for the loops to exit.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.connection.disconnect().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("Sync engine shut down");
    }

    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.connection.on_state_change(handler);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.inner.connection
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

/// What a consumer wants from one subscription key
pub struct ConsumerBinding {
    key: SubscriptionKey,
    consumer: Option<ConsumerId>,
    query_key: Option<QueryKey>,
    templates: Option<NotifyTemplates>,
    handler: Option<Arc<dyn ChangeHandler>>,
}

impl ConsumerBinding {
    pub fn new(key: SubscriptionKey) -> Self {
        Self {
            key,
            consumer: None,
            query_key: None,
            templates: None,
            handler: None,
        }
    }

    /// Bind under an existing consumer id instead of a fresh one
    pub fn consumer(mut self, consumer: ConsumerId) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Cached view to invalidate on matching events
    pub fn query_key(mut self, query_key: QueryKey) -> Self {
        self.query_key = Some(query_key);
        self
    }

    pub fn templates(mut self, templates: NotifyTemplates) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: ChangeHandler + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Closure form of [`handler`](Self::handler)
    pub fn on_change<F>(self, handler: F) -> Self
    where
        F: Fn(&ChangeEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler(handler)
    }
}

#[derive(Debug, Clone)]
struct BindingParts {
    consumer: ConsumerId,
    key: SubscriptionKey,
    query_key: Option<QueryKey>,
    has_handler: bool,
    has_templates: bool,
}

/// A live consumer binding. Release it explicitly with
/// [`release`](Binding::release); dropping it releases in the background.
pub struct Binding {
    engine: Arc<EngineInner>,
    parts: BindingParts,
    status: SubscriptionHandle,
    released: bool,
}

impl Binding {
    pub fn consumer(&self) -> ConsumerId {
        self.parts.consumer
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.parts.key
    }

    pub fn status(&self) -> EntryStatus {
        self.status.status()
    }

    /// Wait until the shared subscription is live
    pub async fn live(&mut self) -> EntryStatus {
        self.status.live().await
    }

    /// Unregister the handler and bindings, then detach from the
    /// subscription. No delivery reaches the handler after this returns.
    pub async fn release(mut self) {
        self.released = true;
        let engine = self.engine.clone();
        engine.unbind(self.parts.clone()).await;
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let engine = self.engine.clone();
        let parts = self.parts.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { engine.unbind(parts).await });
            }
            Err(_) => debug!(consumer = %parts.consumer, "Binding dropped outside a runtime; not released"),
        }
    }
}
