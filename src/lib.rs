//! Realtime Sync
//!
//! Client-side realtime synchronization core: one shared connection to a
//! backend event source, reference-counted subscriptions, ordered fan-out to
//! consumers, cache invalidation and user notifications.
//!
//! # Features
//!
//! - **Shared connection**: reconnects with exponential backoff and full jitter
//! - **One subscription per key**: consumers share it, last one out closes it
//! - **Re-attach on reconnect**: consumers never resubscribe by hand
//! - **Ordered delivery**: per resource kind, stale and replayed events dropped
//! - **Coalesced invalidation**: one signal per query key, debounced bursts
//! - **Deduplicated notifications**: templated text, severity by action
//!
//! # Modules
//!
//! - `types`: Keys, change events, query keys, consumer ids
//! - `protocol`: Wire messages exchanged with the backend
//! - `transport`: WebSocket and in-memory transports
//! - `connection`: Connection lifecycle, backoff, request/ack, sequencing
//! - `registry`: Reference-counted subscription entries
//! - `demux`: Event routing to consumer handlers
//! - `bridge`: Cache invalidation with coalescing
//! - `notify`: Notification templates and dedup policy
//! - `sink`: Collaborator traits and stock sinks
//! - `engine`: Everything wired behind one handle
//!
//! # Example
//!
//! ```no_run
//! use realtime_sync::{ConsumerBinding, SubscriptionKey, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SyncEngine::builder(SyncConfig::from_env()?).build();
//!     engine.start().await?;
//!
//!     let _tickets = engine
//!         .bind(ConsumerBinding::new(SubscriptionKey::new("tickets")).on_change(|event| {
//!             println!("{} #{}", event.action, event.server_seq);
//!             Ok(())
//!         }))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod demux;
pub mod engine;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod sink;
pub mod transport;
pub mod types;

// Re-export commonly used items at crate root
pub use bridge::InvalidationBridge;
pub use config::{BackoffConfig, ConfigError, SyncConfig};
pub use connection::{
    Backoff, ConnectionManager, ConnectionSnapshot, ConnectionState, StateChange,
};
pub use demux::{ChangeHandler, Demultiplexer};
pub use engine::{Binding, ConsumerBinding, SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use notify::{MessageTemplate, NotificationPolicy, NotifyTemplates};
pub use registry::{EntryStatus, MatchSet, SubscriptionHandle, SubscriptionRegistry};
pub use sink::{
    CacheInvalidator, ChannelSink, Diagnostic, DiagnosticSink, LogSink, Notifier,
    RecordingSink, SinkEvent,
};
pub use transport::{
    AckMode, CloseReason, MemoryBackend, MemoryTransport, Transport, WebSocketTransport,
};
pub use types::{
    Action, ChangeEvent, ConsumerId, EventFilter, HandlerResult, QueryKey, QueryKeySegment,
    Severity, SubscriptionKey,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
