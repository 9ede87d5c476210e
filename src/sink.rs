//! Outbound collaborators: cache invalidation, notifications, diagnostics
//!
//! The core never talks to a UI or cache library directly. It calls these
//! traits, which applications implement (or satisfy with a closure).

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{Action, ConsumerId, QueryKey, Severity, SubscriptionKey};

/// Receives invalidation signals for cached views
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, query_key: &QueryKey);
}

impl<F> CacheInvalidator for F
where
    F: Fn(&QueryKey) + Send + Sync,
{
    fn invalidate(&self, query_key: &QueryKey) {
        self(query_key)
    }
}

/// Receives user-visible transient notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

impl<F> Notifier for F
where
    F: Fn(&str, Severity) + Send + Sync,
{
    fn notify(&self, message: &str, severity: Severity) {
        self(message, severity)
    }
}

/// A non-fatal failure worth surfacing to observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A consumer handler returned an error or panicked
    HandlerFailed {
        consumer: ConsumerId,
        resource_kind: String,
        server_seq: u64,
        message: String,
    },

    /// A notification template could not be rendered against a payload
    PayloadMalformed {
        resource_kind: String,
        action: Action,
        server_seq: u64,
        message: String,
    },

    /// A background re-subscribe was rejected; the entry was dropped
    SubscriptionFailed {
        key: SubscriptionKey,
        message: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::HandlerFailed {
                consumer,
                resource_kind,
                server_seq,
                message,
            } => write!(
                f,
                "handler of consumer {} failed on {}#{}: {}",
                consumer, resource_kind, server_seq, message
            ),
            Diagnostic::PayloadMalformed {
                resource_kind,
                action,
                server_seq,
                message,
            } => write!(
                f,
                "cannot render {} notification for {}#{}: {}",
                action, resource_kind, server_seq, message
            ),
            Diagnostic::SubscriptionFailed { key, message } => {
                write!(f, "subscription {} dropped: {}", key, message)
            }
        }
    }
}

/// Observability sink for [`Diagnostic`]s
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

impl<F> DiagnosticSink for F
where
    F: Fn(Diagnostic) + Send + Sync,
{
    fn report(&self, diagnostic: Diagnostic) {
        self(diagnostic)
    }
}

/// Default sink: writes everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl CacheInvalidator for LogSink {
    fn invalidate(&self, query_key: &QueryKey) {
        info!(query_key = %query_key, "Invalidate");
    }
}

impl Notifier for LogSink {
    fn notify(&self, message: &str, severity: Severity) {
        info!(%severity, "{}", message);
    }
}

impl DiagnosticSink for LogSink {
    fn report(&self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
    }
}

/// Everything a sink can observe, as a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkEvent {
    Invalidate { query_key: QueryKey },
    Notify { message: String, severity: Severity },
    Diagnostic { diagnostic: Diagnostic },
}

/// Forwards every signal into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        // receiver gone just means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl CacheInvalidator for ChannelSink {
    fn invalidate(&self, query_key: &QueryKey) {
        self.forward(SinkEvent::Invalidate {
            query_key: query_key.clone(),
        });
    }
}

impl Notifier for ChannelSink {
    fn notify(&self, message: &str, severity: Severity) {
        self.forward(SinkEvent::Notify {
            message: message.to_string(),
            severity,
        });
    }
}

impl DiagnosticSink for ChannelSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.forward(SinkEvent::Diagnostic { diagnostic });
    }
}

/// Keeps every signal in memory, for assertions
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn invalidations(&self) -> Vec<QueryKey> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Invalidate { query_key } => Some(query_key.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<(String, Severity)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Notify { message, severity } => Some((message.clone(), *severity)),
                _ => None,
            })
            .collect()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Diagnostic { diagnostic } => Some(diagnostic.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl CacheInvalidator for RecordingSink {
    fn invalidate(&self, query_key: &QueryKey) {
        self.events.lock().push(SinkEvent::Invalidate {
            query_key: query_key.clone(),
        });
    }
}

impl Notifier for RecordingSink {
    fn notify(&self, message: &str, severity: Severity) {
        self.events.lock().push(SinkEvent::Notify {
            message: message.to_string(),
            severity,
        });
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.events.lock().push(SinkEvent::Diagnostic { diagnostic });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_invalidator() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invalidator = move |_: &QueryKey| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        invalidator.invalidate(&QueryKey::new(["tickets"]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recording_sink_partitions() {
        let sink = RecordingSink::new();
        sink.invalidate(&QueryKey::new(["tickets"]));
        sink.notify("Ticket created", Severity::Success);
        sink.report(Diagnostic::PayloadMalformed {
            resource_kind: "tickets".to_string(),
            action: Action::Update,
            server_seq: 2,
            message: "missing field `title`".to_string(),
        });

        assert_eq!(sink.invalidations(), vec![QueryKey::new(["tickets"])]);
        assert_eq!(
            sink.notifications(),
            vec![("Ticket created".to_string(), Severity::Success)]
        );
        assert_eq!(sink.diagnostics().len(), 1);
        assert_eq!(sink.events().len(), 3);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify("Ticket deleted", Severity::Warning);
        assert_eq!(
            rx.recv().await.unwrap(),
            SinkEvent::Notify {
                message: "Ticket deleted".to_string(),
                severity: Severity::Warning
            }
        );
    }

    #[test]
    fn test_diagnostic_display() {
        let diagnostic = Diagnostic::PayloadMalformed {
            resource_kind: "tickets".to_string(),
            action: Action::Create,
            server_seq: 9,
            message: "missing field `assignee.first_name`".to_string(),
        };
        assert_eq!(
            diagnostic.to_string(),
            "cannot render create notification for tickets#9: missing field `assignee.first_name`"
        );

        let diagnostic = Diagnostic::SubscriptionFailed {
            key: SubscriptionKey::new("tickets"),
            message: "subscription rejected (FORBIDDEN): no access".to_string(),
        };
        assert_eq!(
            diagnostic.to_string(),
            "subscription tickets:any dropped: subscription rejected (FORBIDDEN): no access"
        );
    }
}
