//! Notification policy
//!
//! Decides which matched events produce a user-visible notification and
//! with what text. Templates are bound per consumer and subscription key;
//! the severity follows the action (create → success, update → info,
//! delete → warning). Identical messages inside the dedup window are
//! emitted once.

mod template;

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

pub use template::{MessageTemplate, NotifyTemplates};

use crate::sink::{Diagnostic, DiagnosticSink, Notifier};
use crate::types::{ChangeEvent, ConsumerId, Severity, SubscriptionKey};

/// Dedup records are pruned once the map grows past this
const PRUNE_THRESHOLD: usize = 256;

pub struct NotificationPolicy {
    bindings: DashMap<SubscriptionKey, Vec<(ConsumerId, NotifyTemplates)>>,
    recent: DashMap<(String, Severity), Instant>,
    notifier: Arc<dyn Notifier>,
    diagnostics: Arc<dyn DiagnosticSink>,
    window: Duration,
}

impl NotificationPolicy {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        diagnostics: Arc<dyn DiagnosticSink>,
        window: Duration,
    ) -> Self {
        Self {
            bindings: DashMap::new(),
            recent: DashMap::new(),
            notifier,
            diagnostics,
            window,
        }
    }

    /// Render `templates` for events matching `key`, on behalf of `owner`.
    /// Rebinding the same owner and key replaces its templates.
    pub fn bind_notification(&self, owner: ConsumerId, key: SubscriptionKey, templates: NotifyTemplates) {
        let mut bound = self.bindings.entry(key).or_default();
        match bound.iter_mut().find(|(id, _)| *id == owner) {
            Some((_, existing)) => *existing = templates,
            None => bound.push((owner, templates)),
        }
    }

    pub fn unbind_notification(&self, owner: ConsumerId, key: &SubscriptionKey) {
        if let Entry::Occupied(mut occupied) = self.bindings.entry(key.clone()) {
            occupied.get_mut().retain(|(id, _)| *id != owner);
            if occupied.get().is_empty() {
                occupied.remove();
            }
        }
    }

    pub fn has_binding(&self, owner: ConsumerId, key: &SubscriptionKey) -> bool {
        self.bindings
            .get(key)
            .map(|bound| bound.iter().any(|(id, _)| *id == owner))
            .unwrap_or(false)
    }

    /// Render and emit notifications for an event that matched `keys`.
    /// Returns the number of notifications actually emitted.
    pub fn on_event(&self, keys: &[SubscriptionKey], event: &ChangeEvent) -> usize {
        let templates: Vec<MessageTemplate> = keys
            .iter()
            .filter_map(|key| self.bindings.get(key))
            .flat_map(|bound| {
                bound
                    .iter()
                    .filter_map(|(_, t)| t.for_action(event.action).cloned())
                    .collect::<Vec<_>>()
            })
            .collect();
        if templates.is_empty() {
            return 0;
        }

        let mut messages: Vec<String> = Vec::new();
        for template in templates {
            match template.render(&event.payload) {
                Ok(message) => {
                    if !messages.contains(&message) {
                        messages.push(message);
                    }
                }
                Err(e) => self.diagnostics.report(Diagnostic::PayloadMalformed {
                    resource_kind: event.resource_kind.clone(),
                    action: event.action,
                    server_seq: event.server_seq,
                    message: e.to_string(),
                }),
            }
        }

        let severity = event.severity();
        let mut emitted = 0;
        for message in messages {
            if self.first_in_window(&message, severity) {
                self.notifier.notify(&message, severity);
                emitted += 1;
            } else {
                debug!(%severity, message = %message, "Duplicate notification suppressed");
            }
        }
        emitted
    }

    /// Record `(message, severity)` and report whether it may be emitted
    fn first_in_window(&self, message: &str, severity: Severity) -> bool {
        if self.window.is_zero() {
            return true;
        }

        let now = Instant::now();
        let fresh = match self.recent.entry((message.to_string(), severity)) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < self.window {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        };

        if self.recent.len() > PRUNE_THRESHOLD {
            let window = self.window;
            self.recent.retain(|_, at| now.duration_since(*at) < window);
        }
        fresh
    }
}
