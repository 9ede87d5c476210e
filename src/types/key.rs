//! Subscription keys and event filters

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Action, ChangeEvent};

/// Which actions a subscription wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    Create,
    Update,
    Delete,
    Any,
}

impl EventFilter {
    /// Whether an event with `action` passes this filter
    pub fn accepts(self, action: Action) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Create => action == Action::Create,
            EventFilter::Update => action == Action::Update,
            EventFilter::Delete => action == Action::Delete,
        }
    }

    /// Wire name of the filter, `None` for `Any` (the backend default)
    pub fn wire_event(self) -> Option<&'static str> {
        match self {
            EventFilter::Create => Some("create"),
            EventFilter::Update => Some("update"),
            EventFilter::Delete => Some("delete"),
            EventFilter::Any => None,
        }
    }

    /// Parse `create|update|delete|any` (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Some(EventFilter::Create),
            "update" => Some(EventFilter::Update),
            "delete" => Some(EventFilter::Delete),
            "any" | "*" => Some(EventFilter::Any),
            _ => None,
        }
    }
}

impl From<Action> for EventFilter {
    fn from(action: Action) -> Self {
        match action {
            Action::Create => EventFilter::Create,
            Action::Update => EventFilter::Update,
            Action::Delete => EventFilter::Delete,
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_event().unwrap_or("any"))
    }
}

/// Logical identity of a backend subscription.
///
/// Two keys are equal when resource kind, filter and the *set* of selected
/// fields are equal; field order given by callers is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub resource_kind: String,
    pub event_filter: EventFilter,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub field_selector: BTreeSet<String>,
}

impl SubscriptionKey {
    /// Key for every action on a resource kind, all fields
    pub fn new(resource_kind: impl Into<String>) -> Self {
        Self {
            resource_kind: resource_kind.into(),
            event_filter: EventFilter::Any,
            field_selector: BTreeSet::new(),
        }
    }

    pub fn with_filter(mut self, event_filter: EventFilter) -> Self {
        self.event_filter = event_filter;
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_selector = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `event` should be routed to this key.
    ///
    /// The field selector only shapes what the backend sends; it never gates
    /// delivery.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.resource_kind == event.resource_kind && self.event_filter.accepts(event.action)
    }

    /// Selected fields in stable (sorted) order for the wire
    pub fn fields(&self) -> Vec<String> {
        self.field_selector.iter().cloned().collect()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_kind, self.event_filter)?;
        if !self.field_selector.is_empty() {
            let fields: Vec<&str> = self.field_selector.iter().map(String::as_str).collect();
            write!(f, "[{}]", fields.join(","))?;
        }
        Ok(())
    }
}
