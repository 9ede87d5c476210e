//! Change events as delivered to consumers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Parse a wire action name (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" | "created" => Some(Action::Create),
            "update" | "updated" => Some(Action::Update),
            "delete" | "deleted" => Some(Action::Delete),
            _ => None,
        }
    }

    /// Notification severity this action is tagged with
    pub fn severity(self) -> Severity {
        match self {
            Action::Create => Severity::Success,
            Action::Update => Severity::Info,
            Action::Delete => Severity::Warning,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Severity of a user-visible notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Info,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Success => write!(f, "success"),
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A change to one resource kind, immutable once received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub resource_kind: String,
    pub action: Action,
    pub payload: Value,
    /// Monotonic per resource kind within one connection epoch
    pub server_seq: u64,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(resource_kind: impl Into<String>, action: Action, payload: Value, server_seq: u64) -> Self {
        Self {
            resource_kind: resource_kind.into(),
            action,
            payload,
            server_seq,
            received_at: Utc::now(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.action.severity()
    }
}
