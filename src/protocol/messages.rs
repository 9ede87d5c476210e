//! Wire messages exchanged with the backend event source

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::SubscriptionKey;

/// Messages sent by the client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a live subscription
    Subscribe {
        uid: String,
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<SubscribeQuery>,
    },

    /// Close a live subscription
    Unsubscribe { uid: String },

    /// Heartbeat reply
    Pong,
}

impl ClientMessage {
    /// Build the subscribe request for `key` under `uid`
    pub fn subscribe(uid: impl Into<String>, key: &SubscriptionKey) -> Self {
        let fields = key.fields();
        ClientMessage::Subscribe {
            uid: uid.into(),
            collection: key.resource_kind.clone(),
            event: key.event_filter.wire_event().map(str::to_string),
            query: (!fields.is_empty()).then_some(SubscribeQuery { fields }),
        }
    }

    pub fn unsubscribe(uid: impl Into<String>) -> Self {
        ClientMessage::Unsubscribe { uid: uid.into() }
    }

    /// Subscription uid carried by the request, if any
    pub fn uid(&self) -> Option<&str> {
        match self {
            ClientMessage::Subscribe { uid, .. } | ClientMessage::Unsubscribe { uid } => Some(uid),
            ClientMessage::Pong => None,
        }
    }
}

/// Field selection for a subscribe request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeQuery {
    pub fields: Vec<String>,
}

/// Messages received from the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A subscribe request was acknowledged
    Subscribed { uid: String },

    /// An unsubscribe request was acknowledged
    Unsubscribed { uid: String },

    /// A record changed
    Change {
        collection: String,
        action: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// A request failed (or a connection-level error when `uid` is absent)
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
        #[serde(default = "default_error_code")]
        code: String,
        #[serde(default)]
        message: String,
    },

    /// Heartbeat
    Ping,

    /// Any message type this client does not understand
    #[serde(other)]
    Unknown,
}

fn default_error_code() -> String {
    "UNKNOWN".to_string()
}

impl ServerMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
