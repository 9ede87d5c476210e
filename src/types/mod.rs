//! Data types for the realtime sync core
//!
//! Keys, change events, query keys and consumer identities shared by every
//! component.

mod change;
mod key;
mod query_key;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use change::{Action, ChangeEvent, Severity};
pub use key::{EventFilter, SubscriptionKey};
pub use query_key::{QueryKey, QueryKeySegment};

/// Result type for consumer handlers
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Identity of one consumer (a UI element, a view model, a CLI binding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        ConsumerId(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form keeps log lines readable
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Client-generated id of one backend subscription
pub(crate) fn new_subscription_uid() -> String {
    format!("sub_{}", Uuid::new_v4().simple())
}
