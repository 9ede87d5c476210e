//! Error taxonomy for the sync core

use std::time::Duration;
use thiserror::Error;

use crate::types::{ConsumerId, SubscriptionKey};

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the connection, registry and engine.
///
/// Connection-level failures are recovered locally (reconnect + re-attach);
/// only `Subscription` and `NotConnected` are meant to reach a caller of
/// `attach`/`bind` as a hard failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Transport-level failure. Triggers reconnect with backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation needed an open connection and there was none.
    #[error("not connected")]
    NotConnected,

    /// The backend rejected a subscribe/unsubscribe request.
    #[error("subscription rejected ({code}): {message}")]
    Subscription { code: String, message: String },

    /// No acknowledgement arrived before the request deadline.
    #[error("no acknowledgement within {0:?}")]
    SubscriptionTimeout(Duration),

    /// A payload did not have the shape a template or decoder expected.
    #[error("malformed payload: {0}")]
    PayloadMalformed(String),

    /// The consumer already holds a binding on this key.
    #[error("consumer {0} is already bound to {1}")]
    AlreadyBound(ConsumerId, SubscriptionKey),

    /// The engine or connection has been shut down.
    #[error("sync engine is shut down")]
    Closed,
}

impl SyncError {
    /// Whether the failure is retried under the backoff schedule rather than
    /// surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_) | SyncError::SubscriptionTimeout(_)
        )
    }

    pub(crate) fn subscription(code: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Subscription {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Connection("reset".to_string()).is_retryable());
        assert!(SyncError::SubscriptionTimeout(Duration::from_secs(10)).is_retryable());
        assert!(!SyncError::NotConnected.is_retryable());
        assert!(!SyncError::subscription("FORBIDDEN", "no access").is_retryable());
        assert!(!SyncError::PayloadMalformed("title".to_string()).is_retryable());
    }

    #[test]
    fn test_display_includes_code() {
        let err = SyncError::subscription("FORBIDDEN", "no access to tickets");
        assert_eq!(
            err.to_string(),
            "subscription rejected (FORBIDDEN): no access to tickets"
        );
    }
}
