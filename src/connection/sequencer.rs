//! Per-resource-kind ordering of incoming changes

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{Action, ChangeEvent};

/// Decodes change messages and enforces per-kind sequence order.
///
/// Lives for one connection epoch: watermarks from a previous link are
/// meaningless after a reconnect (the backend may have restarted).
#[derive(Debug, Default)]
pub(crate) struct Sequencer {
    watermarks: HashMap<String, u64>,
    dropped: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn a wire change into a `ChangeEvent`, or `None` if it is malformed
    /// or not newer than what was already delivered for its kind.
    pub fn admit(
        &mut self,
        collection: String,
        action: &str,
        data: Value,
        seq: Option<u64>,
    ) -> Option<ChangeEvent> {
        if collection.is_empty() {
            warn!(action, "Dropping change without collection");
            return None;
        }
        let Some(action) = Action::parse(action) else {
            warn!(collection = %collection, action, "Dropping change with unknown action");
            return None;
        };

        let last = self.watermarks.get(&collection).copied();
        let seq = match (seq, last) {
            (Some(seq), Some(last)) if seq <= last => {
                self.dropped += 1;
                debug!(collection = %collection, seq, last, "Dropping stale change");
                return None;
            }
            (Some(seq), _) => seq,
            (None, last) => last.unwrap_or(0).saturating_add(1),
        };

        self.watermarks.insert(collection.clone(), seq);
        Some(ChangeEvent::new(collection, action, data, seq))
    }

    /// Changes discarded as stale or replayed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assigns_local_sequence_when_missing() {
        let mut seq = Sequencer::new();
        let a = seq.admit("tickets".into(), "create", json!({}), None).unwrap();
        let b = seq.admit("tickets".into(), "update", json!({}), None).unwrap();
        let c = seq.admit("projects".into(), "update", json!({}), None).unwrap();
        assert_eq!((a.server_seq, b.server_seq, c.server_seq), (1, 2, 1));
    }

    #[test]
    fn test_local_sequence_saturates() {
        let mut seq = Sequencer::new();
        seq.admit("tickets".into(), "update", json!({}), Some(u64::MAX)).unwrap();
        let next = seq.admit("tickets".into(), "update", json!({}), None).unwrap();
        assert_eq!(next.server_seq, u64::MAX);
    }

    #[test]
    fn test_drops_stale_and_replayed() {
        let mut seq = Sequencer::new();
        assert!(seq.admit("tickets".into(), "update", json!({}), Some(5)).is_some());
        assert!(seq.admit("tickets".into(), "update", json!({}), Some(5)).is_none());
        assert!(seq.admit("tickets".into(), "update", json!({}), Some(3)).is_none());
        assert!(seq.admit("tickets".into(), "update", json!({}), Some(6)).is_some());
        assert_eq!(seq.dropped(), 2);
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut seq = Sequencer::new();
        assert!(seq.admit("tickets".into(), "update", json!({}), Some(10)).is_some());
        assert!(seq.admit("projects".into(), "update", json!({}), Some(1)).is_some());
    }

    #[test]
    fn test_gaps_are_allowed() {
        let mut seq = Sequencer::new();
        assert!(seq.admit("tickets".into(), "update", json!({}), Some(1)).is_some());
        let ev = seq.admit("tickets".into(), "update", json!({}), Some(9)).unwrap();
        assert_eq!(ev.server_seq, 9);
        let next = seq.admit("tickets".into(), "delete", json!({}), None).unwrap();
        assert_eq!(next.server_seq, 10);
    }

    #[test]
    fn test_rejects_malformed() {
        let mut seq = Sequencer::new();
        assert!(seq.admit("tickets".into(), "archive", json!({}), Some(1)).is_none());
        assert!(seq.admit(String::new(), "create", json!({}), Some(1)).is_none());
        // malformed messages do not move the watermark
        assert!(seq.admit("tickets".into(), "create", json!({}), Some(1)).is_some());
    }
}
