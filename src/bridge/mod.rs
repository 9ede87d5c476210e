//! Cache invalidation bridge
//!
//! Translates matched change events into invalidation signals on the
//! application's cached views. Several subscription keys may feed the same
//! query key; each matched event invalidates every affected query key once.
//!
//! Bursts are coalesced per query key: the first signal invalidates
//! immediately and starts a cooling window, signals arriving inside the
//! window collapse into a single trailing invalidation when it ends. A gate
//! lives only while its query key is cooling.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sink::CacheInvalidator;
use crate::types::{ChangeEvent, QueryKey, SubscriptionKey};

#[derive(Debug, Default)]
struct Gate {
    cooling: bool,
    dirty: bool,
    /// Removed from the gate map; signals must fetch a fresh gate
    retired: bool,
}

pub struct InvalidationBridge {
    /// (query key, binding count) per subscription key
    bindings: DashMap<SubscriptionKey, Vec<(QueryKey, usize)>>,
    gates: DashMap<QueryKey, Arc<Mutex<Gate>>>,
    invalidator: Arc<dyn CacheInvalidator>,
    window: Duration,
    cancel: CancellationToken,
}

impl InvalidationBridge {
    /// `window` of zero disables coalescing
    pub fn new(
        invalidator: Arc<dyn CacheInvalidator>,
        window: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            bindings: DashMap::new(),
            gates: DashMap::new(),
            invalidator,
            window,
            cancel,
        })
    }

    /// Invalidate `query_key` whenever an event matches `key`
    pub fn bind_invalidation(&self, key: SubscriptionKey, query_key: QueryKey) {
        let mut bound = self.bindings.entry(key).or_default();
        match bound.iter_mut().find(|(qk, _)| *qk == query_key) {
            Some((_, refs)) => *refs += 1,
            None => bound.push((query_key, 1)),
        }
    }

    /// Drop one binding of `query_key` to `key`
    pub fn unbind_invalidation(&self, key: &SubscriptionKey, query_key: &QueryKey) {
        if let Entry::Occupied(mut occupied) = self.bindings.entry(key.clone()) {
            let bound = occupied.get_mut();
            if let Some(pos) = bound.iter().position(|(qk, _)| qk == query_key) {
                bound[pos].1 -= 1;
                if bound[pos].1 == 0 {
                    bound.remove(pos);
                }
            }
            if bound.is_empty() {
                occupied.remove();
            }
        }
    }

    /// Query keys bound to `key`
    pub fn query_keys(&self, key: &SubscriptionKey) -> Vec<QueryKey> {
        self.bindings
            .get(key)
            .map(|bound| bound.iter().map(|(qk, _)| qk.clone()).collect())
            .unwrap_or_default()
    }

    /// Invalidate the distinct query keys bound to any of `keys`
    pub fn on_event(self: &Arc<Self>, keys: &[SubscriptionKey], event: &ChangeEvent) {
        let mut targets: Vec<QueryKey> = Vec::new();
        for key in keys {
            if let Some(bound) = self.bindings.get(key) {
                for (qk, _) in bound.iter() {
                    if !targets.contains(qk) {
                        targets.push(qk.clone());
                    }
                }
            }
        }

        for query_key in targets {
            debug!(
                query_key = %query_key,
                kind = %event.resource_kind,
                seq = event.server_seq,
                "Invalidation signal"
            );
            self.signal(query_key);
        }
    }

    /// Request an invalidation of `query_key`, subject to coalescing
    pub fn signal(self: &Arc<Self>, query_key: QueryKey) {
        if self.window.is_zero() {
            self.invalidator.invalidate(&query_key);
            return;
        }

        let gate = loop {
            let gate = self.gates.entry(query_key.clone()).or_default().clone();
            let mut state = gate.lock();
            if state.retired {
                continue;
            }
            if state.cooling {
                state.dirty = true;
                return;
            }
            state.cooling = true;
            self.invalidator.invalidate(&query_key);
            drop(state);
            break gate;
        };

        let bridge = self.clone();
        tokio::spawn(async move { bridge.cool_down(query_key, gate).await });
    }

    /// Emit trailing invalidations until a whole window passes quietly
    async fn cool_down(&self, query_key: QueryKey, gate: Arc<Mutex<Gate>>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.window) => {}
            }

            let mut state = gate.lock();
            if !state.dirty {
                state.cooling = false;
                state.retired = true;
                self.gates.remove_if(&query_key, |_, current| Arc::ptr_eq(current, &gate));
                return;
            }
            state.dirty = false;
            debug!(query_key = %query_key, "Trailing invalidation");
            self.invalidator.invalidate(&query_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use crate::sink::RecordingSink;
    use crate::types::{Action, EventFilter};
    use serde_json::json;

    fn bridge(window: Duration) -> (Arc<InvalidationBridge>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let bridge = InvalidationBridge::new(sink.clone(), window, CancellationToken::new());
        (bridge, sink)
    }

    fn update() -> ChangeEvent {
        ChangeEvent::new("tickets", Action::Update, json!({"id": 1}), 1)
    }

    #[tokio::test]
    async fn test_one_invalidation_per_query_key() {
        let (bridge, sink) = bridge(Duration::ZERO);
        let any = SubscriptionKey::new("tickets");
        let updates = SubscriptionKey::new("tickets").with_filter(EventFilter::Update);
        bridge.bind_invalidation(any.clone(), query_key!["tickets"]);
        bridge.bind_invalidation(any.clone(), query_key!["tickets"]);
        bridge.bind_invalidation(updates.clone(), query_key!["tickets"]);
        bridge.bind_invalidation(updates.clone(), query_key!["board", 7]);

        bridge.on_event(&[any, updates], &update());

        assert_eq!(
            sink.invalidations(),
            vec![query_key!["tickets"], query_key!["board", 7]]
        );
    }

    #[tokio::test]
    async fn test_unbind_is_refcounted() {
        let (bridge, sink) = bridge(Duration::ZERO);
        let key = SubscriptionKey::new("tickets");
        bridge.bind_invalidation(key.clone(), query_key!["tickets"]);
        bridge.bind_invalidation(key.clone(), query_key!["tickets"]);

        bridge.unbind_invalidation(&key, &query_key!["tickets"]);
        assert_eq!(bridge.query_keys(&key), vec![query_key!["tickets"]]);

        bridge.unbind_invalidation(&key, &query_key!["tickets"]);
        assert!(bridge.query_keys(&key).is_empty());

        bridge.on_event(&[key.clone()], &update());
        assert!(sink.invalidations().is_empty());

        // unknown bindings are ignored
        bridge.unbind_invalidation(&key, &query_key!["other"]);
    }

    #[tokio::test]
    async fn test_zero_window_does_not_coalesce() {
        let (bridge, sink) = bridge(Duration::ZERO);
        for _ in 0..3 {
            bridge.signal(query_key!["tickets"]);
        }
        assert_eq!(sink.invalidations().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_leading_and_trailing() {
        let (bridge, sink) = bridge(Duration::from_millis(50));

        for _ in 0..5 {
            bridge.signal(query_key!["tickets"]);
        }
        assert_eq!(sink.invalidations().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.invalidations().len(), 2);

        // quiet window ends the cycle and frees the gate
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.invalidations().len(), 2);
        assert!(bridge.gates.is_empty());

        bridge.signal(query_key!["tickets"]);
        assert_eq!(sink.invalidations().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_signal_has_no_trailing_edge() {
        let (bridge, sink) = bridge(Duration::from_millis(50));
        bridge.signal(query_key!["tickets"]);
        bridge.signal(query_key!["projects"]);

        assert_eq!(bridge.gates.len(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            sink.invalidations(),
            vec![query_key!["tickets"], query_key!["projects"]]
        );
        assert!(bridge.gates.is_empty());
    }
}
