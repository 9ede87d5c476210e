//! Subscription registry
//!
//! Maps each distinct [`SubscriptionKey`] to exactly one backend
//! subscription, reference counted by consumers. Attach and detach decide
//! atomically per key through the `DashMap` entry API; no map guard is ever
//! held across an `.await`.
//!
//! Entries survive connection loss. Every new connection epoch re-attaches
//! whatever is not already live on it, so consumers never call `attach`
//! again after a reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Backoff, ConnectionManager, ConnectionState};
use crate::error::{SyncError, SyncResult};
use crate::protocol::ClientMessage;
use crate::sink::{Diagnostic, DiagnosticSink};
use crate::types::{new_subscription_uid, ChangeEvent, ConsumerId, SubscriptionKey};

/// Where an entry's backend subscription stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    /// First subscribe request in flight
    Pending,
    /// Acknowledged on connection epoch `epoch`
    Live { epoch: u64 },
    /// Subscribe timed out or the link dropped; retrying with backoff
    Degraded { attempts: u32 },
    /// Rejected or not connected; the entry is gone and is not retried
    Failed(SyncError),
    /// Last consumer detached; the entry is gone
    Closed,
}

/// Returned by [`SubscriptionRegistry::attach`]
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub key: SubscriptionKey,
    pub consumer: ConsumerId,
    status: watch::Receiver<EntryStatus>,
}

impl SubscriptionHandle {
    /// Current status of the shared subscription
    pub fn status(&self) -> EntryStatus {
        self.status.borrow().clone()
    }

    /// Wait until the subscription is live on some epoch. Returns the final
    /// status instead if the entry goes away first.
    pub async fn live(&mut self) -> EntryStatus {
        loop {
            let status = self.status.borrow_and_update().clone();
            if matches!(
                status,
                EntryStatus::Live { .. } | EntryStatus::Failed(_) | EntryStatus::Closed
            ) {
                return status;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

/// Entries and consumers matched by one change event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSet {
    pub keys: Vec<SubscriptionKey>,
    /// Deduplicated, in global registration order
    pub consumers: Vec<ConsumerId>,
    /// One per (consumer, key) attachment, in global registration order
    pub deliveries: Vec<(ConsumerId, SubscriptionKey)>,
}

impl MatchSet {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

struct SubscriptionEntry {
    /// Uid of the current (or last) subscribe attempt
    uid: String,
    consumers: Vec<(ConsumerId, u64)>,
    status: watch::Sender<EntryStatus>,
    /// A subscribe request for this entry is outstanding
    in_flight: bool,
}

enum Role {
    Creator(String),
    Joiner(watch::Receiver<EntryStatus>),
}

pub struct SubscriptionRegistry {
    entries: DashMap<SubscriptionKey, SubscriptionEntry>,
    order: AtomicU64,
    connection: Arc<ConnectionManager>,
    backoff: Backoff,
    diagnostics: Arc<dyn DiagnosticSink>,
    cancel: CancellationToken,
}

impl SubscriptionRegistry {
    /// `cancel` stops the re-attach loop and every background retry.
    /// Rejections met while retrying in the background go to `diagnostics`.
    pub fn new(
        connection: Arc<ConnectionManager>,
        diagnostics: Arc<dyn DiagnosticSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            order: AtomicU64::new(0),
            backoff: connection.backoff(),
            connection,
            diagnostics,
            cancel,
        })
    }

    // ==================== Attach / detach ====================

    /// Add `consumer` to the entry for `key`, opening the backend
    /// subscription if this is the first consumer.
    pub async fn attach(
        self: &Arc<Self>,
        consumer: ConsumerId,
        key: SubscriptionKey,
    ) -> SyncResult<SubscriptionHandle> {
        let order = self.order.fetch_add(1, Ordering::Relaxed);

        let role = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !entry.consumers.iter().any(|(c, _)| *c == consumer) {
                    entry.consumers.push((consumer, order));
                }
                Role::Joiner(entry.status.subscribe())
            }
            Entry::Vacant(vacant) => {
                let uid = new_subscription_uid();
                let (status, _) = watch::channel(EntryStatus::Pending);
                vacant.insert(SubscriptionEntry {
                    uid: uid.clone(),
                    consumers: vec![(consumer, order)],
                    status,
                    in_flight: true,
                });
                Role::Creator(uid)
            }
        };

        match role {
            Role::Joiner(status) => {
                debug!(key = %key, consumer = %consumer, "Joined existing subscription");
                self.join(consumer, key, status).await
            }
            Role::Creator(uid) => {
                debug!(key = %key, consumer = %consumer, uid = %uid, "Opening subscription");
                self.create(consumer, key, uid).await
            }
        }
    }

    async fn create(
        self: &Arc<Self>,
        consumer: ConsumerId,
        key: SubscriptionKey,
        uid: String,
    ) -> SyncResult<SubscriptionHandle> {
        let status = self
            .entries
            .get(&key)
            .map(|entry| entry.status.subscribe());

        match self.open(&key, &uid).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!(key = %key, error = %e, "Subscription degraded; retrying in background");
                self.degrade(&key, &uid, 1);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Subscription failed");
                self.fail(&key, &uid, e.clone());
                return Err(e);
            }
        }

        let status = match status {
            Some(status) => status,
            // detached while the request was in flight
            None => watch::channel(EntryStatus::Closed).1,
        };
        Ok(SubscriptionHandle {
            key,
            consumer,
            status,
        })
    }

    async fn join(
        &self,
        consumer: ConsumerId,
        key: SubscriptionKey,
        mut status: watch::Receiver<EntryStatus>,
    ) -> SyncResult<SubscriptionHandle> {
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                EntryStatus::Pending => {}
                EntryStatus::Live { .. } | EntryStatus::Degraded { .. } => {
                    return Ok(SubscriptionHandle {
                        key,
                        consumer,
                        status,
                    })
                }
                EntryStatus::Failed(e) => return Err(e),
                EntryStatus::Closed => return Err(SyncError::Closed),
            }
            if status.changed().await.is_err() {
                return match status.borrow().clone() {
                    EntryStatus::Failed(e) => Err(e),
                    _ => Err(SyncError::Closed),
                };
            }
        }
    }

    /// Remove `consumer` from the entry for `key`. The last consumer out
    /// closes the backend subscription. Unknown keys and consumers are a no-op.
    pub async fn detach(self: &Arc<Self>, consumer: ConsumerId, key: &SubscriptionKey) {
        let removed = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().consumers.retain(|(c, _)| *c != consumer);
                if occupied.get().consumers.is_empty() {
                    Some(occupied.remove())
                } else {
                    None
                }
            }
            Entry::Vacant(_) => None,
        };

        let Some(entry) = removed else {
            return;
        };
        let previous = entry.status.send_replace(EntryStatus::Closed);
        debug!(key = %key, uid = %entry.uid, "Last consumer detached");

        // an in-flight subscribe finds its entry gone and closes itself
        if let (EntryStatus::Live { epoch }, false) = (previous, entry.in_flight) {
            self.close_remote(entry.uid, epoch).await;
        }
    }

    // ==================== Backend requests ====================

    /// Subscribe `uid` for `key`. On acknowledgement the entry goes live,
    /// or the subscription is closed again if its entry was removed meanwhile.
    async fn open(self: &Arc<Self>, key: &SubscriptionKey, uid: &str) -> SyncResult<u64> {
        let epoch = match self.connection.subscribe(uid, key).await {
            Ok(epoch) => epoch,
            Err(e) => {
                if matches!(e, SyncError::SubscriptionTimeout(_)) {
                    // a late acknowledgement must not leave a stray subscription
                    let _ = self.connection.send(ClientMessage::unsubscribe(uid)).await;
                }
                return Err(e);
            }
        };

        if self.settle(key, uid, EntryStatus::Live { epoch }) {
            info!(key = %key, uid, epoch, "Subscription live");
            if self.connection.is_open() && self.connection.epoch() != epoch {
                // acknowledged on a link that has since been replaced
                self.spawn_retry(key.clone(), 0);
            }
        } else {
            debug!(key = %key, uid, "Acknowledged after removal; closing");
            self.close_remote(uid.to_string(), epoch).await;
        }
        Ok(epoch)
    }

    /// Set the status of the entry for `key` if `uid` is still its current
    /// attempt, releasing the in-flight claim
    fn settle(&self, key: &SubscriptionKey, uid: &str, status: EntryStatus) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.uid == uid => {
                entry.in_flight = false;
                entry.status.send_replace(status);
                true
            }
            _ => false,
        }
    }

    /// Remove the entry for `key` if `uid` is still its current attempt,
    /// leaving `error` as the final status for every handle
    fn fail(&self, key: &SubscriptionKey, uid: &str, error: SyncError) -> bool {
        match self.entries.remove_if(key, |_, entry| entry.uid == uid) {
            Some((_, entry)) => {
                entry.status.send_replace(EntryStatus::Failed(error));
                true
            }
            None => false,
        }
    }

    /// Give up on an entry whose background re-subscribe was rejected
    fn abandon(&self, key: &SubscriptionKey, uid: &str, error: SyncError) {
        let message = error.to_string();
        if self.fail(key, uid, error) {
            warn!(key = %key, error = %message, "Subscription rejected; giving up");
            self.diagnostics.report(Diagnostic::SubscriptionFailed {
                key: key.clone(),
                message,
            });
        }
    }

    fn degrade(self: &Arc<Self>, key: &SubscriptionKey, uid: &str, attempts: u32) {
        if self.settle(key, uid, EntryStatus::Degraded { attempts }) {
            self.spawn_retry(key.clone(), attempts);
        }
    }

    /// Claim the entry for a new subscribe attempt unless it is already live
    /// on the current epoch or another attempt is outstanding
    fn claim(&self, key: &SubscriptionKey) -> Option<String> {
        let epoch = self.connection.epoch();
        let mut entry = self.entries.get_mut(key)?;
        let live_now = matches!(*entry.status.borrow(), EntryStatus::Live { epoch: e } if e == epoch);
        if entry.in_flight || live_now {
            return None;
        }
        let uid = new_subscription_uid();
        entry.uid = uid.clone();
        entry.in_flight = true;
        Some(uid)
    }

    fn spawn_retry(self: &Arc<Self>, key: SubscriptionKey, mut failures: u32) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = registry.backoff.delay(failures.saturating_sub(1));
                tokio::select! {
                    biased;
                    _ = registry.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                // the next epoch re-attaches it
                if !registry.connection.is_open() {
                    return;
                }
                let Some(uid) = registry.claim(&key) else {
                    return;
                };
                match registry.open(&key, &uid).await {
                    Ok(_) => return,
                    Err(e @ SyncError::Subscription { .. }) => {
                        registry.abandon(&key, &uid, e);
                        return;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        debug!(key = %key, error = %e, failures, "Subscription retry failed");
                        if !registry.settle(&key, &uid, EntryStatus::Degraded { attempts: failures }) {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Best-effort unsubscribe. Timeouts are retried in the background while
    /// the epoch the subscription lives on is still open.
    async fn close_remote(self: &Arc<Self>, uid: String, epoch: u64) {
        if self.unsubscribe_once(&uid, epoch).await {
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let delay = registry.backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    biased;
                    _ = registry.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if registry.unsubscribe_once(&uid, epoch).await {
                    return;
                }
            }
        });
    }

    /// `true` when nothing is left to do for this uid
    async fn unsubscribe_once(&self, uid: &str, epoch: u64) -> bool {
        if !self.connection.is_open() || self.connection.epoch() != epoch {
            debug!(uid, epoch, "Subscription ended with its connection");
            return true;
        }
        match self.connection.unsubscribe(uid).await {
            Ok(()) => {
                debug!(uid, "Subscription closed");
                true
            }
            Err(SyncError::SubscriptionTimeout(timeout)) => {
                warn!(uid, ?timeout, "Unsubscribe not acknowledged");
                false
            }
            Err(e) => {
                debug!(uid, error = %e, "Unsubscribe failed");
                true
            }
        }
    }

    // ==================== Re-attach ====================

    /// Re-subscribe every entry not live on the current epoch, concurrently.
    /// Returns how many entries were attempted.
    pub async fn reattach_all(self: &Arc<Self>) -> usize {
        let keys: Vec<SubscriptionKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let claimed: Vec<(SubscriptionKey, String)> = keys
            .into_iter()
            .filter_map(|key| self.claim(&key).map(|uid| (key, uid)))
            .collect();
        if claimed.is_empty() {
            return 0;
        }

        info!(
            count = claimed.len(),
            epoch = self.connection.epoch(),
            "Re-attaching subscriptions"
        );
        let outcomes = join_all(claimed.iter().map(|(key, uid)| self.open(key, uid))).await;

        for ((key, uid), outcome) in claimed.iter().zip(outcomes) {
            match outcome {
                Ok(_) => {}
                Err(e @ SyncError::Subscription { .. }) => self.abandon(key, uid, e),
                Err(e) => {
                    warn!(key = %key, error = %e, "Re-attach failed");
                    self.degrade(key, uid, 1);
                }
            }
        }
        claimed.len()
    }

    /// Watch the connection and re-attach on every new epoch. Runs until the
    /// registry's cancellation token fires.
    pub async fn run_reattach(self: Arc<Self>) {
        let mut state = self.connection.watch_state();
        let mut handled = 0u64;

        loop {
            let snapshot = state.borrow_and_update().clone();
            if snapshot.state == ConnectionState::Open && snapshot.epoch > handled {
                handled = snapshot.epoch;
                self.reattach_all().await;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Re-attach loop stopped");
    }

    // ==================== Queries ====================

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries live on the current epoch
    pub fn live_count(&self) -> usize {
        let epoch = self.connection.epoch();
        self.entries
            .iter()
            .filter(|e| matches!(*e.status.borrow(), EntryStatus::Live { epoch: live } if live == epoch))
            .count()
    }

    pub fn status(&self, key: &SubscriptionKey) -> Option<EntryStatus> {
        self.entries.get(key).map(|e| e.status.borrow().clone())
    }

    /// Consumers of `key` in registration order
    pub fn consumers(&self, key: &SubscriptionKey) -> Vec<ConsumerId> {
        self.entries
            .get(key)
            .map(|e| e.consumers.iter().map(|(c, _)| *c).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Entries whose key matches `event`, and their consumers
    pub fn matching(&self, event: &ChangeEvent) -> MatchSet {
        let mut keys = Vec::new();
        let mut ordered: Vec<(u64, ConsumerId, SubscriptionKey)> = Vec::new();

        for entry in self.entries.iter() {
            if !entry.key().matches(event) {
                continue;
            }
            keys.push(entry.key().clone());
            ordered.extend(
                entry
                    .consumers
                    .iter()
                    .map(|(c, order)| (*order, *c, entry.key().clone())),
            );
        }

        ordered.sort_by_key(|(order, _, _)| *order);
        let mut consumers: Vec<ConsumerId> = Vec::with_capacity(ordered.len());
        let mut deliveries = Vec::with_capacity(ordered.len());
        for (_, consumer, key) in ordered {
            if !consumers.contains(&consumer) {
                consumers.push(consumer);
            }
            deliveries.push((consumer, key));
        }
        keys.sort_by_key(|k| k.to_string());

        MatchSet {
            keys,
            consumers,
            deliveries,
        }
    }
}
