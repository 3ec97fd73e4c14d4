//! Subscription registry: provider lifecycle and reference counting.
//!
//! Owned exclusively by the dispatcher task, so plain maps suffice — the
//! single-consumer dispatch loop serializes every mutation. The registry is
//! the only component allowed to create, command, or tear down providers.

use std::collections::HashMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::MuxError;
use crate::protocol::{ClientId, ProviderId, ProviderState, SubscriberId};
use crate::provider::ProviderHandle;
use crate::session::ProviderEvent;

/// A caller parked on an in-flight provider connect.
#[derive(Debug)]
pub struct PendingAttach {
    pub client_id: ClientId,
    pub subscriber_id: SubscriberId,
    pub correlation_id: String,
}

/// Most recent snapshot for one provider. Batches accumulate in `building`;
/// only a finished cycle is ever promoted to `complete`, so late joiners
/// never see a partial snapshot.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    building: Vec<Value>,
    complete: Option<Vec<Value>>,
}

impl SnapshotCache {
    fn absorb(&mut self, event: &ProviderEvent) {
        match event {
            ProviderEvent::SnapshotBatch { records, .. } => {
                self.building.extend(records.iter().cloned());
            }
            ProviderEvent::SnapshotComplete => {
                self.complete = Some(std::mem::take(&mut self.building));
            }
            // A fresh snapshot cycle invalidates whatever we had.
            ProviderEvent::Status(ProviderState::AwaitingSnapshot) => {
                self.building.clear();
                self.complete = None;
            }
            _ => {}
        }
    }

    pub fn complete(&self) -> Option<&[Value]> {
        self.complete.as_deref()
    }
}

struct ProviderEntry {
    state: ProviderState,
    handle: Option<ProviderHandle>,
    subscribers: HashMap<SubscriberId, ClientId>,
    pending: Vec<PendingAttach>,
    snapshot: SnapshotCache,
}

/// Result of attaching a subscriber to an already-connected provider.
#[derive(Debug)]
pub struct AttachReply {
    pub state: ProviderState,
    /// Complete cached snapshot to replay to the new subscriber only.
    pub replay: Option<(Vec<Value>, usize)>,
    /// Channel that previously owned this subscriber id, if the attach
    /// moved the mapping.
    pub displaced: Option<ClientId>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    providers: HashMap<ProviderId, ProviderEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    pub fn state(&self, provider_id: &str) -> Option<ProviderState> {
        self.providers.get(provider_id).map(|e| e.state)
    }

    fn is_pending(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .is_some_and(|e| e.handle.is_none())
    }

    /// Park a waiter on the provider's in-flight connect. Returns false if
    /// the provider is absent or already connected.
    pub fn join_pending(&mut self, provider_id: &str, waiter: PendingAttach) -> bool {
        if !self.is_pending(provider_id) {
            return false;
        }
        debug!(provider = %provider_id, client = waiter.client_id, "joining in-flight connect");
        self.providers
            .get_mut(provider_id)
            .map(|e| e.pending.push(waiter))
            .is_some()
    }

    /// Create the entry for a provider about to connect, with the first
    /// waiter parked. Callers must have checked `contains` first; this is
    /// the pending-creation guard that keeps one physical connection per id.
    pub fn begin_connect(&mut self, provider_id: &str, waiter: PendingAttach) {
        debug_assert!(!self.providers.contains_key(provider_id));
        info!(provider = %provider_id, "creating provider");
        self.providers.insert(
            provider_id.to_string(),
            ProviderEntry {
                state: ProviderState::Connecting,
                handle: None,
                subscribers: HashMap::new(),
                pending: vec![waiter],
                snapshot: SnapshotCache::default(),
            },
        );
    }

    /// Connect finished: store the handle, register every parked waiter as
    /// a subscriber, and hand them back for acknowledgement.
    pub fn complete_connect(
        &mut self,
        provider_id: &str,
        handle: ProviderHandle,
    ) -> Vec<PendingAttach> {
        let Some(entry) = self.providers.get_mut(provider_id) else {
            return Vec::new();
        };
        entry.state = handle.initial_state;
        entry.handle = Some(handle);
        let waiters = std::mem::take(&mut entry.pending);
        for waiter in &waiters {
            entry
                .subscribers
                .insert(waiter.subscriber_id.clone(), waiter.client_id);
        }
        info!(
            provider = %provider_id,
            subscribers = entry.subscribers.len(),
            "provider connect complete"
        );
        waiters
    }

    /// Connect failed: drop the entry so a retry can recreate it, returning
    /// the waiters so each can be told.
    pub fn fail_connect(&mut self, provider_id: &str) -> Vec<PendingAttach> {
        self.providers
            .remove(provider_id)
            .map(|e| e.pending)
            .unwrap_or_default()
    }

    /// Attach a subscriber to a connected provider.
    pub fn attach(
        &mut self,
        provider_id: &str,
        subscriber_id: &str,
        client_id: ClientId,
    ) -> Result<AttachReply, MuxError> {
        let entry = self
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| MuxError::ProviderNotFound(provider_id.to_string()))?;
        if entry.handle.is_none() {
            return Err(MuxError::NotConnected(provider_id.to_string()));
        }

        // A subscriber id maps to exactly one channel; re-attach moves it.
        let displaced = entry
            .subscribers
            .insert(subscriber_id.to_string(), client_id)
            .filter(|old| *old != client_id);

        let replay = entry
            .snapshot
            .complete()
            .map(|records| (records.to_vec(), records.len()));

        Ok(AttachReply {
            state: entry.state,
            replay,
            displaced,
        })
    }

    /// Remove a subscription. Returns the provider handle when this was the
    /// last subscriber, so the caller can close the connection — the entry
    /// and its snapshot cache are already gone by then.
    pub fn detach(
        &mut self,
        provider_id: &str,
        subscriber_id: &str,
    ) -> Result<Option<ProviderHandle>, MuxError> {
        let entry = self
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| MuxError::ProviderNotFound(provider_id.to_string()))?;

        if entry.subscribers.remove(subscriber_id).is_none() {
            return Err(MuxError::ProviderNotFound(format!(
                "{}/{}",
                provider_id, subscriber_id
            )));
        }

        if entry.subscribers.is_empty() && entry.pending.is_empty() {
            info!(provider = %provider_id, "last subscriber detached, tearing down");
            return Ok(self.providers.remove(provider_id).and_then(|e| e.handle));
        }
        Ok(None)
    }

    /// Command handle for a connected provider.
    pub fn handle(&self, provider_id: &str) -> Result<&ProviderHandle, MuxError> {
        self.providers
            .get(provider_id)
            .ok_or_else(|| MuxError::NotConnected(provider_id.to_string()))?
            .handle
            .as_ref()
            .ok_or_else(|| MuxError::NotConnected(provider_id.to_string()))
    }

    /// Channels holding at least one subscription to this provider.
    pub fn subscribers_of(&self, provider_id: &str) -> Vec<ClientId> {
        let Some(entry) = self.providers.get(provider_id) else {
            return Vec::new();
        };
        let mut clients: Vec<ClientId> = entry.subscribers.values().copied().collect();
        clients.sort_unstable();
        clients.dedup();
        clients
    }

    /// Fold a provider event into the entry's state and snapshot cache.
    /// Returns false for providers already torn down (stale events).
    pub fn absorb_event(&mut self, provider_id: &str, event: &ProviderEvent) -> bool {
        let Some(entry) = self.providers.get_mut(provider_id) else {
            return false;
        };
        if let ProviderEvent::Status(state) = event {
            entry.state = *state;
        }
        entry.snapshot.absorb(event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn handle(state: ProviderState) -> ProviderHandle {
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        ProviderHandle {
            cmd_tx,
            initial_state: state,
        }
    }

    fn waiter(client_id: ClientId, subscriber: &str) -> PendingAttach {
        PendingAttach {
            client_id,
            subscriber_id: subscriber.to_string(),
            correlation_id: format!("c-{}", client_id),
        }
    }

    #[test]
    fn test_pending_guard_joins_waiters() {
        let mut registry = SubscriptionRegistry::new();
        registry.begin_connect("p1", waiter(1, "s1"));
        assert!(registry.contains("p1"));
        assert_eq!(registry.state("p1"), Some(ProviderState::Connecting));

        // Second attach for the same unseen id joins, never re-creates.
        assert!(registry.join_pending("p1", waiter(2, "s2")));

        let waiters = registry.complete_connect("p1", handle(ProviderState::AwaitingSnapshot));
        assert_eq!(waiters.len(), 2);
        assert_eq!(registry.state("p1"), Some(ProviderState::AwaitingSnapshot));
        let mut clients = registry.subscribers_of("p1");
        clients.sort_unstable();
        assert_eq!(clients, vec![1, 2]);
    }

    #[test]
    fn test_join_pending_rejects_connected() {
        let mut registry = SubscriptionRegistry::new();
        registry.begin_connect("p1", waiter(1, "s1"));
        registry.complete_connect("p1", handle(ProviderState::Streaming));
        assert!(!registry.join_pending("p1", waiter(2, "s2")));
        assert!(!registry.join_pending("p2", waiter(2, "s2")));
    }

    #[test]
    fn test_fail_connect_removes_entry() {
        let mut registry = SubscriptionRegistry::new();
        registry.begin_connect("p1", waiter(1, "s1"));
        registry.join_pending("p1", waiter(2, "s2"));

        let waiters = registry.fail_connect("p1");
        assert_eq!(waiters.len(), 2);
        assert!(!registry.contains("p1"));
    }

    #[test]
    fn test_detach_last_returns_handle() {
        let mut registry = SubscriptionRegistry::new();
        registry.begin_connect("p1", waiter(1, "s1"));
        registry.complete_connect("p1", handle(ProviderState::Streaming));
        registry.attach("p1", "s2", 2).unwrap();

        assert!(registry.detach("p1", "s1").unwrap().is_none());
        let closed = registry.detach("p1", "s2").unwrap();
        assert!(closed.is_some());
        assert!(!registry.contains("p1"));
    }

    #[test]
    fn test_detach_unknown() {
        let mut registry = SubscriptionRegistry::new();
        assert!(matches!(
            registry.detach("p1", "s1").unwrap_err(),
            MuxError::ProviderNotFound(_)
        ));
    }

    #[test]
    fn test_attach_replays_only_complete_snapshot() {
        let mut registry = SubscriptionRegistry::new();
        registry.begin_connect("p1", waiter(1, "s1"));
        registry.complete_connect("p1", handle(ProviderState::AwaitingSnapshot));

        registry.absorb_event(
            "p1",
            &ProviderEvent::SnapshotBatch {
                records: vec![json!({"row": 1})],
                is_partial: true,
                total_received: 1,
            },
        );
        // Still building: nothing to replay.
        let reply = registry.attach("p1", "s2", 2).unwrap();
        assert!(reply.replay.is_none());

        registry.absorb_event("p1", &ProviderEvent::SnapshotComplete);
        registry.absorb_event("p1", &ProviderEvent::Status(ProviderState::Streaming));

        let reply = registry.attach("p1", "s3", 3).unwrap();
        assert_eq!(reply.state, ProviderState::Streaming);
        let (records, total) = reply.replay.unwrap();
        assert_eq!(records, vec![json!({"row": 1})]);
        assert_eq!(total, 1);
    }

    #[test]
    fn test_refresh_clears_cache() {
        let mut registry = SubscriptionRegistry::new();
        registry.begin_connect("p1", waiter(1, "s1"));
        registry.complete_connect("p1", handle(ProviderState::AwaitingSnapshot));
        registry.absorb_event(
            "p1",
            &ProviderEvent::SnapshotBatch {
                records: vec![json!(1)],
                is_partial: false,
                total_received: 1,
            },
        );
        registry.absorb_event("p1", &ProviderEvent::SnapshotComplete);

        registry.absorb_event("p1", &ProviderEvent::Status(ProviderState::AwaitingSnapshot));
        let reply = registry.attach("p1", "s2", 2).unwrap();
        assert!(reply.replay.is_none());
    }

    #[test]
    fn test_reattach_moves_subscriber_mapping() {
        let mut registry = SubscriptionRegistry::new();
        registry.begin_connect("p1", waiter(1, "s1"));
        registry.complete_connect("p1", handle(ProviderState::Streaming));

        let reply = registry.attach("p1", "s1", 2).unwrap();
        assert_eq!(reply.displaced, Some(1));
        assert_eq!(registry.subscribers_of("p1"), vec![2]);

        // Same channel re-attaching displaces nothing.
        let reply = registry.attach("p1", "s1", 2).unwrap();
        assert_eq!(reply.displaced, None);
    }

    #[test]
    fn test_stale_events_ignored() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.absorb_event("gone", &ProviderEvent::SnapshotComplete));
    }
}
