//! Client channel manager: per-channel outbound queues and liveness.
//!
//! Like the registry, this lives inside the dispatcher task and is never
//! shared. Channels are identified by a monotonically assigned id; the
//! WebSocket layer keeps the receiving half of each queue.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::{ClientId, ProviderId, ServerEvent, SubscriberId};

struct ClientChannel {
    tx: mpsc::Sender<ServerEvent>,
    subscriptions: HashSet<(ProviderId, SubscriberId)>,
    last_activity: Instant,
}

#[derive(Default)]
pub struct ChannelManager {
    clients: HashMap<ClientId, ClientChannel>,
    next_id: ClientId,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Register a new channel and hand back its id.
    pub fn register(&mut self, tx: mpsc::Sender<ServerEvent>) -> ClientId {
        self.next_id += 1;
        let id = self.next_id;
        self.clients.insert(
            id,
            ClientChannel {
                tx,
                subscriptions: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
        debug!(client = id, total = self.clients.len(), "channel registered");
        id
    }

    /// Drop a channel, returning its subscriptions so the caller can detach
    /// each one from the registry.
    pub fn remove(&mut self, client_id: ClientId) -> Vec<(ProviderId, SubscriberId)> {
        let Some(channel) = self.clients.remove(&client_id) else {
            return Vec::new();
        };
        debug!(client = client_id, total = self.clients.len(), "channel removed");
        channel.subscriptions.into_iter().collect()
    }

    /// Any inbound message counts as liveness.
    pub fn touch(&mut self, client_id: ClientId) {
        if let Some(channel) = self.clients.get_mut(&client_id) {
            channel.last_activity = Instant::now();
        }
    }

    pub fn add_subscription(
        &mut self,
        client_id: ClientId,
        provider_id: &str,
        subscriber_id: &str,
    ) {
        if let Some(channel) = self.clients.get_mut(&client_id) {
            channel
                .subscriptions
                .insert((provider_id.to_string(), subscriber_id.to_string()));
        }
    }

    pub fn remove_subscription(
        &mut self,
        client_id: ClientId,
        provider_id: &str,
        subscriber_id: &str,
    ) {
        if let Some(channel) = self.clients.get_mut(&client_id) {
            channel
                .subscriptions
                .remove(&(provider_id.to_string(), subscriber_id.to_string()));
        }
    }

    /// Queue an event for one channel. A missing channel means the client
    /// raced its own disconnect; a full queue drops the event rather than
    /// stalling the dispatcher.
    pub fn send(&self, client_id: ClientId, event: ServerEvent) {
        let Some(channel) = self.clients.get(&client_id) else {
            return;
        };
        if channel.tx.try_send(event).is_err() {
            warn!(client = client_id, "channel queue full, dropping event");
        }
    }

    /// Channels with no inbound activity for longer than `timeout`.
    pub fn idle_clients(&self, timeout: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        self.clients
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_activity) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(corr: &str) -> ServerEvent {
        ServerEvent::Pong {
            correlation_id: corr.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let mut manager = ChannelManager::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = manager.register(tx);
        assert_eq!(manager.len(), 1);
        assert!(manager.contains(id));

        manager.send(id, pong("c-1"));
        assert!(matches!(rx.recv().await, Some(ServerEvent::Pong { .. })));
    }

    #[tokio::test]
    async fn test_send_to_missing_channel_is_silent() {
        let manager = ChannelManager::new();
        manager.send(99, pong("c-2"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_event() {
        let mut manager = ChannelManager::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = manager.register(tx);

        manager.send(id, pong("c-3"));
        manager.send(
            id,
            ServerEvent::Ack {
                correlation_id: "c-4".to_string(),
            },
        );

        match rx.recv().await {
            Some(ServerEvent::Pong { correlation_id }) => assert_eq!(correlation_id, "c-3"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_returns_subscriptions() {
        let mut manager = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = manager.register(tx);
        manager.add_subscription(id, "p1", "s1");
        manager.add_subscription(id, "p2", "s2");
        manager.remove_subscription(id, "p2", "s2");

        let mut subs = manager.remove(id);
        subs.sort();
        assert_eq!(subs, vec![("p1".to_string(), "s1".to_string())]);
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clients_by_inactivity() {
        let mut manager = ChannelManager::new();
        let (tx, _rx1) = mpsc::channel(4);
        let idle = manager.register(tx);
        let (tx, _rx2) = mpsc::channel(4);
        let active = manager.register(tx);

        tokio::time::advance(Duration::from_secs(45)).await;
        manager.touch(active);
        tokio::time::advance(Duration::from_secs(30)).await;

        let idle_ids = manager.idle_clients(Duration::from_secs(60));
        assert_eq!(idle_ids, vec![idle]);
    }
}
