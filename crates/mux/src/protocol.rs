//! Control-plane message vocabulary
//!
//! One JSON text frame per message on the client-facing WebSocket. Every
//! request carries a correlation id echoed back on direct replies.

use gridmux_metadata::ProviderConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies one logical data source configuration.
pub type ProviderId = String;
/// Identifies one logical consumer inside one client context.
pub type SubscriberId = String;
/// Identifies one connected client context (browser tab).
pub type ClientId = u64;

/// Provider lifecycle as visible on the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Disconnected,
    Connecting,
    /// Connected, accumulating the initial snapshot backlog.
    AwaitingSnapshot,
    /// Connected, snapshot delivered, forwarding live updates.
    Streaming,
}

/// Inbound messages from a client context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ClientRequest {
    /// Attach a subscriber, creating and connecting the provider if needed.
    Connect {
        correlation_id: String,
        provider_id: ProviderId,
        subscriber_id: SubscriberId,
        /// Inline configuration; absent, it is resolved from the store.
        #[serde(default)]
        config: Option<ProviderConfig>,
    },
    Disconnect {
        correlation_id: String,
        provider_id: ProviderId,
        subscriber_id: SubscriberId,
    },
    /// As Connect, but never initiates a network connect. Late joiners.
    Subscribe {
        correlation_id: String,
        provider_id: ProviderId,
        subscriber_id: SubscriberId,
    },
    Unsubscribe {
        correlation_id: String,
        provider_id: ProviderId,
        subscriber_id: SubscriberId,
    },
    /// Fire-and-forget send through the provider's trigger destination.
    Trigger {
        correlation_id: String,
        provider_id: ProviderId,
        payload: String,
    },
    Ping { correlation_id: String },
}

impl ClientRequest {
    pub fn correlation_id(&self) -> &str {
        match self {
            ClientRequest::Connect { correlation_id, .. }
            | ClientRequest::Disconnect { correlation_id, .. }
            | ClientRequest::Subscribe { correlation_id, .. }
            | ClientRequest::Unsubscribe { correlation_id, .. }
            | ClientRequest::Trigger { correlation_id, .. }
            | ClientRequest::Ping { correlation_id } => correlation_id,
        }
    }

    pub fn provider_id(&self) -> Option<&str> {
        match self {
            ClientRequest::Connect { provider_id, .. }
            | ClientRequest::Disconnect { provider_id, .. }
            | ClientRequest::Subscribe { provider_id, .. }
            | ClientRequest::Unsubscribe { provider_id, .. }
            | ClientRequest::Trigger { provider_id, .. } => Some(provider_id),
            ClientRequest::Ping { .. } => None,
        }
    }
}

/// Outbound messages to a client context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        /// Set on direct replies, absent on broadcasts.
        #[serde(default)]
        correlation_id: Option<String>,
        provider_id: ProviderId,
        state: ProviderState,
    },
    Data {
        provider_id: ProviderId,
        record: Value,
    },
    Snapshot {
        provider_id: ProviderId,
        records: Vec<Value>,
        is_partial: bool,
        total_received: usize,
    },
    SnapshotComplete { provider_id: ProviderId },
    Error {
        #[serde(default)]
        correlation_id: Option<String>,
        #[serde(default)]
        provider_id: Option<ProviderId>,
        message: String,
    },
    Pong { correlation_id: String },
    Ack { correlation_id: String },
}
