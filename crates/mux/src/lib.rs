//! gridmux-mux: shared data-connection multiplexer
//!
//! One process owns the physical connections to STOMP-framed data feeds
//! and fans their snapshots and live updates out to any number of client
//! contexts. A single dispatcher task owns all subscription state; provider
//! I/O re-enters through the same event queue, so nothing here needs a lock.

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use channel::ChannelManager;
pub use dispatcher::{Mux, MuxHandle, TransportFactory};
pub use error::{MuxError, TransportError};
pub use protocol::{ClientId, ClientRequest, ProviderId, ProviderState, ServerEvent, SubscriberId};
pub use provider::{ProviderCommand, ProviderHandle, UpstreamProvider};
pub use registry::SubscriptionRegistry;
pub use server::{create_router, run_server, GatewayState};
pub use session::{FeedSession, ProviderEvent};
pub use transport::{UpstreamTransport, WsTransport};
