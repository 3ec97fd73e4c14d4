//! Dispatcher: the single task that owns all multiplexer state.
//!
//! Client commands, provider events, connect outcomes, and the liveness
//! sweep all funnel into one `select!` loop, so the registry and channel
//! manager are mutated from exactly one place. Provider connects run in
//! spawned tasks and re-enter through the outcome channel; nothing in the
//! loop blocks on the network.

use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::channel::ChannelManager;
use crate::error::MuxError;
use crate::protocol::{ClientId, ClientRequest, ProviderId, ServerEvent};
use crate::provider::{ProviderCommand, ProviderHandle, UpstreamProvider};
use crate::registry::{PendingAttach, SubscriptionRegistry};
use crate::session::ProviderEvent;
use crate::transport::{UpstreamTransport, WsTransport};
use gridmux_metadata::{ConfigStore, MuxSettings, ProviderConfig};

/// Builds a transport for a provider about to connect. Swapped for a
/// scripted transport in tests.
pub type TransportFactory =
    Arc<dyn Fn(&ProviderConfig) -> Box<dyn UpstreamTransport> + Send + Sync>;

enum MuxCommand {
    Register {
        tx: mpsc::Sender<ServerEvent>,
        reply: oneshot::Sender<ClientId>,
    },
    Deregister {
        client_id: ClientId,
    },
    Request {
        client_id: ClientId,
        request: ClientRequest,
    },
    Refresh {
        provider_id: ProviderId,
    },
}

/// Cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct MuxHandle {
    cmd_tx: mpsc::Sender<MuxCommand>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MuxHandle {
    /// Register a client channel, returning its id.
    pub async fn register(&self, tx: mpsc::Sender<ServerEvent>) -> Result<ClientId, MuxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCommand::Register { tx, reply: reply_tx })
            .await
            .map_err(|_| MuxError::Unavailable)?;
        reply_rx.await.map_err(|_| MuxError::Unavailable)
    }

    pub async fn deregister(&self, client_id: ClientId) {
        self.cmd_tx
            .send(MuxCommand::Deregister { client_id })
            .await
            .ok();
    }

    pub async fn request(
        &self,
        client_id: ClientId,
        request: ClientRequest,
    ) -> Result<(), MuxError> {
        self.cmd_tx
            .send(MuxCommand::Request { client_id, request })
            .await
            .map_err(|_| MuxError::Unavailable)
    }

    /// Re-run the snapshot cycle for a connected provider. Operational
    /// control, not part of the client wire vocabulary.
    pub async fn refresh(&self, provider_id: impl Into<ProviderId>) -> Result<(), MuxError> {
        self.cmd_tx
            .send(MuxCommand::Refresh {
                provider_id: provider_id.into(),
            })
            .await
            .map_err(|_| MuxError::Unavailable)
    }

    pub fn stop(&self) {
        self.shutdown.send(true).ok();
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow() && !self.cmd_tx.is_closed()
    }
}

pub struct Mux {
    settings: MuxSettings,
    store: Arc<dyn ConfigStore>,
    factory: TransportFactory,
    registry: SubscriptionRegistry,
    channels: ChannelManager,
}

impl Mux {
    /// Spawn the dispatcher task and hand back its handle.
    pub fn start(
        settings: MuxSettings,
        store: Arc<dyn ConfigStore>,
        factory: TransportFactory,
    ) -> MuxHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mux = Mux {
            settings,
            store,
            factory,
            registry: SubscriptionRegistry::new(),
            channels: ChannelManager::new(),
        };
        tokio::spawn(mux.run(cmd_rx, shutdown_rx));

        MuxHandle {
            cmd_tx,
            shutdown: Arc::new(shutdown_tx),
        }
    }

    /// `start` with the production WebSocket transport.
    pub fn start_ws(settings: MuxSettings, store: Arc<dyn ConfigStore>) -> MuxHandle {
        Self::start(
            settings,
            store,
            Arc::new(|config: &ProviderConfig| {
                Box::new(WsTransport::new(config.url.clone())) as Box<dyn UpstreamTransport>
            }),
        )
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<MuxCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let (provider_tx, mut provider_rx) =
            mpsc::channel::<(ProviderId, ProviderEvent)>(self.settings.channel_capacity);
        let (connect_tx, mut connect_rx) =
            mpsc::channel::<(ProviderId, Result<ProviderHandle, MuxError>)>(32);
        let mut sweep = tokio::time::interval(self.settings.sweep_interval());
        // First tick fires immediately; skip it so an empty process does not
        // sweep before anyone has connected.
        sweep.tick().await;

        info!(
            batch_threshold = self.settings.batch_threshold,
            idle_timeout_secs = self.settings.idle_timeout_secs,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("dispatcher shutting down");
                        return;
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &provider_tx, &connect_tx).await,
                    None => return,
                },
                Some((provider_id, event)) = provider_rx.recv() => {
                    self.handle_provider_event(&provider_id, event);
                }
                Some((provider_id, outcome)) = connect_rx.recv() => {
                    self.handle_connect_outcome(&provider_id, outcome);
                }
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: MuxCommand,
        provider_tx: &mpsc::Sender<(ProviderId, ProviderEvent)>,
        connect_tx: &mpsc::Sender<(ProviderId, Result<ProviderHandle, MuxError>)>,
    ) {
        match cmd {
            MuxCommand::Register { tx, reply } => {
                let client_id = self.channels.register(tx);
                reply.send(client_id).ok();
            }
            MuxCommand::Deregister { client_id } => self.drop_client(client_id),
            MuxCommand::Request { client_id, request } => {
                self.channels.touch(client_id);
                let correlation_id = request.correlation_id().to_string();
                let provider_id = request.provider_id().map(str::to_string);
                if let Err(e) = self
                    .handle_request(client_id, request, provider_tx, connect_tx)
                    .await
                {
                    warn!(client = client_id, error = %e, "request failed");
                    self.channels.send(
                        client_id,
                        ServerEvent::Error {
                            correlation_id: Some(correlation_id),
                            provider_id,
                            message: e.to_string(),
                        },
                    );
                }
            }
            MuxCommand::Refresh { provider_id } => match self.registry.handle(&provider_id) {
                Ok(handle) => {
                    if handle.cmd_tx.try_send(ProviderCommand::Refresh).is_err() {
                        warn!(provider = %provider_id, "provider command queue full, refresh dropped");
                    }
                }
                Err(e) => warn!(provider = %provider_id, error = %e, "refresh ignored"),
            },
        }
    }

    async fn handle_request(
        &mut self,
        client_id: ClientId,
        request: ClientRequest,
        provider_tx: &mpsc::Sender<(ProviderId, ProviderEvent)>,
        connect_tx: &mpsc::Sender<(ProviderId, Result<ProviderHandle, MuxError>)>,
    ) -> Result<(), MuxError> {
        match request {
            ClientRequest::Connect {
                correlation_id,
                provider_id,
                subscriber_id,
                config,
            } => {
                let waiter = PendingAttach {
                    client_id,
                    subscriber_id: subscriber_id.clone(),
                    correlation_id: correlation_id.clone(),
                };
                if self.registry.contains(&provider_id) {
                    if self.registry.join_pending(&provider_id, waiter) {
                        return Ok(());
                    }
                    return self.attach(client_id, &provider_id, &subscriber_id, &correlation_id);
                }

                let config = match config {
                    Some(config) => config,
                    None => self
                        .store
                        .get(&provider_id)
                        .await
                        .map_err(|_| MuxError::MissingConfig(provider_id.clone()))?,
                };

                self.registry.begin_connect(&provider_id, waiter);
                let transport = (self.factory)(&config);
                let event_tx = provider_tx.clone();
                let connect_tx = connect_tx.clone();
                let batch_threshold = self.settings.batch_threshold;
                let connect_timeout = self.settings.connect_timeout();
                tokio::spawn(async move {
                    let outcome = UpstreamProvider::connect(
                        provider_id.clone(),
                        config,
                        transport,
                        event_tx,
                        batch_threshold,
                        connect_timeout,
                    )
                    .await;
                    connect_tx.send((provider_id, outcome)).await.ok();
                });
                Ok(())
            }
            ClientRequest::Subscribe {
                correlation_id,
                provider_id,
                subscriber_id,
            } => {
                // Never initiates a connect; joining one in flight is fine.
                let waiter = PendingAttach {
                    client_id,
                    subscriber_id: subscriber_id.clone(),
                    correlation_id: correlation_id.clone(),
                };
                if self.registry.join_pending(&provider_id, waiter) {
                    return Ok(());
                }
                self.attach(client_id, &provider_id, &subscriber_id, &correlation_id)
            }
            ClientRequest::Disconnect {
                correlation_id,
                provider_id,
                subscriber_id,
            }
            | ClientRequest::Unsubscribe {
                correlation_id,
                provider_id,
                subscriber_id,
            } => {
                let closed = self.registry.detach(&provider_id, &subscriber_id)?;
                self.channels
                    .remove_subscription(client_id, &provider_id, &subscriber_id);
                if let Some(handle) = closed {
                    // Dropping the handle closes the command channel, which
                    // the provider task also treats as teardown.
                    handle.cmd_tx.try_send(ProviderCommand::Close).ok();
                }
                self.channels
                    .send(client_id, ServerEvent::Ack { correlation_id });
                Ok(())
            }
            ClientRequest::Trigger {
                provider_id,
                payload,
                ..
            } => {
                let handle = self.registry.handle(&provider_id)?;
                // Fire-and-forget: never park the dispatcher on a provider
                // whose command queue is backed up.
                match handle.cmd_tx.try_send(ProviderCommand::Send { payload }) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        warn!(provider = %provider_id, "provider command queue full, trigger dropped");
                        Ok(())
                    }
                    Err(TrySendError::Closed(_)) => Err(MuxError::NotConnected(provider_id)),
                }
            }
            ClientRequest::Ping { correlation_id } => {
                self.channels
                    .send(client_id, ServerEvent::Pong { correlation_id });
                Ok(())
            }
        }
    }

    /// Attach to a connected provider: direct status reply plus a private
    /// replay of the cached snapshot.
    fn attach(
        &mut self,
        client_id: ClientId,
        provider_id: &str,
        subscriber_id: &str,
        correlation_id: &str,
    ) -> Result<(), MuxError> {
        let reply = self.registry.attach(provider_id, subscriber_id, client_id)?;
        if let Some(displaced) = reply.displaced {
            self.channels
                .remove_subscription(displaced, provider_id, subscriber_id);
        }
        self.channels
            .add_subscription(client_id, provider_id, subscriber_id);

        self.channels.send(
            client_id,
            ServerEvent::Status {
                correlation_id: Some(correlation_id.to_string()),
                provider_id: provider_id.to_string(),
                state: reply.state,
            },
        );

        if let Some((records, total_received)) = reply.replay {
            self.channels.send(
                client_id,
                ServerEvent::Snapshot {
                    provider_id: provider_id.to_string(),
                    records,
                    is_partial: false,
                    total_received,
                },
            );
            self.channels.send(
                client_id,
                ServerEvent::SnapshotComplete {
                    provider_id: provider_id.to_string(),
                },
            );
        }
        Ok(())
    }

    fn handle_connect_outcome(
        &mut self,
        provider_id: &str,
        outcome: Result<ProviderHandle, MuxError>,
    ) {
        match outcome {
            Ok(handle) => {
                let state = handle.initial_state;
                let waiters = self.registry.complete_connect(provider_id, handle);
                for waiter in waiters {
                    // A waiter whose channel went away while the connect was
                    // in flight must not hold the provider open.
                    if !self.channels.contains(waiter.client_id) {
                        if let Ok(Some(handle)) =
                            self.registry.detach(provider_id, &waiter.subscriber_id)
                        {
                            handle.cmd_tx.try_send(ProviderCommand::Close).ok();
                        }
                        continue;
                    }
                    self.channels
                        .add_subscription(waiter.client_id, provider_id, &waiter.subscriber_id);
                    self.channels.send(
                        waiter.client_id,
                        ServerEvent::Status {
                            correlation_id: Some(waiter.correlation_id),
                            provider_id: provider_id.to_string(),
                            state,
                        },
                    );
                }
            }
            Err(e) => {
                error!(provider = %provider_id, error = %e, "provider connect failed");
                for waiter in self.registry.fail_connect(provider_id) {
                    self.channels.send(
                        waiter.client_id,
                        ServerEvent::Error {
                            correlation_id: Some(waiter.correlation_id),
                            provider_id: Some(provider_id.to_string()),
                            message: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn handle_provider_event(&mut self, provider_id: &str, event: ProviderEvent) {
        // Events from a provider already torn down are dropped here.
        if !self.registry.absorb_event(provider_id, &event) {
            return;
        }

        let event = match event {
            ProviderEvent::Status(state) => ServerEvent::Status {
                correlation_id: None,
                provider_id: provider_id.to_string(),
                state,
            },
            ProviderEvent::SnapshotBatch {
                records,
                is_partial,
                total_received,
            } => ServerEvent::Snapshot {
                provider_id: provider_id.to_string(),
                records,
                is_partial,
                total_received,
            },
            ProviderEvent::SnapshotComplete => ServerEvent::SnapshotComplete {
                provider_id: provider_id.to_string(),
            },
            ProviderEvent::Live(record) => ServerEvent::Data {
                provider_id: provider_id.to_string(),
                record,
            },
            ProviderEvent::Error(message) => ServerEvent::Error {
                correlation_id: None,
                provider_id: Some(provider_id.to_string()),
                message,
            },
        };

        for client_id in self.registry.subscribers_of(provider_id) {
            self.channels.send(client_id, event.clone());
        }
    }

    fn sweep(&mut self) {
        for client_id in self.channels.idle_clients(self.settings.idle_timeout()) {
            info!(client = client_id, "dropping idle channel");
            self.drop_client(client_id);
        }
    }

    /// Remove a channel and detach every subscription it held, closing
    /// providers it was the last subscriber of.
    fn drop_client(&mut self, client_id: ClientId) {
        for (provider_id, subscriber_id) in self.channels.remove(client_id) {
            match self.registry.detach(&provider_id, &subscriber_id) {
                Ok(Some(handle)) => {
                    handle.cmd_tx.try_send(ProviderCommand::Close).ok();
                }
                Ok(None) => {}
                Err(e) => warn!(provider = %provider_id, error = %e, "detach on drop failed"),
            }
        }
    }
}
