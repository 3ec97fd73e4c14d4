//! Upstream provider: one logical data source, one physical connection.
//!
//! `UpstreamProvider::connect` runs the feed handshake and spawns the task
//! that owns the transport for the rest of the provider's life. The task
//! feeds the session state machine and ships its events to the dispatcher;
//! the dispatcher talks back over the command channel.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::protocol::{ProviderId, ProviderState};
use crate::session::{FeedSession, ProviderEvent};
use crate::transport::UpstreamTransport;
use gridmux_frame::Frame;
use gridmux_metadata::ProviderConfig;

/// Commands the registry sends to a running provider task.
#[derive(Debug)]
pub enum ProviderCommand {
    /// Forward a payload to the provider's trigger destination(s).
    Send { payload: String },
    /// Re-arm the snapshot cycle and re-issue the configured trigger.
    Refresh,
    /// Tear down the connection. Last subscriber left.
    Close,
}

/// Handle the registry keeps for a connected provider.
#[derive(Debug)]
pub struct ProviderHandle {
    pub cmd_tx: mpsc::Sender<ProviderCommand>,
    pub initial_state: ProviderState,
}

pub struct UpstreamProvider;

impl UpstreamProvider {
    /// Connect and hand the transport over to the provider task.
    ///
    /// Handshake: transport connect, CONNECT frame with the version header,
    /// a short delay so the upstream registers the session, then the
    /// SUBSCRIBE/SEND trigger pair per destination, in that order.
    pub async fn connect(
        provider_id: ProviderId,
        config: ProviderConfig,
        mut transport: Box<dyn UpstreamTransport>,
        event_tx: mpsc::Sender<(ProviderId, ProviderEvent)>,
        batch_threshold: usize,
        connect_timeout: Duration,
    ) -> Result<ProviderHandle, MuxError> {
        tokio::time::timeout(connect_timeout, transport.connect())
            .await
            .map_err(|_| MuxError::ConnectFailed("handshake timed out".to_string()))?
            .map_err(|e| MuxError::ConnectFailed(e.to_string()))?;

        transport
            .send(Frame::connect(&config.accept_version))
            .await
            .map_err(|e| MuxError::ConnectFailed(e.to_string()))?;

        let frames = transport.frames();

        tokio::time::sleep(Duration::from_millis(config.handshake_delay_ms)).await;

        for (i, dest) in config.destinations.iter().enumerate() {
            transport
                .send(Frame::subscribe(&format!("sub-{}", i), &dest.destination))
                .await
                .map_err(|e| MuxError::ConnectFailed(e.to_string()))?;
            if let Some(ref trigger) = dest.trigger {
                transport
                    .send(Frame::send(&trigger.destination, &trigger.body))
                    .await
                    .map_err(|e| MuxError::ConnectFailed(e.to_string()))?;
            }
        }

        let mut session = FeedSession::new(&config, batch_threshold);
        session.handshake_complete();
        let initial_state = session.state();

        info!(
            provider = %provider_id,
            destinations = config.destinations.len(),
            state = ?initial_state,
            "provider connected"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        tokio::spawn(run_loop(
            provider_id, config, transport, frames, session, cmd_rx, event_tx,
        ));

        Ok(ProviderHandle {
            cmd_tx,
            initial_state,
        })
    }
}

async fn run_loop(
    provider_id: ProviderId,
    config: ProviderConfig,
    mut transport: Box<dyn UpstreamTransport>,
    mut frames: mpsc::Receiver<Frame>,
    mut session: FeedSession,
    mut cmd_rx: mpsc::Receiver<ProviderCommand>,
    event_tx: mpsc::Sender<(ProviderId, ProviderEvent)>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ProviderCommand::Send { payload }) => {
                    if config.destinations.is_empty() {
                        warn!(provider = %provider_id, "trigger on connect-only provider dropped");
                    }
                    for dest in &config.destinations {
                        let target = dest
                            .trigger
                            .as_ref()
                            .map(|t| t.destination.as_str())
                            .unwrap_or(dest.destination.as_str());
                        if let Err(e) = transport.send(Frame::send(target, &payload)).await {
                            warn!(provider = %provider_id, error = %e, "trigger send failed");
                            forward(&event_tx, &provider_id, ProviderEvent::Error(e.to_string()))
                                .await;
                        }
                    }
                }
                Some(ProviderCommand::Refresh) => {
                    debug!(provider = %provider_id, "refreshing snapshot cycle");
                    for ev in session.refresh() {
                        forward(&event_tx, &provider_id, ev).await;
                    }
                    for dest in &config.destinations {
                        if let Some(ref trigger) = dest.trigger {
                            if let Err(e) =
                                transport.send(Frame::send(&trigger.destination, &trigger.body)).await
                            {
                                warn!(provider = %provider_id, error = %e, "refresh trigger failed");
                            }
                        }
                    }
                }
                Some(ProviderCommand::Close) => {
                    transport.close().await.ok();
                    info!(provider = %provider_id, "provider closed");
                    return;
                }
                // Handle dropped: the dispatcher is gone or tore this
                // provider down without queueing a Close.
                None => {
                    transport.close().await.ok();
                    info!(provider = %provider_id, "provider released");
                    return;
                }
            },
            frame = frames.recv() => match frame {
                Some(frame) => {
                    for ev in session.on_frame(&frame) {
                        forward(&event_tx, &provider_id, ev).await;
                    }
                }
                None => {
                    info!(provider = %provider_id, "upstream connection lost");
                    forward(
                        &event_tx,
                        &provider_id,
                        ProviderEvent::Status(ProviderState::Disconnected),
                    )
                    .await;
                    transport.close().await.ok();
                    return;
                }
            }
        }
    }
}

async fn forward(
    event_tx: &mpsc::Sender<(ProviderId, ProviderEvent)>,
    provider_id: &str,
    event: ProviderEvent,
) {
    // The dispatcher going away means shutdown; nothing left to report to.
    event_tx.send((provider_id.to_string(), event)).await.ok();
}
