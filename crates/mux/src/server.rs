//! Client-facing HTTP/WebSocket surface.
//!
//! One WebSocket per client context at `/ws`, carrying JSON control
//! messages in and server events out. `/health` and `/ready` serve probes.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::MuxHandle;
use crate::protocol::{ClientRequest, ServerEvent};

#[derive(Clone)]
pub struct GatewayState {
    pub mux: MuxHandle,
    /// Outbound buffer per client channel.
    pub channel_capacity: usize,
}

pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, state: GatewayState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<GatewayState>) -> StatusCode {
    if state.mux.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per client context: inbound JSON requests go to the dispatcher,
/// events queued for this channel go back out on the socket.
async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(state.channel_capacity);
    let client_id = match state.mux.register(event_tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "rejecting socket, dispatcher unavailable");
            return;
        }
    };
    info!(client = client_id, "client connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientRequest>(&text) {
                        Ok(request) => {
                            if state.mux.request(client_id, request).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Malformed requests fail only this message.
                            debug!(client = client_id, error = %e, "unparseable request");
                            let event = ServerEvent::Error {
                                correlation_id: None,
                                provider_id: None,
                                message: format!("invalid request: {}", e),
                            };
                            if send_event(&mut sender, &event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = client_id, error = %e, "socket error");
                    break;
                }
            },
            event = event_rx.recv() => match event {
                Some(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    state.mux.deregister(client_id).await;
    info!(client = client_id, "client disconnected");
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "dropping unserializable event");
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await.map_err(|_| ())
}
