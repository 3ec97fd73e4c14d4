//! Upstream transport: one physical WebSocket connection to one feed.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, trace};
use url::Url;

use crate::error::TransportError;
use gridmux_frame::Frame;

/// Abstracts the physical connection so the provider and the dispatcher can
/// be driven by a scripted transport in tests.
///
/// `frames()` hands out the inbound receiver and may only be called once,
/// after `connect()`.
#[async_trait]
pub trait UpstreamTransport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    fn frames(&mut self) -> mpsc::Receiver<Frame>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// WebSocket transport speaking the text-framed feed protocol.
pub struct WsTransport {
    url: String,
    write: Option<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>>,
    tx: Option<mpsc::Sender<Frame>>,
    rx: Option<mpsc::Receiver<Frame>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            url: url.into(),
            write: None,
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

#[async_trait]
impl UpstreamTransport for WsTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        Url::parse(&self.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!(url = %self.url, "upstream connected");

        let (write, mut read) = ws_stream.split();
        self.write = Some(write);

        let tx = self
            .tx
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("connect() called twice".into()))?;

        // Frames that fail to decode are protocol noise; drop them here so
        // nothing malformed ever reaches the dispatcher.
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            trace!("dropping non-utf8 binary message");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                };

                match Frame::decode(&text) {
                    Some(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => trace!(len = text.len(), "dropping malformed frame"),
                }
            }
        });

        Ok(())
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let write = self.write.as_mut().ok_or(TransportError::ConnectionClosed)?;
        write.send(WsMessage::Text(frame.encode())).await?;
        Ok(())
    }

    fn frames(&mut self) -> mpsc::Receiver<Frame> {
        self.rx.take().expect("frames() called before connect() or called twice")
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut write) = self.write.take() {
            write.close().await.ok();
        }
        self.tx = None;
        Ok(())
    }
}
