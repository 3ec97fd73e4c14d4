use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),
    #[error("provider not connected: {0}")]
    NotConnected(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("no configuration for provider: {0}")]
    MissingConfig(String),
    #[error("multiplexer unavailable")]
    Unavailable,
}

impl From<TransportError> for MuxError {
    fn from(e: TransportError) -> Self {
        MuxError::ConnectFailed(e.to_string())
    }
}
