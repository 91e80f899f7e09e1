use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid stream key {0}")]
    InvalidStreamKey(String),

    #[error("voice gateway closed with code {0}")]
    Closed(u16),

    #[error("voice gateway failure: {0}")]
    Fatal(String),

    #[error("voice gateway not connected")]
    NotConnected,

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
