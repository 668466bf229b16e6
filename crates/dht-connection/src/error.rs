use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not start: {0}")]
    CouldNotStart(String),
    #[error("cannot connect to self: {0}")]
    CannotConnectToSelf(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("illegal rtc peer connection state: {0}")]
    IllegalRtcPeerConnectionState(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("webrtc error: {0}")]
    WebRtc(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<webrtc::Error> for ConnectionError {
    fn from(err: webrtc::Error) -> Self {
        ConnectionError::WebRtc(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("rpc request timed out")]
    Timeout,
    #[error("rpc request canceled")]
    Canceled,
    #[error("unexpected rpc response")]
    UnexpectedResponse,
}
