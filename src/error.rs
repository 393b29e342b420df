use std::time::Duration;

/// Failures during the post-connect authentication handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame: {0}")]
    Frame(#[from] protocol::FrameError),
    #[error("peer data is not valid JSON: {0}")]
    BadPeerData(serde_json::Error),
    #[error("no preshared key matches the remote challenge's id list")]
    NoMatchingKey,
    #[error("proof verification failed for key id {0}")]
    ProofMismatch(String),
    #[error("no preshared key registered with id {0}")]
    UnknownKeyId(String),
    #[error("remote peer sent an error during handshake: {0}")]
    RemoteError(String),
    #[error("unexpected frame during handshake")]
    UnexpectedFrame,
    #[error("remote protocol version {remote} is incompatible with local {local}")]
    IncompatibleProtocol { local: String, remote: String },
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed before handshake completed")]
    ConnectionClosed,
}

/// Failures sending a frame to a remote unit.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unit has no available connections")]
    NoAvailableConnections,
    #[error("no units are connected for role {0}")]
    NoUnitsForRole(String),
    #[error("transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unit closed")]
    UnitClosed,
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("waiter dropped without a response")]
    WaiterDropped,
}

/// Failures reading or writing a flow-controlled stream.
#[derive(Debug, thiserror::Error, Clone)]
pub enum StreamError {
    #[error("stream finished")]
    Eof,
    #[error("remote closed the stream: {0}")]
    RemoteError(String),
    #[error("underlying connection closed: {0}")]
    ConnectionClosed(String),
    #[error("stream destroyed locally: {0}")]
    Destroyed(String),
}

/// Failures loading a [`crate::config::PeerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Failures connecting or listening at the peer level.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}
