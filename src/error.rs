use thiserror::Error;

/// Errors produced by the node, REST, voice and player layers.
#[derive(Error, Debug)]
pub enum Error {
    /// A logical session already exists for this guild
    #[error("guild {0} already has an active connection")]
    AlreadyConnected(String),

    /// The node selector had nothing to offer
    #[error("no available node to serve the player")]
    NoAvailableNode,

    /// A session-scoped REST call was issued before the ready handshake
    #[error("node {0} has no session id yet, wait for the ready handshake")]
    SessionNotReady(String),

    /// Unknown or unsupported backend protocol version
    #[error("invalid driver: {0}")]
    InvalidDriver(String),

    /// Non-fatal transport failure reported by the WebSocket layer
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-2xx status
    #[error("node answered with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("index {index} out of range (queue has {len} tracks)")]
    IndexOutOfRange { index: usize, len: usize },

    /// The item is not a playable track (no encoded payload)
    #[error("invalid track: {0}")]
    InvalidTrackType(String),

    /// The voice provider never delivered credentials
    #[error("voice connection for guild {0} timed out waiting for credentials")]
    VoiceTimeout(String),

    #[error("node {0} is not registered")]
    NodeNotFound(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to (de)serialize payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Whether the failure came from the HTTP layer with the given status.
    pub fn is_status(&self, code: u16) -> bool {
        matches!(self, Error::Http { status, .. } if *status == code)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
