//! Error taxonomy for the session orchestrator.
//!
//! User-facing failures are also rendered into the transcript as `error`
//! messages; these types carry the structured cause for logging and tests.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    /// Required configuration is missing; the connect attempt never touched the network.
    #[error("{0}")]
    Config(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("avatar negotiation failed: {0}")]
    AvatarNegotiation(#[from] AvatarError),

    #[error("tool execution failed: {0}")]
    ToolExecution(#[from] ToolError),

    #[error("response failed: {0}")]
    ResponseFailure(String),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("no active session")]
    NotConnected,

    /// Error reported by the realtime client implementation.
    #[error("realtime client error: {0}")]
    Client(String),
}

impl SessionError {
    pub fn client(err: impl std::fmt::Display) -> Self {
        Self::Client(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tool errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("Search backend is not configured")]
    SearchUnavailable,

    #[error("Search failed: {0}")]
    Search(String),
}

// ---------------------------------------------------------------------------
// Audio errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("recording is already active")]
    AlreadyRecording,
}

// ---------------------------------------------------------------------------
// Avatar errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AvatarError {
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    #[error("local description was never set")]
    MissingLocalDescription,

    #[error("avatar connect rejected: {0}")]
    Remote(String),
}
