//! Realtime client seam.
//!
//! The orchestrator never speaks the realtime wire protocol itself; it drives
//! an implementation of [`RealtimeClient`] created by a [`RealtimeClientFactory`].
//! Server events are modelled as nested channels so a response can stream its
//! items, and each item its content parts, while the dispatch loop consumes
//! them concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::error::SessionError;
use crate::protocol::{
    ClientItem, ResponseOptions, SessionDescription, SessionInfo, SessionOptions, API_VERSION,
};

const STREAM_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Credentials and targets
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    /// Bearer token, typically refreshed from the managed config endpoint.
    Token(String),
}

impl Credential {
    /// A held token wins over an API key.
    pub fn resolve(api_key: &str, token: Option<&str>) -> Option<Self> {
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            return Some(Credential::Token(token.to_string()));
        }
        let key = api_key.trim();
        (!key.is_empty()).then(|| Credential::ApiKey(key.to_string()))
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Credential::Token(token) => Some(token),
            Credential::ApiKey(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::ApiKey(_) => "api_key",
            Credential::Token(_) => "token",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential::{}(<redacted>)", self.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTarget {
    Model {
        deployment: String,
    },
    Agent {
        agent_id: String,
        project_name: String,
        agent_access_token: Option<String>,
    },
}

/// Everything a factory needs to open one realtime session.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub endpoint: Url,
    pub credential: Credential,
    pub target: ClientTarget,
    pub api_version: &'static str,
}

impl ClientRequest {
    pub fn new(endpoint: Url, credential: Credential, target: ClientTarget) -> Self {
        Self {
            endpoint,
            credential,
            target,
            api_version: API_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// Client traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RealtimeClientFactory: Send + Sync {
    async fn create(&self, request: ClientRequest) -> Result<Arc<dyn RealtimeClient>, SessionError>;
}

#[async_trait]
pub trait RealtimeClient: Send + Sync {
    /// Apply all session settings in one call and return the server's session.
    async fn configure(&self, options: SessionOptions) -> Result<SessionInfo, SessionError>;

    async fn send_audio(&self, chunk: &[u8]) -> Result<(), SessionError>;

    async fn send_item(&self, item: ClientItem) -> Result<(), SessionError>;

    async fn generate_response(&self, options: Option<ResponseOptions>)
        -> Result<(), SessionError>;

    /// Hand out the server event stream. Only the first call returns it.
    fn events(&self) -> Option<EventStream>;

    async fn connect_avatar(
        &self,
        local: SessionDescription,
    ) -> Result<SessionDescription, SessionError>;

    /// Commit the input audio buffer (manual turn-taking).
    async fn commit_audio(&self) -> Result<InputAudioItem, SessionError>;

    /// Close the session. Closing ends the event stream.
    async fn close(&self) -> Result<(), SessionError>;
}

// ---------------------------------------------------------------------------
// Server events
// ---------------------------------------------------------------------------

pub type EventStream = mpsc::Receiver<Result<ServerEvent, SessionError>>;

#[derive(Debug)]
pub enum ServerEvent {
    Response(ResponseStream),
    InputAudio(InputAudioItem),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Completed,
    Cancelled,
    Incomplete,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutcome {
    pub status: ResponseStatus,
    pub status_details: Option<Value>,
}

impl ResponseOutcome {
    pub fn completed() -> Self {
        Self {
            status: ResponseStatus::Completed,
            status_details: None,
        }
    }

    pub fn failed(details: Value) -> Self {
        Self {
            status: ResponseStatus::Failed,
            status_details: Some(details),
        }
    }
}

/// One model response: a stream of items followed by a final status.
#[derive(Debug)]
pub struct ResponseStream {
    pub id: String,
    pub items: mpsc::Receiver<ResponseItem>,
    pub outcome: oneshot::Receiver<ResponseOutcome>,
}

/// Producer half of a [`ResponseStream`].
pub struct ResponseWriter {
    pub items: mpsc::Sender<ResponseItem>,
    pub outcome: oneshot::Sender<ResponseOutcome>,
}

impl ResponseStream {
    pub fn channel(id: impl Into<String>) -> (ResponseWriter, ResponseStream) {
        let (items_tx, items_rx) = mpsc::channel(STREAM_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        (
            ResponseWriter {
                items: items_tx,
                outcome: outcome_tx,
            },
            ResponseStream {
                id: id.into(),
                items: items_rx,
                outcome: outcome_rx,
            },
        )
    }

    /// Final status once all items are drained. A dropped writer reads as incomplete.
    pub async fn finish(self) -> ResponseOutcome {
        self.outcome.await.unwrap_or(ResponseOutcome {
            status: ResponseStatus::Incomplete,
            status_details: None,
        })
    }
}

#[derive(Debug)]
pub enum ResponseItem {
    /// Assistant message with streamed content parts.
    Message(MessageItem),
    FunctionCall(FunctionCallItem),
}

#[derive(Debug)]
pub struct MessageItem {
    pub id: String,
    pub content: mpsc::Receiver<ContentPart>,
}

impl MessageItem {
    pub fn channel(id: impl Into<String>) -> (mpsc::Sender<ContentPart>, MessageItem) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (
            tx,
            MessageItem {
                id: id.into(),
                content: rx,
            },
        )
    }
}

#[derive(Debug)]
pub enum ContentPart {
    Text(mpsc::Receiver<String>),
    Audio(AudioPart),
}

/// Spoken content: transcript text and audio bytes on independent streams.
#[derive(Debug)]
pub struct AudioPart {
    pub transcript: mpsc::Receiver<String>,
    pub audio: mpsc::Receiver<Vec<u8>>,
}

pub struct AudioPartWriter {
    pub transcript: mpsc::Sender<String>,
    pub audio: mpsc::Sender<Vec<u8>>,
}

impl ContentPart {
    pub fn text_channel() -> (mpsc::Sender<String>, ContentPart) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (tx, ContentPart::Text(rx))
    }

    pub fn audio_channel() -> (AudioPartWriter, ContentPart) {
        let (transcript_tx, transcript_rx) = mpsc::channel(STREAM_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(STREAM_CAPACITY);
        (
            AudioPartWriter {
                transcript: transcript_tx,
                audio: audio_tx,
            },
            ContentPart::Audio(AudioPart {
                transcript: transcript_rx,
                audio: audio_rx,
            }),
        )
    }
}

/// A function call whose arguments may still be streaming.
#[derive(Debug)]
pub struct FunctionCallItem {
    pub call_id: String,
    pub function_name: String,
    pub arguments: oneshot::Receiver<String>,
}

/// A fully specified function call awaiting dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolCall {
    pub call_id: String,
    pub function_name: String,
    pub arguments: String,
    pub completed: bool,
}

impl FunctionCallItem {
    pub fn channel(
        call_id: impl Into<String>,
        function_name: impl Into<String>,
    ) -> (oneshot::Sender<String>, FunctionCallItem) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            FunctionCallItem {
                call_id: call_id.into(),
                function_name: function_name.into(),
                arguments: rx,
            },
        )
    }

    pub async fn wait_for_completion(self) -> PendingToolCall {
        let (arguments, completed) = match self.arguments.await {
            Ok(arguments) => (arguments, true),
            Err(_) => (String::new(), false),
        };
        PendingToolCall {
            call_id: self.call_id,
            function_name: self.function_name,
            arguments,
            completed,
        }
    }
}

/// User speech item; completes with its transcription, if any.
#[derive(Debug)]
pub struct InputAudioItem {
    pub id: String,
    pub transcription: oneshot::Receiver<Option<String>>,
}

impl InputAudioItem {
    pub fn channel(id: impl Into<String>) -> (oneshot::Sender<Option<String>>, InputAudioItem) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            InputAudioItem {
                id: id.into(),
                transcription: rx,
            },
        )
    }

    pub async fn wait_for_completion(self) -> Option<String> {
        self.transcription.await.ok().flatten()
    }
}
