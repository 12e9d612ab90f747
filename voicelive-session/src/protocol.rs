use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type alias for session identifiers assigned by the realtime service.
pub type SessionId = String;

/// API version requested from the realtime service.
pub const API_VERSION: &str = "2025-05-01-preview";

/// Options sent with the single `configure` call of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_transcription: InputAudioTranscription,
    /// `None` means manual turn-taking (client commits the audio buffer).
    pub turn_detection: Option<TurnDetection>,
    pub voice: Voice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AvatarConfig>,
    pub tools: Vec<ToolDeclaration>,
    pub temperature: f64,
    pub modalities: Vec<Modality>,
    pub input_audio_noise_reduction: Option<NoiseReduction>,
    pub input_audio_echo_cancellation: Option<EchoCancellation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputAudioTranscription {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

// ── Turn detection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionKind {
    ServerVad,
    AzureSemanticVad,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: TurnDetectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_utterance_detection: Option<EndOfUtteranceDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_filler_words: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndOfUtteranceDetection {
    pub model: String,
}

// ── Voice ───────────────────────────────────────────────────────────────────

/// Voice selection. Vendor-default voices travel as a bare string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Voice {
    Azure(AzureVoice),
    Builtin(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AzureVoice {
    #[serde(rename = "azure-standard")]
    Standard {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
    },
    #[serde(rename = "azure-custom")]
    Custom {
        name: String,
        endpoint_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
    },
}

impl Voice {
    pub fn temperature(&self) -> Option<f64> {
        match self {
            Voice::Azure(AzureVoice::Standard { temperature, .. })
            | Voice::Azure(AzureVoice::Custom { temperature, .. }) => *temperature,
            Voice::Builtin(_) => None,
        }
    }
}

// ── Avatar ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvatarConfig {
    pub character: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customized: Option<bool>,
    pub video: VideoParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoParams {
    pub codec: String,
    pub crop: VideoCrop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoCrop {
    pub top_left: [u32; 2],
    pub bottom_right: [u32; 2],
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            codec: "h264".to_string(),
            crop: VideoCrop {
                top_left: [560, 0],
                bottom_right: [1360, 1080],
            },
        }
    }
}

// ── Tools, modalities, audio processing ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub parameters: Option<Value>,
    pub description: String,
}

impl ToolDeclaration {
    pub fn function(name: &str, parameters: Option<Value>, description: &str) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.to_string(),
            parameters,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoiseReduction {
    #[serde(rename = "type")]
    pub kind: String,
}

impl NoiseReduction {
    pub fn deep_noise_suppression() -> Self {
        Self {
            kind: "azure_deep_noise_suppression".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EchoCancellation {
    #[serde(rename = "type")]
    pub kind: String,
}

impl EchoCancellation {
    pub fn server() -> Self {
        Self {
            kind: "server_echo_cancellation".to_string(),
        }
    }
}

// ── Configure result and avatar signalling ──────────────────────────────────

/// Session returned by `configure`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(default)]
    pub avatar: Option<AvatarSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AvatarSession {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

// ── Client items ────────────────────────────────────────────────────────────

/// Conversation items the client pushes into the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientItem {
    Message {
        role: ItemRole,
        content: Vec<InputContent>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl ClientItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::Message {
            role: ItemRole::User,
            content: vec![InputContent::InputText { text: text.into() }],
        }
    }

    pub fn system_text(text: impl Into<String>) -> Self {
        Self::Message {
            role: ItemRole::System,
            content: vec![InputContent::InputText { text: text.into() }],
        }
    }

    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    User,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputContent {
    InputText { text: String },
}

/// Options for `generate_response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResponseOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
}
