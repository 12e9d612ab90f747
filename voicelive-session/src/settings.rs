//! User-facing session settings. Deserializable so the application config can
//! embed them directly; `derive` turns them into wire-level `SessionOptions`.

use serde::{Deserialize, Serialize};

use crate::protocol::TurnDetectionKind;
use crate::tools::ToolKind;

// ── Default helper functions ────────────────────────────────────────────────

pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";
pub const DEFAULT_VOICE: &str = "en-US-AvaNeural";
pub const DEFAULT_AVATAR: &str = "Lisa-casual-sitting";

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_recognition_language() -> String {
    "auto".to_string()
}

fn default_temperature() -> f64 {
    0.9
}

fn default_voice_name() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_avatar_name() -> String {
    DEFAULT_AVATAR.to_string()
}

fn default_true() -> bool {
    true
}

// ── Mode ────────────────────────────────────────────────────────────────────

/// Whether the session talks to a deployed model or to a hosted agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Model,
    Agent {
        #[serde(default)]
        project_name: String,
        #[serde(default)]
        agent_id: Option<String>,
    },
}

impl SessionMode {
    pub fn is_agent(&self) -> bool {
        matches!(self, SessionMode::Agent { .. })
    }
}

// ── Sub-settings ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceSettings {
    /// Use a custom neural voice deployment instead of a catalog voice.
    #[serde(default)]
    pub custom: bool,
    #[serde(default = "default_voice_name")]
    pub name: String,
    #[serde(default)]
    pub custom_name: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            custom: false,
            name: default_voice_name(),
            custom_name: String::new(),
            deployment_id: String::new(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvatarSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub customized: bool,
    #[serde(default = "default_avatar_name")]
    pub name: String,
    #[serde(default)]
    pub custom_name: String,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            customized: false,
            name: default_avatar_name(),
            custom_name: String::new(),
        }
    }
}

/// Turn-taking strategy. `Manual` leaves commits to the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionMode {
    #[default]
    ServerVad,
    AzureSemanticVad,
    #[serde(alias = "none")]
    Manual,
}

impl TurnDetectionMode {
    pub fn kind(self) -> Option<TurnDetectionKind> {
        match self {
            TurnDetectionMode::ServerVad => Some(TurnDetectionKind::ServerVad),
            TurnDetectionMode::AzureSemanticVad => Some(TurnDetectionKind::AzureSemanticVad),
            TurnDetectionMode::Manual => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EouDetection {
    #[default]
    None,
    SemanticDetectionV1,
}

impl EouDetection {
    pub fn model_name(self) -> Option<&'static str> {
        match self {
            EouDetection::None => None,
            EouDetection::SemanticDetectionV1 => Some("semantic_detection_v1"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TurnDetectionSettings {
    #[serde(default)]
    pub mode: TurnDetectionMode,
    #[serde(default)]
    pub end_of_utterance: EouDetection,
    #[serde(default)]
    pub remove_filler_words: bool,
}

// ── Settings bundle ─────────────────────────────────────────────────────────

/// Everything a connect attempt needs besides endpoint, credential and mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Deployed model name. Also drives the transcription model choice in agent mode.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "default_recognition_language")]
    pub recognition_language: String,
    #[serde(default)]
    pub voice: VoiceSettings,
    #[serde(default)]
    pub avatar: AvatarSettings,
    #[serde(default)]
    pub turn_detection: TurnDetectionSettings,
    #[serde(default)]
    pub tools: Vec<ToolKind>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub noise_suppression: bool,
    #[serde(default)]
    pub echo_cancellation: bool,
    #[serde(default)]
    pub proactive: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            instructions: String::new(),
            recognition_language: default_recognition_language(),
            voice: VoiceSettings::default(),
            avatar: AvatarSettings::default(),
            turn_detection: TurnDetectionSettings::default(),
            tools: Vec::new(),
            temperature: default_temperature(),
            noise_suppression: false,
            echo_cancellation: false,
            proactive: false,
        }
    }
}

impl SessionSettings {
    pub fn manual_turn_taking(&self) -> bool {
        self.turn_detection.mode == TurnDetectionMode::Manual
    }
}
