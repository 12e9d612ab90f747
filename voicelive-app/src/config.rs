use std::time::Duration;

use serde::{Deserialize, Serialize};
use voicelive_session::audio::DEFAULT_CHUNK_BYTES;
use voicelive_session::lifecycle::ControllerOptions;
use voicelive_session::proactive::ProactiveConfig;
use voicelive_session::settings::{SessionMode, SessionSettings};
use voicelive_session::tools::SearchFields;

pub const API_KEY_ENV: &str = "VOICELIVE_API_KEY";

// ── Default helper functions ────────────────────────────────────────────────

fn default_content_field() -> String {
    "chunk".to_string()
}

fn default_identifier_field() -> String {
    "chunk_id".to_string()
}

fn default_check_interval_ms() -> u64 {
    1_000
}

fn default_idle_threshold_ms() -> u64 {
    10_000
}

fn default_chunk_bytes() -> usize {
    DEFAULT_CHUNK_BYTES
}

fn default_ice_grace_ms() -> u64 {
    2_000
}

fn default_recording_dir() -> String {
    "./recordings".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

// ── Sub-config structs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Bearer token. Wins over the API key when present.
    pub token: Option<String>,
    /// Base URL of a managed configuration service exposing `GET /config`.
    pub managed_config_url: Option<String>,
    /// Predefined scenario to apply from the managed configuration.
    pub scenario: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_content_field")]
    pub content_field: String,
    #[serde(default = "default_identifier_field")]
    pub identifier_field: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            index: String::new(),
            api_key: String::new(),
            content_field: default_content_field(),
            identifier_field: default_identifier_field(),
        }
    }
}

impl SearchConfig {
    pub fn fields(&self) -> SearchFields {
        SearchFields {
            content: self.content_field.clone(),
            identifier: self.identifier_field.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProactiveSection {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
}

impl Default for ProactiveSection {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
        }
    }
}

impl ProactiveSection {
    pub fn timer_config(&self) -> ProactiveConfig {
        ProactiveConfig {
            check_interval: Duration::from_millis(self.check_interval_ms.max(1)),
            idle_threshold: Duration::from_millis(self.idle_threshold_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Captured frame size in bytes of PCM16 mono at 24 kHz.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: default_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvatarTransportConfig {
    #[serde(default = "default_ice_grace_ms")]
    pub ice_grace_ms: u64,
}

impl Default for AvatarTransportConfig {
    fn default() -> Self {
        Self {
            ice_grace_ms: default_ice_grace_ms(),
        }
    }
}

impl AvatarTransportConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.ice_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingConfig {
    #[serde(default = "default_recording_dir")]
    pub output_dir: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_recording_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

// ── Top-level config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VoiceLiveConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub proactive: ProactiveSection,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub avatar: AvatarTransportConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl VoiceLiveConfig {
    /// Load configuration from a TOML file at the given path.
    /// Missing fields use documented defaults. Unknown fields are silently ignored.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML config '{}': {}", path, e))?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Configured key, else `VOICELIVE_API_KEY`.
    pub fn effective_api_key(&self) -> String {
        effective_api_key(&self.connection.api_key, std::env::var(API_KEY_ENV).ok())
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            endpoint: self.connection.endpoint.trim().to_string(),
            api_key: self.effective_api_key(),
            token: self.connection.token.clone(),
            search_fields: self.search.fields(),
            chunk_bytes: self.audio.chunk_bytes.max(2),
            proactive: self.proactive.timer_config(),
        }
    }
}

fn effective_api_key(configured: &str, from_env: Option<String>) -> String {
    if !configured.trim().is_empty() {
        return configured.trim().to_string();
    }
    from_env
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}
