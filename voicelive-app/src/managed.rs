//! Managed configuration served by the hosting backend at `GET /config`.
//!
//! Supplies the endpoint and a short-lived token (refreshed before every
//! connect), named scenario presets and the agent directory.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use voicelive_session::lifecycle::{CredentialSource, RefreshedCredentials};
use voicelive_session::settings::{SessionMode, SessionSettings};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManagedConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub pre_defined_scenarios: BTreeMap<String, Scenario>,
    #[serde(default)]
    pub agent: Option<AgentDirectory>,
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub pro_active: Option<bool>,
    #[serde(default)]
    pub voice: Option<ScenarioVoice>,
    #[serde(default)]
    pub avatar: Option<ScenarioAvatar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScenarioVoice {
    #[serde(default)]
    pub custom_voice: bool,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub voice_name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScenarioAvatar {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub customized: bool,
    #[serde(default)]
    pub avatar_name: String,
}

impl Scenario {
    /// Overlay this preset onto `settings`. Fields the preset leaves out keep
    /// their current value, except a missing avatar block which disables the avatar.
    pub fn apply(&self, settings: &mut SessionSettings) {
        if let Some(instructions) = self.instructions.as_deref().filter(|i| !i.is_empty()) {
            settings.instructions = instructions.to_string();
        }
        if let Some(proactive) = self.pro_active {
            settings.proactive = proactive;
        }

        if let Some(voice) = &self.voice {
            settings.voice.custom = voice.custom_voice;
            if voice.custom_voice {
                if let Some(deployment_id) = voice.deployment_id.as_deref().filter(|d| !d.is_empty())
                {
                    settings.voice.deployment_id = deployment_id.to_string();
                }
                if !voice.voice_name.is_empty() {
                    settings.voice.custom_name = voice.voice_name.clone();
                }
                if let Some(temperature) = voice.temperature.filter(|t| *t != 0.0) {
                    settings.voice.temperature = temperature;
                }
            } else if !voice.voice_name.is_empty() {
                settings.voice.name = voice.voice_name.clone();
            }
        }

        match &self.avatar {
            Some(avatar) => {
                settings.avatar.enabled = avatar.enabled;
                if avatar.enabled {
                    settings.avatar.customized = avatar.customized;
                    if avatar.customized {
                        settings.avatar.custom_name = avatar.avatar_name.clone();
                    } else {
                        settings.avatar.name = avatar.avatar_name.clone();
                    }
                }
            }
            None => settings.avatar.enabled = false,
        }
    }
}

// ── Agent directory ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentDirectory {
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl AgentDirectory {
    /// Fill in the project and, when exactly one agent is listed and none is
    /// selected yet, that agent. Model mode is left untouched.
    pub fn apply(&self, mode: &mut SessionMode) {
        if self.project_name.is_empty() {
            return;
        }
        if let SessionMode::Agent {
            project_name,
            agent_id,
        } = mode
        {
            *project_name = self.project_name.clone();
            let unselected = agent_id.as_deref().map_or(true, |id| id.trim().is_empty());
            if let [only] = self.agents.as_slice() {
                if unselected {
                    info!(agent_id = %only.id, "Auto-selected the only listed agent");
                    *agent_id = Some(only.id.clone());
                }
            }
        }
    }
}

impl ManagedConfig {
    pub fn scenario(&self, name: &str) -> Option<&Scenario> {
        self.pre_defined_scenarios.get(name)
    }
}

// ── HTTP client ─────────────────────────────────────────────────────────────

pub struct ManagedConfigClient {
    http: reqwest::Client,
    url: Url,
}

impl ManagedConfigClient {
    /// `base_url` is the origin serving `/config`.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url.trim())
            .with_context(|| format!("Invalid managed config URL '{}'", base_url))?;
        let url = base
            .join("/config")
            .with_context(|| format!("Invalid managed config URL '{}'", base_url))?;
        Ok(Self {
            http: reqwest::Client::new(),
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `Ok(None)` when the backend has no managed configuration (404).
    pub async fn fetch(&self) -> Result<Option<ManagedConfig>> {
        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to reach managed config at {}", self.url))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(url = %self.url, "No managed config published");
            return Ok(None);
        }

        let config = response
            .error_for_status()
            .with_context(|| format!("Managed config request to {} failed", self.url))?
            .json::<ManagedConfig>()
            .await
            .with_context(|| format!("Failed to parse managed config from {}", self.url))?;
        Ok(Some(config))
    }
}

#[async_trait]
impl CredentialSource for ManagedConfigClient {
    async fn refresh(&self) -> Result<Option<RefreshedCredentials>> {
        Ok(self.fetch().await?.map(|config| RefreshedCredentials {
            endpoint: config.endpoint,
            token: config.token,
        }))
    }
}
