//! Wires a loaded [`VoiceLiveConfig`] into a [`SessionController`].
//!
//! The realtime transport, audio devices and media surface come from the
//! embedding application; everything else is derived from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;
use voicelive_session::audio::{AudioOutput, LevelAnalyser, Microphone};
use voicelive_session::avatar::{AvatarNegotiator, MediaSurface, PeerConnectionFactory};
use voicelive_session::client::RealtimeClientFactory;
use voicelive_session::lifecycle::SessionController;

use crate::config::VoiceLiveConfig;
use crate::managed::ManagedConfigClient;
use crate::search::AzureSearchBackend;
use crate::storage::{export_recording, RecordingExport};

/// Media plumbing supplied by the host.
pub struct MediaDevices {
    pub speaker: Arc<dyn AudioOutput>,
    pub microphone: Option<Arc<dyn Microphone>>,
    pub analyser: Option<Arc<dyn LevelAnalyser>>,
    pub avatar: Option<(Arc<dyn PeerConnectionFactory>, Arc<dyn MediaSurface>)>,
}

pub fn build_controller(
    config: &VoiceLiveConfig,
    factory: Arc<dyn RealtimeClientFactory>,
    devices: MediaDevices,
) -> Result<SessionController> {
    let mut builder =
        SessionController::builder(factory, devices.speaker, config.controller_options());

    if let Some(url) = config
        .connection
        .managed_config_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
    {
        let managed = ManagedConfigClient::new(url)?;
        info!(url = %managed.url(), "Refreshing credentials from managed config");
        builder = builder.credential_source(Arc::new(managed));
    }

    if config.search.enabled {
        let backend = AzureSearchBackend::from_config(&config.search)
            .context("Failed to configure the search backend")?;
        info!(url = %backend.url(), "Search backend enabled");
        builder = builder.search(Arc::new(backend));
    }

    if let Some(microphone) = devices.microphone {
        builder = builder.microphone(microphone);
    }
    if let Some(analyser) = devices.analyser {
        builder = builder.analyser(analyser);
    }
    if let Some((peers, surface)) = devices.avatar {
        builder = builder.avatar(
            AvatarNegotiator::new(peers, surface).with_grace_period(config.avatar.grace_period()),
        );
    }

    Ok(builder.build())
}

/// Write the finished session recording into `[recording].output_dir`, tagged
/// with the session it came from. `Ok(None)` when there is nothing to export.
pub fn export_session_recording(
    controller: &SessionController,
    config: &VoiceLiveConfig,
) -> Result<Option<RecordingExport>> {
    let Some(samples) = controller.take_recording() else {
        return Ok(None);
    };
    let session_id = controller.last_session_id();
    let export = export_recording(
        &config.recording.output_dir,
        &samples,
        session_id.as_deref(),
        Utc::now(),
    )?;
    info!(
        session_id = session_id.as_deref().unwrap_or("<unknown>"),
        path = %export.wav_path.display(),
        "Session recording exported"
    );
    Ok(Some(export))
}
