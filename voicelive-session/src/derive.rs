//! Derivation of the wire-level `configure` payload from `SessionSettings`.

use crate::protocol::{
    AvatarConfig, AzureVoice, EchoCancellation, EndOfUtteranceDetection, InputAudioTranscription,
    Modality, NoiseReduction, SessionOptions, TurnDetection, TurnDetectionKind, VideoParams,
    Voice,
};
use crate::settings::{AvatarSettings, SessionMode, SessionSettings, VoiceSettings};

/// Models that run speech-to-text, reasoning and text-to-speech as separate stages.
pub const CASCADED_MODELS: [&str; 6] = [
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "gpt-4.1-mini",
    "gpt-4.1-nano",
    "phi4-mini",
];

const HD_VOICE_MARKER: &str = "dragonhd";

pub fn is_cascaded(mode: &SessionMode, model: &str) -> bool {
    mode.is_agent() || CASCADED_MODELS.contains(&model)
}

fn hd_temperature(name: &str, temperature: f64) -> Option<f64> {
    name.to_lowercase()
        .contains(HD_VOICE_MARKER)
        .then_some(temperature)
}

pub fn derive_voice(voice: &VoiceSettings) -> Voice {
    if voice.custom {
        return Voice::Azure(AzureVoice::Custom {
            name: voice.custom_name.clone(),
            endpoint_id: voice.deployment_id.clone(),
            temperature: hd_temperature(&voice.custom_name, voice.temperature),
        });
    }
    if voice.name.contains('-') {
        return Voice::Azure(AzureVoice::Standard {
            name: voice.name.clone(),
            temperature: hd_temperature(&voice.name, voice.temperature),
        });
    }
    Voice::Builtin(voice.name.clone())
}

pub fn derive_avatar(avatar: &AvatarSettings) -> Option<AvatarConfig> {
    if !avatar.enabled {
        return None;
    }
    if avatar.customized {
        if avatar.custom_name.is_empty() {
            return None;
        }
        return Some(AvatarConfig {
            character: avatar.custom_name.clone(),
            style: None,
            customized: Some(true),
            video: VideoParams::default(),
        });
    }

    let mut segments = avatar.name.split('-');
    let character = segments.next().unwrap_or_default().to_lowercase();
    let style = segments.collect::<Vec<_>>().join("-");
    Some(AvatarConfig {
        character,
        style: Some(style),
        customized: None,
        video: VideoParams::default(),
    })
}

pub fn derive_turn_detection(
    settings: &SessionSettings,
    mode: &SessionMode,
) -> Option<TurnDetection> {
    let kind = settings.turn_detection.mode.kind()?;
    let end_of_utterance_detection = settings
        .turn_detection
        .end_of_utterance
        .model_name()
        .filter(|_| is_cascaded(mode, &settings.model))
        .map(|model| EndOfUtteranceDetection {
            model: model.to_string(),
        });
    let remove_filler_words = (kind == TurnDetectionKind::AzureSemanticVad)
        .then_some(settings.turn_detection.remove_filler_words);

    Some(TurnDetection {
        kind,
        end_of_utterance_detection,
        remove_filler_words,
    })
}

pub fn transcription_model(model: &str) -> &'static str {
    if model.contains("realtime-preview") {
        "whisper-1"
    } else {
        "azure-fast-transcription"
    }
}

/// Build the single `configure` payload for a connect attempt.
pub fn build_session_options(settings: &SessionSettings, mode: &SessionMode) -> SessionOptions {
    let instructions = Some(settings.instructions.clone()).filter(|s| !s.is_empty());
    let language = Some(settings.recognition_language.clone()).filter(|l| l != "auto");

    SessionOptions {
        instructions,
        input_audio_transcription: InputAudioTranscription {
            model: transcription_model(&settings.model).to_string(),
            language,
        },
        turn_detection: derive_turn_detection(settings, mode),
        voice: derive_voice(&settings.voice),
        avatar: derive_avatar(&settings.avatar),
        tools: settings.tools.iter().map(|tool| tool.declaration()).collect(),
        temperature: settings.temperature,
        modalities: vec![Modality::Text, Modality::Audio],
        input_audio_noise_reduction: settings
            .noise_suppression
            .then(NoiseReduction::deep_noise_suppression),
        input_audio_echo_cancellation: settings.echo_cancellation.then(EchoCancellation::server),
    }
}
