//! Session recording export: a mono PCM16 WAV plus a JSON sidecar.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use voicelive_session::audio::SAMPLE_RATE;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingManifest {
    pub session_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: usize,
    pub duration_ms: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingExport {
    pub wav_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// `conversation-2024-10-16T09-27-03-123Z.wav` for `2024-10-16T09:27:03.123Z`.
pub fn recording_file_name(at: &DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(&[':', '.'][..], "-");
    format!("conversation-{}.wav", stamp)
}

pub fn export_recording(
    dir: impl AsRef<Path>,
    samples: &[i16],
    session_id: Option<&str>,
    at: DateTime<Utc>,
) -> Result<RecordingExport> {
    if samples.is_empty() {
        bail!("No recorded audio to export");
    }

    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create recording directory '{}'", dir.display()))?;

    let wav_path = dir.join(recording_file_name(&at));
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&wav_path, spec)
        .with_context(|| format!("Failed to create '{}'", wav_path.display()))?;
    for sample in samples {
        writer
            .write_sample(*sample)
            .with_context(|| format!("Failed to write '{}'", wav_path.display()))?;
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finalize '{}'", wav_path.display()))?;

    let manifest = RecordingManifest {
        session_id: session_id.map(str::to_string),
        sample_rate: SAMPLE_RATE,
        channels: 1,
        samples: samples.len(),
        duration_ms: samples.len() as u64 * 1_000 / SAMPLE_RATE as u64,
        created_at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    let manifest_path = wav_path.with_extension("json");
    let json = serde_json::to_vec_pretty(&manifest).context("Failed to encode recording manifest")?;
    fs::write(&manifest_path, json)
        .with_context(|| format!("Failed to write '{}'", manifest_path.display()))?;

    Ok(RecordingExport {
        wav_path,
        manifest_path,
    })
}
