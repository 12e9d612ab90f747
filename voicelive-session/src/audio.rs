//! Audio I/O pipeline: microphone capture, streamed playback, input level
//! metering and whole-session recording.
//!
//! Device access sits behind [`Microphone`] and [`AudioOutput`]; everything
//! here works on little-endian PCM16 mono at [`SAMPLE_RATE`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivitySignal};
use crate::error::{AudioError, SessionError};

pub const SAMPLE_RATE: u32 = 24_000;
/// 100 ms of PCM16 mono at 24 kHz.
pub const DEFAULT_CHUNK_BYTES: usize = 4_800;
/// Upper bound of the published voice-activity level.
pub const MAX_ACTIVITY_LEVEL: f64 = 30.0;

const ANALYSER_FFT_SIZE: usize = 256;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const ANALYSER_INTERVAL: Duration = Duration::from_millis(50);
const SIMULATED_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Device seams
// ---------------------------------------------------------------------------

/// Raw captured PCM16 bytes in arbitrary block sizes. Dropping it releases the device.
pub type CaptureStream = mpsc::Receiver<Vec<u8>>;

#[async_trait]
pub trait Microphone: Send + Sync {
    async fn open(&self) -> Result<CaptureStream, AudioError>;
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play one chunk; resolves once the device has accepted it.
    async fn play(&self, chunk: &[u8]) -> Result<(), AudioError>;

    /// Discard anything still buffered on the device.
    fn halt(&self);
}

/// Destination for fixed-size captured frames.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(&self, chunk: &[u8]) -> Result<(), SessionError>;
}

/// Frequency-domain view of the most recent input audio.
pub trait LevelAnalyser: Send + Sync {
    fn feed(&self, pcm: &[u8]);

    /// Byte-scaled magnitudes for the lower half of the spectrum.
    fn frequency_data(&self) -> Vec<u8>;
}

fn pcm16_samples(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Regroups arbitrary capture blocks into fixed-size frames.
#[derive(Debug)]
pub struct FrameChunker {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameChunker {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(2),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_bytes {
            let rest = self.pending.split_off(self.frame_bytes);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// Take the trailing partial frame, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Session recording
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RecordingState {
    active: bool,
    samples: Vec<i16>,
}

/// Buffers captured and played audio for the whole session, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct SessionRecording {
    inner: Arc<Mutex<RecordingState>>,
}

impl SessionRecording {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a fresh recording, discarding any previous one.
    pub fn start(&self) {
        let mut state = self.inner.lock().expect("recording mutex poisoned");
        state.active = true;
        state.samples.clear();
    }

    pub fn stop(&self) {
        self.inner.lock().expect("recording mutex poisoned").active = false;
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().expect("recording mutex poisoned").active
    }

    pub fn append(&self, pcm: &[u8]) {
        let mut state = self.inner.lock().expect("recording mutex poisoned");
        if state.active {
            state.samples.extend(pcm16_samples(pcm));
        }
    }

    pub fn has_recorded_audio(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("recording mutex poisoned")
            .samples
            .is_empty()
    }

    pub fn duration(&self) -> Duration {
        let samples = self.inner.lock().expect("recording mutex poisoned").samples.len();
        Duration::from_secs_f64(samples as f64 / SAMPLE_RATE as f64)
    }

    pub fn take(&self) -> Vec<i16> {
        std::mem::take(&mut self.inner.lock().expect("recording mutex poisoned").samples)
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Where captured frames go.
pub struct CaptureTargets {
    pub sink: Arc<dyn ChunkSink>,
    pub activity: ActivitySignal,
    pub recording: SessionRecording,
    pub analyser: Option<Arc<dyn LevelAnalyser>>,
}

pub struct RecorderHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RecorderHandle {
    /// Stop capture, flush the partial frame and release the device.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Capture task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Open the microphone and start delivering `chunk_bytes` frames.
///
/// A denied microphone surfaces as [`AudioError::PermissionDenied`] and is not retried.
pub async fn start_capture(
    microphone: &dyn Microphone,
    targets: CaptureTargets,
    chunk_bytes: usize,
) -> Result<RecorderHandle, AudioError> {
    let capture = microphone.open().await?;
    let (stop_tx, stop_rx) = oneshot::channel();
    let chunker = FrameChunker::new(chunk_bytes);
    let task = tokio::spawn(run_capture(capture, targets, chunker, stop_rx));
    info!(chunk_bytes, "Microphone capture started");
    Ok(RecorderHandle {
        stop_tx: Some(stop_tx),
        task,
    })
}

async fn run_capture(
    mut capture: CaptureStream,
    targets: CaptureTargets,
    mut chunker: FrameChunker,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            block = capture.recv() => match block {
                Some(bytes) => {
                    for frame in chunker.push(&bytes) {
                        deliver_frame(&targets, &frame).await;
                    }
                }
                None => {
                    info!("Capture stream closed by device");
                    break;
                }
            }
        }
    }

    if let Some(frame) = chunker.flush() {
        deliver_frame(&targets, &frame).await;
    }
    drop(capture);
    info!("Microphone capture stopped");
}

async fn deliver_frame(targets: &CaptureTargets, frame: &[u8]) {
    targets.recording.append(frame);
    if let Some(analyser) = &targets.analyser {
        analyser.feed(frame);
    }
    if let Err(e) = targets.sink.send_chunk(frame).await {
        warn!(error = %e, bytes = frame.len(), "Failed to send captured audio");
    }
    if targets.activity.current() == Activity::UserSpeaking {
        targets.activity.touch();
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// FIFO playback of one assistant turn at a time.
pub struct StreamingPlayer {
    output: Arc<dyn AudioOutput>,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    wake: Arc<Notify>,
    drain: Mutex<Option<JoinHandle<()>>>,
    recording: Option<SessionRecording>,
}

impl StreamingPlayer {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            wake: Arc::new(Notify::new()),
            drain: Mutex::new(None),
            recording: None,
        }
    }

    /// Also copy every played chunk into the session recording.
    pub fn with_recording(mut self, recording: SessionRecording) -> Self {
        self.recording = Some(recording);
        self
    }

    /// Reset playback state and open a fresh stream.
    pub fn start(&self) {
        self.stop();
        let task = tokio::spawn(drain_queue(
            self.output.clone(),
            self.queue.clone(),
            self.wake.clone(),
        ));
        *self.drain.lock().expect("player mutex poisoned") = Some(task);
    }

    /// Halt immediately and discard queued chunks. Safe to call when idle.
    pub fn stop(&self) {
        let task = self.drain.lock().expect("player mutex poisoned").take();
        if let Some(task) = task {
            task.abort();
            self.output.halt();
        }
        self.queue.lock().expect("player mutex poisoned").clear();
    }

    /// Queue a chunk on the active stream. Chunks arriving with no stream are dropped.
    pub fn play_chunk(&self, chunk: Vec<u8>) -> bool {
        if !self.is_active() {
            debug!(bytes = chunk.len(), "Dropping audio chunk with no active playback");
            return false;
        }
        if let Some(recording) = &self.recording {
            recording.append(&chunk);
        }
        self.queue
            .lock()
            .expect("player mutex poisoned")
            .push_back(chunk);
        self.wake.notify_one();
        true
    }

    pub fn is_active(&self) -> bool {
        self.drain
            .lock()
            .expect("player mutex poisoned")
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn buffered_chunks(&self) -> usize {
        self.queue.lock().expect("player mutex poisoned").len()
    }
}

impl Drop for StreamingPlayer {
    fn drop(&mut self) {
        if let Ok(mut drain) = self.drain.lock() {
            if let Some(task) = drain.take() {
                task.abort();
            }
        }
    }
}

async fn drain_queue(
    output: Arc<dyn AudioOutput>,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    wake: Arc<Notify>,
) {
    loop {
        let next = queue.lock().expect("player mutex poisoned").pop_front();
        match next {
            Some(chunk) => {
                if let Err(e) = output.play(&chunk).await {
                    warn!(error = %e, "Audio output rejected chunk");
                }
            }
            None => wake.notified().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Level metering
// ---------------------------------------------------------------------------

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let x = std::f32::consts::PI * 2.0 * i as f32 / size as f32;
            0.5 * (1.0 - x.cos())
        })
        .collect()
}

/// FFT analyser over the most recent input window, scaled like a browser
/// `AnalyserNode` (decibels mapped linearly onto `0..=255`).
pub struct SpectrumAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    latest: Mutex<VecDeque<f32>>,
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumAnalyser {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(ANALYSER_FFT_SIZE),
            window: hann_window(ANALYSER_FFT_SIZE),
            latest: Mutex::new(VecDeque::from(vec![0.0; ANALYSER_FFT_SIZE])),
        }
    }
}

impl LevelAnalyser for SpectrumAnalyser {
    fn feed(&self, pcm: &[u8]) {
        let mut latest = self.latest.lock().expect("analyser mutex poisoned");
        for sample in pcm16_samples(pcm) {
            if latest.len() == ANALYSER_FFT_SIZE {
                latest.pop_front();
            }
            latest.push_back(sample as f32 / 32_768.0);
        }
    }

    fn frequency_data(&self) -> Vec<u8> {
        let mut buffer: Vec<Complex<f32>> = {
            let latest = self.latest.lock().expect("analyser mutex poisoned");
            latest
                .iter()
                .zip(&self.window)
                .map(|(sample, w)| Complex::new(sample * w, 0.0))
                .collect()
        };
        self.fft.process(&mut buffer);

        let range = MAX_DECIBELS - MIN_DECIBELS;
        buffer[..ANALYSER_FFT_SIZE / 2]
            .iter()
            .map(|bin| {
                let magnitude = bin.norm() / ANALYSER_FFT_SIZE as f32;
                let db = if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    MIN_DECIBELS
                };
                (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

/// Average the byte spectrum and rescale into `0..=MAX_ACTIVITY_LEVEL`.
pub fn level_from_frequency_data(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let average = data.iter().map(|&b| b as f64).sum::<f64>() / data.len() as f64;
    (average / 255.0 * MAX_ACTIVITY_LEVEL).min(MAX_ACTIVITY_LEVEL)
}

/// Fallback level when no analyser is available; `roll` is uniform in `[0, 1)`.
pub fn simulated_level(user_speaking: bool, roll: f64) -> f64 {
    if user_speaking {
        15.0 + roll * 10.0
    } else {
        2.0 + roll * 5.0
    }
}

pub struct LevelMeter {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LevelMeter {
    /// Sample every 50 ms from the analyser, or every 100 ms from the simulation.
    pub fn spawn(
        analyser: Option<Arc<dyn LevelAnalyser>>,
        activity: ActivitySignal,
        level: Arc<watch::Sender<f64>>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_level_meter(analyser, activity, level, stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn run_level_meter(
    analyser: Option<Arc<dyn LevelAnalyser>>,
    activity: ActivitySignal,
    level: Arc<watch::Sender<f64>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let period = if analyser.is_some() {
        ANALYSER_INTERVAL
    } else {
        SIMULATED_INTERVAL
    };
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                let value = match &analyser {
                    Some(analyser) => level_from_frequency_data(&analyser.frequency_data()),
                    None => simulated_level(
                        activity.current() == Activity::UserSpeaking,
                        rand::random::<f64>(),
                    ),
                };
                level.send_replace(value);
            }
        }
    }
    level.send_replace(0.0);
}
