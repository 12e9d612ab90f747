//! Session lifecycle controller.
//!
//! Owns every per-session resource (client, dispatch task, avatar peer,
//! proactive timer, recorder) so a connect/disconnect cycle can never leak or
//! alias the previous session's handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::activity::ActivitySignal;
use crate::audio::{
    start_capture, AudioOutput, CaptureTargets, ChunkSink, LevelAnalyser, LevelMeter, Microphone,
    RecorderHandle, SessionRecording, StreamingPlayer, DEFAULT_CHUNK_BYTES,
};
use crate::avatar::{AvatarConnection, AvatarNegotiator};
use crate::client::{ClientRequest, ClientTarget, Credential, RealtimeClient, RealtimeClientFactory};
use crate::derive::build_session_options;
use crate::dispatch::{handle_input_audio, spawn_dispatch_loop, DispatchContext};
use crate::error::{AudioError, SessionError};
use crate::proactive::{ProactiveConfig, ProactiveTimer};
use crate::protocol::{ClientItem, SessionId};
use crate::settings::{SessionMode, SessionSettings};
use crate::tools::{SearchBackend, SearchFields, ToolDispatcher};
use crate::transcript::Transcript;

pub const AGENT_REQUIRED_MESSAGE: &str = "Please input/select an agent.";

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Endpoint and token handed out by a managed configuration service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshedCredentials {
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

/// Re-fetched before every connect attempt.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// `Ok(None)` means no managed configuration is available.
    async fn refresh(&self) -> anyhow::Result<Option<RefreshedCredentials>>;
}

#[derive(Debug, Clone)]
struct HeldCredentials {
    endpoint: String,
    token: Option<String>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
struct Lifecycle {
    state: LifecycleState,
    /// Bumped by every disconnect. A connect attempt only goes live if the
    /// generation it started under is still current.
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub endpoint: String,
    pub api_key: String,
    pub token: Option<String>,
    pub search_fields: SearchFields,
    pub chunk_bytes: usize,
    pub proactive: ProactiveConfig,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            token: None,
            search_fields: SearchFields::default(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            proactive: ProactiveConfig::default(),
        }
    }
}

struct ActiveSession {
    id: SessionId,
    client: Arc<dyn RealtimeClient>,
    manual_turn_taking: bool,
    live: Arc<AtomicBool>,
    dispatch: JoinHandle<()>,
    avatar: Option<AvatarConnection>,
    proactive: Option<ProactiveTimer>,
    recorder: Option<RecorderHandle>,
    meter: Option<LevelMeter>,
}

/// Streams captured microphone frames into the live session.
struct SessionAudioSink {
    client: Arc<dyn RealtimeClient>,
}

#[async_trait]
impl ChunkSink for SessionAudioSink {
    async fn send_chunk(&self, chunk: &[u8]) -> Result<(), SessionError> {
        self.client.send_audio(chunk).await
    }
}

pub struct SessionControllerBuilder {
    factory: Arc<dyn RealtimeClientFactory>,
    speaker: Arc<dyn AudioOutput>,
    options: ControllerOptions,
    credential_source: Option<Arc<dyn CredentialSource>>,
    avatar: Option<AvatarNegotiator>,
    microphone: Option<Arc<dyn Microphone>>,
    analyser: Option<Arc<dyn LevelAnalyser>>,
    search: Option<Arc<dyn SearchBackend>>,
}

impl SessionControllerBuilder {
    pub fn credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credential_source = Some(source);
        self
    }

    pub fn avatar(mut self, negotiator: AvatarNegotiator) -> Self {
        self.avatar = Some(negotiator);
        self
    }

    pub fn microphone(mut self, microphone: Arc<dyn Microphone>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    pub fn analyser(mut self, analyser: Arc<dyn LevelAnalyser>) -> Self {
        self.analyser = Some(analyser);
        self
    }

    pub fn search(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.search = Some(backend);
        self
    }

    pub fn build(self) -> SessionController {
        let recording = SessionRecording::new();
        let player = StreamingPlayer::new(self.speaker).with_recording(recording.clone());
        let (level, _) = watch::channel(0.0);
        let credentials = HeldCredentials {
            endpoint: self.options.endpoint.clone(),
            token: non_empty(self.options.token.clone()),
        };

        SessionController {
            factory: self.factory,
            credential_source: self.credential_source,
            avatar: self.avatar,
            microphone: self.microphone,
            analyser: self.analyser,
            search: self.search,
            options: self.options,
            credentials: Mutex::new(credentials),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Disconnected,
                generation: 0,
            }),
            session: tokio::sync::Mutex::new(None),
            last_session_id: Mutex::new(None),
            transcript: Transcript::new(),
            activity: ActivitySignal::new(),
            recording,
            player: Arc::new(player),
            level: Arc::new(level),
        }
    }
}

pub struct SessionController {
    factory: Arc<dyn RealtimeClientFactory>,
    credential_source: Option<Arc<dyn CredentialSource>>,
    avatar: Option<AvatarNegotiator>,
    microphone: Option<Arc<dyn Microphone>>,
    analyser: Option<Arc<dyn LevelAnalyser>>,
    search: Option<Arc<dyn SearchBackend>>,
    options: ControllerOptions,
    credentials: Mutex<HeldCredentials>,
    lifecycle: Mutex<Lifecycle>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    last_session_id: Mutex<Option<SessionId>>,
    transcript: Transcript,
    activity: ActivitySignal,
    recording: SessionRecording,
    player: Arc<StreamingPlayer>,
    level: Arc<watch::Sender<f64>>,
}

impl SessionController {
    pub fn builder(
        factory: Arc<dyn RealtimeClientFactory>,
        speaker: Arc<dyn AudioOutput>,
        options: ControllerOptions,
    ) -> SessionControllerBuilder {
        SessionControllerBuilder {
            factory,
            speaker,
            options,
            credential_source: None,
            avatar: None,
            microphone: None,
            analyser: None,
            search: None,
        }
    }

    // ── Connect ─────────────────────────────────────────────────────────────

    /// Open a session. A no-op while connecting or connected; rejected while
    /// a disconnect is still tearing the previous session down.
    pub async fn connect(
        &self,
        mode: &SessionMode,
        settings: &SessionSettings,
    ) -> Result<(), SessionError> {
        let generation = {
            let mut lifecycle = self.lifecycle.lock().expect("state mutex poisoned");
            match lifecycle.state {
                LifecycleState::Disconnected => {}
                LifecycleState::Disconnecting => {
                    debug!("Connect rejected while disconnecting");
                    return Err(SessionError::Connection(
                        "disconnect still in progress".to_string(),
                    ));
                }
                state => {
                    debug!(state = ?state, "Connect ignored");
                    return Ok(());
                }
            }
            lifecycle.state = LifecycleState::Connecting;
            lifecycle.generation
        };

        match self.establish(mode, settings).await {
            Ok(session) => self.activate(session, generation, settings.proactive).await,
            Err(e) => {
                if !matches!(e, SessionError::Config(_)) {
                    warn!(error = %e, "Connect failed");
                    self.transcript
                        .push_error(format!("Error connecting to the server: {}", e));
                }
                self.settle(
                    generation,
                    LifecycleState::Connecting,
                    LifecycleState::Disconnected,
                );
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        mode: &SessionMode,
        settings: &SessionSettings,
    ) -> Result<ActiveSession, SessionError> {
        let agent = match mode {
            SessionMode::Model => None,
            SessionMode::Agent {
                project_name,
                agent_id,
            } => match non_empty(agent_id.clone()) {
                Some(agent_id) => Some((agent_id, project_name.clone())),
                None => {
                    self.transcript.push_error(AGENT_REQUIRED_MESSAGE);
                    return Err(SessionError::Config(AGENT_REQUIRED_MESSAGE.to_string()));
                }
            },
        };

        let held = self.refresh_credentials().await;
        let endpoint = Url::parse(held.endpoint.trim()).map_err(|e| {
            SessionError::Connection(format!("invalid endpoint {:?}: {}", held.endpoint, e))
        })?;
        let credential = Credential::resolve(&self.options.api_key, held.token.as_deref())
            .ok_or_else(|| SessionError::Connection("no API key or token configured".to_string()))?;

        let target = match agent {
            Some((agent_id, project_name)) => ClientTarget::Agent {
                agent_id,
                project_name,
                agent_access_token: credential.token().map(str::to_string),
            },
            None => ClientTarget::Model {
                deployment: settings.model.clone(),
            },
        };
        info!(
            endpoint = %endpoint,
            credential = credential.kind(),
            target = ?target,
            "Opening realtime session"
        );

        let client = self
            .factory
            .create(ClientRequest::new(endpoint, credential, target))
            .await?;
        match self.start_session(client.clone(), mode, settings).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    warn!(error = %close_err, "Failed to close half-open session");
                }
                Err(e)
            }
        }
    }

    async fn refresh_credentials(&self) -> HeldCredentials {
        if let Some(source) = &self.credential_source {
            match source.refresh().await {
                Ok(Some(fresh)) => {
                    let mut held = self.credentials.lock().expect("credentials mutex poisoned");
                    if let Some(endpoint) = non_empty(fresh.endpoint) {
                        held.endpoint = endpoint;
                    }
                    if let Some(token) = non_empty(fresh.token) {
                        held.token = Some(token);
                    }
                    debug!("Credentials refreshed");
                }
                Ok(None) => debug!("No managed config; keeping held credentials"),
                Err(e) => warn!(error = %e, "Credential refresh failed; keeping held credentials"),
            }
        }
        self.credentials
            .lock()
            .expect("credentials mutex poisoned")
            .clone()
    }

    async fn start_session(
        &self,
        client: Arc<dyn RealtimeClient>,
        mode: &SessionMode,
        settings: &SessionSettings,
    ) -> Result<ActiveSession, SessionError> {
        let info = client
            .configure(build_session_options(settings, mode))
            .await?;
        let events = client
            .events()
            .ok_or_else(|| SessionError::Connection("event stream already taken".to_string()))?;

        let avatar = match (&info.avatar, &self.avatar) {
            (Some(avatar), Some(negotiator)) => {
                match negotiator.negotiate(client.as_ref(), &avatar.ice_servers).await {
                    Ok(connection) => Some(connection),
                    Err(e) => {
                        warn!(session_id = %info.id, error = %e, "Avatar negotiation failed");
                        self.transcript
                            .push_error(format!("Error establishing avatar connection: {}", e));
                        None
                    }
                }
            }
            (Some(_), None) => {
                warn!(session_id = %info.id, "Avatar offered but no media transport configured");
                None
            }
            (None, _) => None,
        };

        let live = Arc::new(AtomicBool::new(true));
        let tools = ToolDispatcher::new(
            self.search.clone(),
            self.options.search_fields.clone(),
            self.transcript.clone(),
        );
        let dispatch = spawn_dispatch_loop(
            DispatchContext {
                client: client.clone(),
                transcript: self.transcript.clone(),
                activity: self.activity.clone(),
                player: self.player.clone(),
                tools: Arc::new(tools),
                live: live.clone(),
            },
            events,
        );

        Ok(ActiveSession {
            id: info.id,
            client,
            manual_turn_taking: settings.manual_turn_taking(),
            live,
            dispatch,
            avatar,
            proactive: None,
            recorder: None,
            meter: None,
        })
    }

    /// Make `session` the live one, unless a disconnect happened since the
    /// attempt started under `generation`.
    async fn activate(
        &self,
        mut session: ActiveSession,
        generation: u64,
        proactive: bool,
    ) -> Result<(), SessionError> {
        let mut slot = self.session.lock().await;
        if !self.settle(generation, LifecycleState::Connecting, LifecycleState::Connected) {
            drop(slot);
            info!(session_id = %session.id, "Disconnected while connecting; discarding session");
            close_session(session).await;
            return Err(SessionError::Connection(
                "connect cancelled by disconnect".to_string(),
            ));
        }

        self.recording.start();
        if proactive {
            session.proactive = Some(ProactiveTimer::start(
                session.client.clone(),
                self.activity.clone(),
                self.options.proactive,
            ));
        }
        let id = session.id.clone();
        *self
            .last_session_id
            .lock()
            .expect("session id mutex poisoned") = Some(id.clone());
        *slot = Some(session);
        drop(slot);

        info!(session_id = %id, "Session connected");
        self.transcript.push_status(format!(
            "Session started, click on the mic button to start conversation! debug id: {}",
            id
        ));
        Ok(())
    }

    // ── Disconnect ──────────────────────────────────────────────────────────

    /// Tear everything down. Safe from any state and repeatable. Any connect
    /// still in flight is cancelled.
    pub async fn disconnect(&self) {
        let generation = {
            let mut lifecycle = self.lifecycle.lock().expect("state mutex poisoned");
            lifecycle.generation += 1;
            lifecycle.state = LifecycleState::Disconnecting;
            lifecycle.generation
        };
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            close_session(session).await;
        }
        self.reset_media();
        self.settle(
            generation,
            LifecycleState::Disconnecting,
            LifecycleState::Disconnected,
        );
    }

    /// Controller-wide playback, activity, recording and surface reset.
    fn reset_media(&self) {
        self.player.stop();
        self.activity.reset();
        self.recording.stop();
        self.level.send_replace(0.0);
        if let Some(negotiator) = &self.avatar {
            negotiator.clear_surface();
        }
    }

    // ── Conversation input ──────────────────────────────────────────────────

    /// Send a typed user message and ask for a reply. Blank input is ignored.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let client = self.active_client().await?;
        self.transcript.push_user(text);
        client.send_item(ClientItem::user_text(text)).await?;
        client.generate_response(None).await
    }

    pub async fn start_recording(&self) -> Result<(), SessionError> {
        let microphone = self
            .microphone
            .clone()
            .ok_or_else(|| AudioError::DeviceUnavailable("no microphone configured".to_string()))?;

        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or(SessionError::NotConnected)?;
        if session.recorder.is_some() {
            return Err(AudioError::AlreadyRecording.into());
        }

        let targets = CaptureTargets {
            sink: Arc::new(SessionAudioSink {
                client: session.client.clone(),
            }),
            activity: self.activity.clone(),
            recording: self.recording.clone(),
            analyser: self.analyser.clone(),
        };
        let recorder = start_capture(microphone.as_ref(), targets, self.options.chunk_bytes).await?;
        session.recorder = Some(recorder);
        session.meter = Some(LevelMeter::spawn(
            self.analyser.clone(),
            self.activity.clone(),
            self.level.clone(),
        ));
        info!(session_id = %session.id, "Recording started");
        Ok(())
    }

    /// Stop capture. With manual turn-taking the buffered input is committed
    /// and answered.
    pub async fn stop_recording(&self) -> Result<(), SessionError> {
        let (recorder, meter, client, manual) = {
            let mut slot = self.session.lock().await;
            let Some(session) = slot.as_mut() else {
                return Ok(());
            };
            (
                session.recorder.take(),
                session.meter.take(),
                session.client.clone(),
                session.manual_turn_taking,
            )
        };
        let Some(recorder) = recorder else {
            return Ok(());
        };
        recorder.stop().await;
        if let Some(meter) = meter {
            meter.stop().await;
        }
        info!("Recording stopped");

        if manual {
            let item = client.commit_audio().await?;
            handle_input_audio(&self.transcript, &self.activity, &self.player, item).await;
            client.generate_response(None).await?;
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.lock().expect("state mutex poisoned").state
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.session.lock().await.as_ref().map(|s| s.id.clone())
    }

    /// Id of the most recent session that went live. Survives disconnect so
    /// the finished recording can be tagged with it.
    pub fn last_session_id(&self) -> Option<SessionId> {
        self.last_session_id
            .lock()
            .expect("session id mutex poisoned")
            .clone()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn activity(&self) -> &ActivitySignal {
        &self.activity
    }

    /// Voice activity level in `0.0..=MAX_ACTIVITY_LEVEL`.
    pub fn level(&self) -> watch::Receiver<f64> {
        self.level.subscribe()
    }

    pub async fn is_recording(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.recorder.is_some())
    }

    /// A finished session recording is ready for export.
    pub fn has_recording(&self) -> bool {
        !self.recording.is_active() && self.recording.has_recorded_audio()
    }

    pub fn take_recording(&self) -> Option<Vec<i16>> {
        self.has_recording().then(|| self.recording.take())
    }

    pub fn endpoint(&self) -> String {
        self.credentials
            .lock()
            .expect("credentials mutex poisoned")
            .endpoint
            .clone()
    }

    async fn active_client(&self) -> Result<Arc<dyn RealtimeClient>, SessionError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(SessionError::NotConnected)
    }

    /// Move `from -> to` only if no disconnect happened since `generation`.
    fn settle(&self, generation: u64, from: LifecycleState, to: LifecycleState) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("state mutex poisoned");
        if lifecycle.generation == generation && lifecycle.state == from {
            lifecycle.state = to;
            true
        } else {
            false
        }
    }
}

/// Release everything one session owns. Leaves controller-wide state alone.
async fn close_session(session: ActiveSession) {
    session.live.store(false, Ordering::SeqCst);
    if let Some(recorder) = session.recorder {
        recorder.stop().await;
    }
    if let Some(meter) = session.meter {
        meter.stop().await;
    }
    if let Some(proactive) = session.proactive {
        proactive.stop().await;
    }
    if let Err(e) = session.client.close().await {
        warn!(session_id = %session.id, error = %e, "Failed to close session client");
    }
    if let Some(avatar) = session.avatar {
        avatar.close().await;
    }
    session.dispatch.abort();
    info!(session_id = %session.id, "Session closed");
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::error::AvatarError;
    use crate::proactive::INACTIVITY_NUDGE;
    use crate::protocol::{AvatarSession, IceServer, SessionInfo};
    use crate::settings::{TurnDetectionMode, DEFAULT_MODEL};
    use crate::testing::{
        ClientCall, MockFactory, MockMicrophone, MockPeer, MockPeerFactory, MockSpeaker,
        MockSurface,
    };
    use crate::transcript::Role;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const ENDPOINT: &str = "https://example.cognitiveservices.azure.com/";

    struct StaticSource {
        result: Option<RefreshedCredentials>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn returning(result: Option<RefreshedCredentials>) -> Arc<Self> {
            Arc::new(Self {
                result,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: None,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialSource for StaticSource {
        async fn refresh(&self) -> anyhow::Result<Option<RefreshedCredentials>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("config endpoint unreachable");
            }
            Ok(self.result.clone())
        }
    }

    fn options() -> ControllerOptions {
        ControllerOptions {
            endpoint: ENDPOINT.to_string(),
            api_key: "test-key".to_string(),
            chunk_bytes: 8,
            ..ControllerOptions::default()
        }
    }

    fn controller(factory: Arc<MockFactory>) -> SessionControllerBuilder {
        SessionController::builder(factory, Arc::new(MockSpeaker::default()), options())
    }

    fn avatar_session() -> SessionInfo {
        SessionInfo {
            id: "sess-avatar".to_string(),
            avatar: Some(AvatarSession {
                ice_servers: vec![IceServer {
                    urls: vec!["stun:relay.example.com:3478".to_string()],
                    username: None,
                    credential: None,
                }],
            }),
        }
    }

    async fn wait_for_audio(factory: &MockFactory) {
        for _ in 0..100 {
            let sent = factory
                .last_client()
                .calls()
                .iter()
                .any(|call| matches!(call, ClientCall::SendAudio(_)));
            if sent {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("no audio reached the session");
    }

    #[tokio::test]
    async fn agent_mode_without_agent_fails_before_any_network_call() {
        let factory = Arc::new(MockFactory::new());
        let source = StaticSource::returning(None);
        let controller = controller(factory.clone())
            .credential_source(source.clone())
            .build();
        let mode = SessionMode::Agent {
            project_name: "proj".to_string(),
            agent_id: Some("  ".to_string()),
        };

        let err = controller
            .connect(&mode, &SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Config(_)));
        assert_eq!(source.calls(), 0);
        assert!(factory.requests().is_empty());
        let messages = controller.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Error);
        assert_eq!(messages[0].content, "Please input/select an agent.");
        assert_eq!(controller.state(), LifecycleState::Disconnected);
        assert_eq!(controller.session_id().await, None);
    }

    #[tokio::test]
    async fn connect_configures_once_and_announces_session() {
        let factory = Arc::new(MockFactory::new());
        let controller = controller(factory.clone()).build();

        controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap();

        assert_eq!(controller.state(), LifecycleState::Connected);
        assert_eq!(controller.session_id().await.as_deref(), Some("sess-test"));

        let requests = factory.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].api_version, "2025-05-01-preview");
        assert_eq!(
            requests[0].target,
            ClientTarget::Model {
                deployment: DEFAULT_MODEL.to_string()
            }
        );
        assert_eq!(requests[0].credential, Credential::ApiKey("test-key".to_string()));

        let calls = factory.last_client().calls();
        let configures = calls
            .iter()
            .filter(|call| matches!(call, ClientCall::Configure(_)))
            .count();
        assert_eq!(configures, 1);

        let status = &controller.transcript().messages()[0];
        assert_eq!(status.role, Role::Status);
        assert!(status.content.starts_with("Session started"));
        assert!(status.content.ends_with("debug id: sess-test"));

        controller.disconnect().await;
    }

    #[tokio::test]
    async fn connect_is_a_noop_while_connected() {
        let factory = Arc::new(MockFactory::new());
        let controller = controller(factory.clone()).build();
        let settings = SessionSettings::default();

        controller.connect(&SessionMode::Model, &settings).await.unwrap();
        controller.connect(&SessionMode::Model, &settings).await.unwrap();

        assert_eq!(factory.requests().len(), 1);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn refreshed_token_is_used_for_agent_sessions() {
        let factory = Arc::new(MockFactory::new());
        let source = StaticSource::returning(Some(RefreshedCredentials {
            endpoint: Some("https://managed.example.com/".to_string()),
            token: Some("fresh-token".to_string()),
        }));
        let controller = controller(factory.clone())
            .credential_source(source.clone())
            .build();
        let mode = SessionMode::Agent {
            project_name: "proj".to_string(),
            agent_id: Some("asst_1".to_string()),
        };

        controller
            .connect(&mode, &SessionSettings::default())
            .await
            .unwrap();

        let request = &factory.requests()[0];
        assert_eq!(request.endpoint.as_str(), "https://managed.example.com/");
        assert_eq!(request.credential, Credential::Token("fresh-token".to_string()));
        assert_eq!(
            request.target,
            ClientTarget::Agent {
                agent_id: "asst_1".to_string(),
                project_name: "proj".to_string(),
                agent_access_token: Some("fresh-token".to_string()),
            }
        );
        assert_eq!(controller.endpoint(), "https://managed.example.com/");
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn failed_refresh_keeps_held_credentials() {
        let factory = Arc::new(MockFactory::new());
        let source = StaticSource::failing();
        let controller = controller(factory.clone())
            .credential_source(source.clone())
            .build();

        controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(factory.requests()[0].endpoint.as_str(), ENDPOINT);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn invalid_endpoint_is_a_connection_error() {
        let factory = Arc::new(MockFactory::new());
        let controller = SessionController::builder(
            factory.clone(),
            Arc::new(MockSpeaker::default()),
            ControllerOptions {
                endpoint: "not a url".to_string(),
                api_key: "k".to_string(),
                ..ControllerOptions::default()
            },
        )
        .build();

        let err = controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Connection(_)));
        assert!(factory.requests().is_empty());
        let messages = controller.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0]
            .content
            .starts_with("Error connecting to the server: "));
        assert_eq!(controller.state(), LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn configure_failure_closes_half_built_client() {
        let factory = Arc::new(MockFactory::new().failing_configure("deployment not found"));
        let controller = controller(factory.clone()).build();

        let err = controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Client(_)));
        assert!(factory.last_client().is_closed());
        assert_eq!(controller.state(), LifecycleState::Disconnected);
        let messages = controller.transcript().messages();
        assert!(messages[0].content.contains("deployment not found"));

        // A later attempt is allowed.
        let err = controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Client(_)));
        assert_eq!(factory.clients().len(), 2);
    }

    #[tokio::test]
    async fn avatar_failure_leaves_session_connected() {
        let factory = Arc::new(MockFactory::with_session(avatar_session()));
        let negotiator = AvatarNegotiator::new(
            Arc::new(MockPeerFactory::failing("no codecs")),
            Arc::new(MockSurface::default()),
        );
        let controller = controller(factory.clone()).avatar(negotiator).build();

        controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap();

        assert_eq!(controller.state(), LifecycleState::Connected);
        let messages = controller.transcript().messages();
        assert_eq!(messages[0].role, Role::Error);
        assert_eq!(
            messages[0].content,
            format!(
                "Error establishing avatar connection: {}",
                AvatarError::PeerConnection("no codecs".to_string())
            )
        );
        assert_eq!(messages[1].role, Role::Status);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn avatar_negotiates_before_session_is_usable() {
        let factory = Arc::new(MockFactory::with_session(avatar_session()));
        let peer = Arc::new(MockPeer::default().gathering_completes());
        let surface = Arc::new(MockSurface::default());
        let peers = Arc::new(MockPeerFactory::with_peer(peer.clone()));
        let controller = controller(factory.clone())
            .avatar(AvatarNegotiator::new(peers.clone(), surface.clone()))
            .build();

        controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap();

        assert_eq!(peers.ice_servers().len(), 1);
        assert!(factory
            .last_client()
            .calls()
            .iter()
            .any(|call| matches!(call, ClientCall::ConnectAvatar(_))));
        assert!(peer.remote_description().is_some());

        controller.disconnect().await;
        assert!(peer.is_closed());
        assert_eq!(surface.clears(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_recording_stops_everything_repeatedly() {
        let factory = Arc::new(MockFactory::new());
        let microphone = Arc::new(MockMicrophone::default());
        let controller = controller(factory.clone())
            .microphone(microphone.clone())
            .build();
        let settings = SessionSettings {
            proactive: true,
            ..SessionSettings::default()
        };

        controller.connect(&SessionMode::Model, &settings).await.unwrap();
        controller.start_recording().await.unwrap();
        assert!(controller.is_recording().await);
        assert!(!controller.has_recording());

        controller.activity().update(Activity::UserSpeaking);
        let feed = microphone.feed().unwrap();
        feed.send(vec![1; 8]).await.unwrap();
        wait_for_audio(&factory).await;

        controller.disconnect().await;
        controller.disconnect().await;

        assert_eq!(controller.state(), LifecycleState::Disconnected);
        assert!(!controller.is_recording().await);
        assert!(feed.is_closed());
        assert_eq!(controller.activity().current(), Activity::Idle);
        assert_eq!(*controller.level().borrow(), 0.0);
        assert!(factory.last_client().is_closed());
        assert_eq!(controller.session_id().await, None);
        assert_eq!(controller.last_session_id().as_deref(), Some("sess-test"));

        // The proactive timer is gone: idling past the threshold sends nothing.
        let calls_at_disconnect = factory.last_client().calls().len();
        tokio::time::sleep(Duration::from_secs(15)).await;
        let calls = factory.last_client().calls();
        assert_eq!(calls.len(), calls_at_disconnect);
        assert!(!calls.contains(&ClientCall::SendItem(ClientItem::system_text(
            INACTIVITY_NUDGE
        ))));

        assert!(controller.has_recording());
        let samples = controller.take_recording().unwrap();
        assert_eq!(samples, vec![0x0101; 4]);
        assert!(!controller.has_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_inflight_connect_and_next_connect_wins() {
        let factory = Arc::new(MockFactory::with_session(avatar_session()));
        let peers = Arc::new(MockPeerFactory::with_peer(Arc::new(MockPeer::default())));
        let controller = Arc::new(
            controller(factory.clone())
                .avatar(AvatarNegotiator::new(peers, Arc::new(MockSurface::default())))
                .build(),
        );
        let spawn_connect = |controller: Arc<SessionController>| {
            tokio::spawn(async move {
                controller
                    .connect(&SessionMode::Model, &SessionSettings::default())
                    .await
            })
        };

        // The first attempt is parked in the ICE grace period.
        let first = spawn_connect(controller.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.state(), LifecycleState::Connecting);

        controller.disconnect().await;
        assert_eq!(controller.state(), LifecycleState::Disconnected);
        let second = spawn_connect(controller.clone());

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert!(matches!(first, Err(SessionError::Connection(_))));
        assert!(second.is_ok());
        assert_eq!(controller.state(), LifecycleState::Connected);
        let clients = factory.clients();
        assert_eq!(clients.len(), 2);
        assert!(clients[0].is_closed());
        assert!(!clients[1].is_closed());
        assert!(controller.recording.is_active());
        assert_eq!(controller.session_id().await.as_deref(), Some("sess-avatar"));

        controller.disconnect().await;
        assert!(clients[1].is_closed());
    }

    #[tokio::test]
    async fn connect_is_rejected_while_disconnecting() {
        let factory = Arc::new(MockFactory::new());
        let controller = controller(factory.clone()).build();
        controller.lifecycle.lock().unwrap().state = LifecycleState::Disconnecting;

        let err = controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Connection(_)));
        assert!(factory.requests().is_empty());
        assert_eq!(controller.state(), LifecycleState::Disconnecting);
    }

    #[tokio::test]
    async fn disconnect_without_session_is_harmless() {
        let controller = controller(Arc::new(MockFactory::new())).build();
        controller.disconnect().await;
        controller.disconnect().await;
        assert_eq!(controller.state(), LifecycleState::Disconnected);
        assert!(controller.transcript().messages().is_empty());
    }

    #[tokio::test]
    async fn send_text_sends_item_and_requests_response() {
        let factory = Arc::new(MockFactory::new());
        let controller = controller(factory.clone()).build();

        let err = controller.send_text("hello").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));

        controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap();
        controller.send_text("   ").await.unwrap();
        controller.send_text(" What time is it? ").await.unwrap();

        let calls = factory.last_client().calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(
            tail,
            &[
                ClientCall::SendItem(ClientItem::user_text("What time is it?")),
                ClientCall::GenerateResponse(None),
            ]
        );
        assert_eq!(controller.transcript().count(Role::User), 1);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn manual_turn_taking_commits_on_stop() {
        let factory = Arc::new(MockFactory::new());
        let controller = controller(factory.clone())
            .microphone(Arc::new(MockMicrophone::default()))
            .build();
        let mut settings = SessionSettings::default();
        settings.turn_detection.mode = TurnDetectionMode::Manual;

        controller.connect(&SessionMode::Model, &settings).await.unwrap();
        factory.last_client().set_commit_transcription("hello there");
        controller.start_recording().await.unwrap();
        controller.stop_recording().await.unwrap();

        let calls = factory.last_client().calls();
        assert!(calls.contains(&ClientCall::CommitAudio));
        assert_eq!(calls.last(), Some(&ClientCall::GenerateResponse(None)));
        let user = controller
            .transcript()
            .messages()
            .into_iter()
            .find(|m| m.role == Role::User)
            .unwrap();
        assert_eq!(user.content, "hello there");
        assert!(!controller.is_recording().await);
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn recording_requires_microphone_session_and_permission() {
        let factory = Arc::new(MockFactory::new());
        let without_mic = controller(factory.clone()).build();
        let err = without_mic.start_recording().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Audio(AudioError::DeviceUnavailable(_))
        ));

        let denied = controller(factory.clone())
            .microphone(Arc::new(MockMicrophone::denied()))
            .build();
        let err = denied.start_recording().await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));

        denied
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap();
        let err = denied.start_recording().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Audio(AudioError::PermissionDenied(_))
        ));
        assert!(!denied.is_recording().await);
        denied.disconnect().await;
    }

    #[tokio::test]
    async fn second_start_recording_is_rejected() {
        let factory = Arc::new(MockFactory::new());
        let controller = controller(factory.clone())
            .microphone(Arc::new(MockMicrophone::default()))
            .build();
        controller
            .connect(&SessionMode::Model, &SessionSettings::default())
            .await
            .unwrap();

        controller.start_recording().await.unwrap();
        let err = controller.start_recording().await.unwrap_err();
        assert!(matches!(err, SessionError::Audio(AudioError::AlreadyRecording)));
        controller.disconnect().await;
    }
}
