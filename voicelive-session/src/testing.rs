//! In-crate test doubles for the client, device and transport seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::{AudioOutput, CaptureStream, ChunkSink, Microphone};
use crate::avatar::{
    MediaKind, MediaSurface, PeerConnection, PeerConnectionFactory, RemoteTrack,
    TransceiverDirection,
};
use crate::client::{
    ClientRequest, EventStream, InputAudioItem, RealtimeClient, RealtimeClientFactory, ServerEvent,
};
use crate::error::{AudioError, AvatarError, SessionError};
use crate::protocol::{
    ClientItem, IceServer, ResponseOptions, SdpType, SessionDescription, SessionInfo,
    SessionOptions,
};

// ---------------------------------------------------------------------------
// Realtime client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClientCall {
    Configure(Box<SessionOptions>),
    SendAudio(Vec<u8>),
    SendItem(ClientItem),
    GenerateResponse(Option<ResponseOptions>),
    ConnectAvatar(SessionDescription),
    CommitAudio,
    Close,
}

type EventSender = mpsc::Sender<Result<ServerEvent, SessionError>>;

pub(crate) struct MockClient {
    calls: Mutex<Vec<ClientCall>>,
    session: Mutex<SessionInfo>,
    configure_err: Mutex<Option<String>>,
    connect_avatar_err: Mutex<Option<String>>,
    commit_transcription: Mutex<Option<String>>,
    events_tx: Mutex<Option<EventSender>>,
    events_rx: Mutex<Option<EventStream>>,
}

impl MockClient {
    pub(crate) fn new() -> Self {
        Self::with_session(SessionInfo {
            id: "sess-test".to_string(),
            avatar: None,
        })
    }

    pub(crate) fn with_session(session: SessionInfo) -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            calls: Mutex::new(Vec::new()),
            session: Mutex::new(session),
            configure_err: Mutex::new(None),
            connect_avatar_err: Mutex::new(None),
            commit_transcription: Mutex::new(None),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn fail_configure(&self, message: &str) {
        *self.configure_err.lock().unwrap() = Some(message.to_string());
    }

    pub(crate) fn fail_connect_avatar(&self, message: &str) {
        *self.connect_avatar_err.lock().unwrap() = Some(message.to_string());
    }

    pub(crate) fn set_commit_transcription(&self, text: &str) {
        *self.commit_transcription.lock().unwrap() = Some(text.to_string());
    }

    pub(crate) fn event_sender(&self) -> Option<EventSender> {
        self.events_tx.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.calls().contains(&ClientCall::Close)
    }

    fn record(&self, call: ClientCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RealtimeClient for MockClient {
    async fn configure(&self, options: SessionOptions) -> Result<SessionInfo, SessionError> {
        self.record(ClientCall::Configure(Box::new(options)));
        if let Some(message) = self.configure_err.lock().unwrap().clone() {
            return Err(SessionError::client(message));
        }
        Ok(self.session.lock().unwrap().clone())
    }

    async fn send_audio(&self, chunk: &[u8]) -> Result<(), SessionError> {
        self.record(ClientCall::SendAudio(chunk.to_vec()));
        Ok(())
    }

    async fn send_item(&self, item: ClientItem) -> Result<(), SessionError> {
        self.record(ClientCall::SendItem(item));
        Ok(())
    }

    async fn generate_response(
        &self,
        options: Option<ResponseOptions>,
    ) -> Result<(), SessionError> {
        self.record(ClientCall::GenerateResponse(options));
        Ok(())
    }

    fn events(&self) -> Option<EventStream> {
        self.events_rx.lock().unwrap().take()
    }

    async fn connect_avatar(
        &self,
        local: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        self.record(ClientCall::ConnectAvatar(local));
        if let Some(message) = self.connect_avatar_err.lock().unwrap().clone() {
            return Err(SessionError::client(message));
        }
        Ok(SessionDescription {
            kind: SdpType::Answer,
            sdp: "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n".to_string(),
        })
    }

    async fn commit_audio(&self) -> Result<InputAudioItem, SessionError> {
        self.record(ClientCall::CommitAudio);
        let (tx, item) = InputAudioItem::channel("commit-1");
        let _ = tx.send(self.commit_transcription.lock().unwrap().clone());
        Ok(item)
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.record(ClientCall::Close);
        self.events_tx.lock().unwrap().take();
        Ok(())
    }
}

/// Hands out a fresh [`MockClient`] per connect attempt.
pub(crate) struct MockFactory {
    session: SessionInfo,
    create_err: Option<String>,
    configure_err: Option<String>,
    requests: Mutex<Vec<ClientRequest>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::with_session(SessionInfo {
            id: "sess-test".to_string(),
            avatar: None,
        })
    }

    pub(crate) fn with_session(session: SessionInfo) -> Self {
        Self {
            session,
            create_err: None,
            configure_err: None,
            requests: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_create(mut self, message: &str) -> Self {
        self.create_err = Some(message.to_string());
        self
    }

    pub(crate) fn failing_configure(mut self, message: &str) -> Self {
        self.configure_err = Some(message.to_string());
        self
    }

    pub(crate) fn requests(&self) -> Vec<ClientRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().unwrap().clone()
    }

    pub(crate) fn last_client(&self) -> Arc<MockClient> {
        self.clients
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no client created")
    }
}

#[async_trait]
impl RealtimeClientFactory for MockFactory {
    async fn create(&self, request: ClientRequest) -> Result<Arc<dyn RealtimeClient>, SessionError> {
        self.requests.lock().unwrap().push(request);
        if let Some(message) = &self.create_err {
            return Err(SessionError::Connection(message.clone()));
        }
        let client = Arc::new(MockClient::with_session(self.session.clone()));
        if let Some(message) = &self.configure_err {
            client.fail_configure(message);
        }
        self.clients.lock().unwrap().push(client.clone());
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// Audio devices
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockSpeaker {
    played: Mutex<Vec<Vec<u8>>>,
    halts: AtomicUsize,
}

impl MockSpeaker {
    pub(crate) fn played(&self) -> Vec<Vec<u8>> {
        self.played.lock().unwrap().clone()
    }

    pub(crate) fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for MockSpeaker {
    async fn play(&self, chunk: &[u8]) -> Result<(), AudioError> {
        self.played.lock().unwrap().push(chunk.to_vec());
        Ok(())
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockMicrophone {
    denied: bool,
    feed: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    opens: AtomicUsize,
}

impl MockMicrophone {
    pub(crate) fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    /// Sender for the most recently opened capture stream.
    pub(crate) fn feed(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.feed.lock().unwrap().clone()
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for MockMicrophone {
    async fn open(&self) -> Result<CaptureStream, AudioError> {
        if self.denied {
            return Err(AudioError::PermissionDenied("denied by user".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        *self.feed.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub(crate) fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkSink for RecordingSink {
    async fn send_chunk(&self, chunk: &[u8]) -> Result<(), SessionError> {
        self.chunks.lock().unwrap().push(chunk.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Avatar transport
// ---------------------------------------------------------------------------

pub(crate) struct MockPeer {
    transceivers: Mutex<Vec<(MediaKind, TransceiverDirection)>>,
    data_channels: Mutex<Vec<String>>,
    channel_feeds: Mutex<Vec<mpsc::Sender<String>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    track_tx: mpsc::Sender<RemoteTrack>,
    track_rx: Mutex<Option<mpsc::Receiver<RemoteTrack>>>,
    closed: AtomicBool,
    gathering_completes: bool,
}

impl Default for MockPeer {
    fn default() -> Self {
        let (track_tx, track_rx) = mpsc::channel(8);
        Self {
            transceivers: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            channel_feeds: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            track_tx,
            track_rx: Mutex::new(Some(track_rx)),
            closed: AtomicBool::new(false),
            gathering_completes: false,
        }
    }
}

impl MockPeer {
    pub(crate) fn gathering_completes(mut self) -> Self {
        self.gathering_completes = true;
        self
    }

    pub(crate) fn transceivers(&self) -> Vec<(MediaKind, TransceiverDirection)> {
        self.transceivers.lock().unwrap().clone()
    }

    pub(crate) fn data_channels(&self) -> Vec<String> {
        self.data_channels.lock().unwrap().clone()
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub(crate) async fn push_track(&self, track: RemoteTrack) {
        self.track_tx.send(track).await.unwrap();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), AvatarError> {
        self.transceivers.lock().unwrap().push((kind, direction));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<mpsc::Receiver<String>, AvatarError> {
        self.data_channels.lock().unwrap().push(label.to_string());
        let (tx, rx) = mpsc::channel(8);
        self.channel_feeds.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn create_offer(&self) -> Result<SessionDescription, AvatarError> {
        Ok(SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_string(),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), AvatarError> {
        *self.local.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), AvatarError> {
        *self.remote.lock().unwrap() = Some(description);
        Ok(())
    }

    fn remote_tracks(&self) -> Option<mpsc::Receiver<RemoteTrack>> {
        self.track_rx.lock().unwrap().take()
    }

    async fn ice_gathering_complete(&self) {
        if !self.gathering_completes {
            std::future::pending::<()>().await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct MockPeerFactory {
    peer: Arc<MockPeer>,
    ice_servers: Mutex<Vec<IceServer>>,
    create_err: Option<String>,
}

impl MockPeerFactory {
    pub(crate) fn with_peer(peer: Arc<MockPeer>) -> Self {
        Self {
            peer,
            ice_servers: Mutex::new(Vec::new()),
            create_err: None,
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            create_err: Some(message.to_string()),
            ..Self::with_peer(Arc::new(MockPeer::default()))
        }
    }

    pub(crate) fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, AvatarError> {
        *self.ice_servers.lock().unwrap() = ice_servers.to_vec();
        if let Some(message) = &self.create_err {
            return Err(AvatarError::PeerConnection(message.clone()));
        }
        Ok(self.peer.clone())
    }
}

#[derive(Default)]
pub(crate) struct MockSurface {
    clears: AtomicUsize,
    attached: Mutex<Vec<RemoteTrack>>,
}

impl MockSurface {
    pub(crate) fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub(crate) fn attached(&self) -> Vec<RemoteTrack> {
        self.attached.lock().unwrap().clone()
    }
}

impl MediaSurface for MockSurface {
    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn attach(&self, track: RemoteTrack) {
        self.attached.lock().unwrap().push(track);
    }
}
