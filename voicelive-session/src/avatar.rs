//! Avatar video transport: WebRTC offer/answer negotiation against the
//! realtime session's avatar-connect operation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::RealtimeClient;
use crate::error::AvatarError;
use crate::protocol::{IceServer, SessionDescription};

/// Time allowed for ICE candidate gathering before the offer is sent.
pub const ICE_GATHERING_GRACE: Duration = Duration::from_secs(2);
pub const EVENT_CHANNEL_LABEL: &str = "eventChannel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

// ---------------------------------------------------------------------------
// Transport seams
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), AvatarError>;

    /// Open a data channel and return its inbound message stream.
    async fn create_data_channel(&self, label: &str) -> Result<mpsc::Receiver<String>, AvatarError>;

    async fn create_offer(&self) -> Result<SessionDescription, AvatarError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), AvatarError>;

    /// Local description including whatever candidates were gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), AvatarError>;

    /// Incoming remote tracks. Only the first call returns the stream.
    fn remote_tracks(&self) -> Option<mpsc::Receiver<RemoteTrack>>;

    /// Resolves when ICE gathering completes. Implementations without a
    /// completion signal keep the default and rely on the grace period.
    async fn ice_gathering_complete(&self) {
        std::future::pending::<()>().await
    }

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, AvatarError>;
}

/// Where avatar media is rendered.
pub trait MediaSurface: Send + Sync {
    fn clear(&self);
    fn attach(&self, track: RemoteTrack);
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

/// An established avatar peer connection and its forwarding tasks.
pub struct AvatarConnection {
    peer: Arc<dyn PeerConnection>,
    tasks: Vec<JoinHandle<()>>,
}

impl AvatarConnection {
    pub async fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.peer.close().await;
    }
}

pub struct AvatarNegotiator {
    factory: Arc<dyn PeerConnectionFactory>,
    surface: Arc<dyn MediaSurface>,
    grace: Duration,
}

impl AvatarNegotiator {
    pub fn new(factory: Arc<dyn PeerConnectionFactory>, surface: Arc<dyn MediaSurface>) -> Self {
        Self {
            factory,
            surface,
            grace: ICE_GATHERING_GRACE,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn clear_surface(&self) {
        self.surface.clear();
    }

    /// Run the offer/answer exchange. On failure the peer connection is closed.
    pub async fn negotiate(
        &self,
        client: &dyn RealtimeClient,
        ice_servers: &[IceServer],
    ) -> Result<AvatarConnection, AvatarError> {
        self.surface.clear();
        let peer = self.factory.create(ice_servers).await?;
        let mut tasks = Vec::new();

        match self.exchange(client, &peer, &mut tasks).await {
            Ok(()) => {
                info!(ice_servers = ice_servers.len(), "Avatar connection established");
                Ok(AvatarConnection { peer, tasks })
            }
            Err(e) => {
                for task in &tasks {
                    task.abort();
                }
                peer.close().await;
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        client: &dyn RealtimeClient,
        peer: &Arc<dyn PeerConnection>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), AvatarError> {
        if let Some(mut tracks) = peer.remote_tracks() {
            let surface = self.surface.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(track) = tracks.recv().await {
                    debug!(track_id = %track.id, kind = ?track.kind, "Avatar track received");
                    surface.attach(track);
                }
            }));
        }

        peer.add_transceiver(MediaKind::Video, TransceiverDirection::SendRecv)
            .await?;
        peer.add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv)
            .await?;

        let mut channel = peer.create_data_channel(EVENT_CHANNEL_LABEL).await?;
        tasks.push(tokio::spawn(async move {
            while let Some(message) = channel.recv().await {
                debug!(channel = EVENT_CHANNEL_LABEL, %message, "Avatar data channel message");
            }
        }));

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer).await?;

        if tokio::time::timeout(self.grace, peer.ice_gathering_complete())
            .await
            .is_err()
        {
            debug!(grace_ms = self.grace.as_millis() as u64, "ICE grace period elapsed");
        }

        let local = peer
            .local_description()
            .await
            .ok_or(AvatarError::MissingLocalDescription)?;
        let remote = client.connect_avatar(local).await.map_err(|e| {
            warn!(error = %e, "Avatar connect rejected");
            AvatarError::Remote(e.to_string())
        })?;
        peer.set_remote_description(remote).await
    }
}
