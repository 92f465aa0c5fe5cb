//! Collaborator seams for local capture devices and the peer-connection engine.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use shared::{
    domain::CallMode,
    protocol::{IceCandidate, SessionDescription},
};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_mode(mode: CallMode) -> Self {
        Self {
            audio: true,
            video: mode.wants_video(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    AccessDenied(String),
    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),
}

/// A set of tracks, captured locally or received from the remote party.
pub trait MediaStream: Send + Sync {
    fn id(&self) -> String;
    fn track_kinds(&self) -> Vec<TrackKind>;
    fn stop(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteStream(Arc<dyn MediaStream>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::RemoteStream(stream) => {
                f.debug_tuple("RemoteStream").field(&stream.id()).finish()
            }
        }
    }
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn add_local_stream(&self, stream: Arc<dyn MediaStream>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, config: PeerConfig) -> anyhow::Result<Arc<dyn PeerSession>>;
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError> {
        Err(MediaError::DeviceUnavailable(format!(
            "no capture backend configured (audio={} video={})",
            constraints.audio, constraints.video
        )))
    }
}

pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn connect(&self, _config: PeerConfig) -> anyhow::Result<Arc<dyn PeerSession>> {
        Err(anyhow::anyhow!("peer connection engine is unavailable"))
    }
}
