//! Capability traits for the external media stack.
//!
//! The signaling engine configures and drives these handles but never
//! implements media itself: codec work, device access and transport live in
//! the embedding application's peer-connection library.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use campus_shared::error::SignalingError;
use campus_shared::protocol::{IceCandidate, SessionDescription};

/// A local captured audio track.
pub trait AudioSource: Send + Sync {
    /// Flip the track's enabled flag (mute/unmute). No renegotiation.
    fn set_enabled(&self, enabled: bool);

    fn enabled(&self) -> bool;

    /// Release the capture device.
    fn stop(&self);
}

/// Playback sink for the remote peer's audio.
pub trait RemoteAudioSink: Send + Sync {
    fn close(&self);
}

/// Events surfaced by a live peer connection.
pub enum PeerEvent {
    /// A local ICE candidate is ready to be relayed to the remote peer.
    IceCandidate(IceCandidate),
    /// The remote media track arrived and is playing through this sink.
    RemoteTrack(Arc<dyn RemoteAudioSink>),
}

/// One peer connection, configured by the signaling engine.
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, SignalingError>;

    async fn create_answer(&self) -> Result<SessionDescription, SignalingError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError>;

    async fn close(&self);
}

/// Factory for media resources, owned by the embedding application.
#[async_trait]
pub trait MediaGateway: Send + Sync {
    /// Acquire the local microphone. May be denied by the user or platform.
    async fn acquire_audio(&self) -> Result<Arc<dyn AudioSource>, SignalingError>;

    /// Build a peer connection wired to emit [`PeerEvent`]s on `events`.
    async fn create_peer_connection(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, SignalingError>;
}
