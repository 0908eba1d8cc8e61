//! Peer connection capability
//!
//! The engine does not implement ICE or SDP. It drives one [`PeerTransport`]
//! per remote participant, created through a [`TransportFactory`]. The
//! webrtc-rs backed implementation lives in `rtc_transport`.

use super::media_track::{LocalTrack, MediaKind, RemoteTrack};
use super::signaling::{IceCandidate, Participant};
use super::CallError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Connectivity state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::New => "new",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        }
    }
}

/// Kind of a remote session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Events a transport raises towards its owning session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and should be trickled
    LocalCandidate(IceCandidate),
    /// Connectivity state changed
    Connectivity(ConnectivityState),
    /// Remote media arrived
    RemoteTrack(RemoteTrack),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// An outbound sender slot on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSlot {
    pub index: usize,
    pub kind: MediaKind,
    /// Track currently bound to the slot
    pub track_id: Option<String>,
}

/// One peer connection towards one remote participant
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<String, CallError>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<String, CallError>;

    /// Apply a remote description
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), CallError>;

    /// Discard an outstanding local offer
    async fn rollback(&self) -> Result<(), CallError>;

    /// Discard an applied remote offer that was never answered
    async fn rollback_remote(&self) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;

    async fn has_local_description(&self) -> bool;

    async fn has_remote_description(&self) -> bool;

    /// Current outbound sender slots
    async fn senders(&self) -> Vec<SenderSlot>;

    /// Add a track on a new sender (requires renegotiation)
    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError>;

    /// Rebind an existing sender slot (no renegotiation)
    async fn replace_track(&self, slot: usize, track: Option<&LocalTrack>) -> Result<(), CallError>;

    async fn close(&self) -> Result<(), CallError>;
}

/// Creates transports for new peer sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        participant: &Participant,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, CallError>;
}
