//! Mesh call signaling and negotiation
//!
//! This module provides the per-channel call engine:
//! - Roster synchronization (who is in the call, where to reach them)
//! - One negotiation actor per remote participant
//! - SDP offer/answer and ICE candidate exchange over the signaling relay
//! - Local track propagation into every live peer connection

pub mod signaling;
pub mod media_track;
pub mod peer_connection;
pub mod negotiation;
pub mod session;
pub mod roster;
pub mod engine;

#[cfg(feature = "webrtc-transport")]
pub mod rtc_transport;

#[cfg(test)]
pub(crate) mod mock;

pub use engine::{CallEngine, CallEvent, CallHandle, EngineSettings};
pub use media_track::{LocalMediaSource, LocalTrack, MediaKind, RemoteTrack};
pub use negotiation::NegotiationState;
pub use peer_connection::{ConnectivityState, PeerTransport, TransportFactory};
pub use roster::SessionSnapshot;
pub use signaling::{IceCandidate, Participant, SignalMessage};

use std::error::Error;
use std::fmt;

/// Call engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Peer connection creation or teardown failed
    ConnectionFailed(String),
    /// SDP creation or application failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Local or remote media track error
    MediaError(String),
    /// No session for the given participant
    SessionNotFound(String),
    /// Operation not legal in the current negotiation state
    InvalidState(String),
    /// Signaling relay unreachable or closed
    Relay(String),
    /// Envelope could not be encoded or decoded
    Codec(String),
    /// Remote side did not respond in time
    Timeout(String),
    /// The engine task has exited
    EngineStopped,
    /// Feature not enabled
    FeatureDisabled,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            CallError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            CallError::IceError(msg) => write!(f, "ICE error: {}", msg),
            CallError::MediaError(msg) => write!(f, "Media error: {}", msg),
            CallError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            CallError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            CallError::Relay(msg) => write!(f, "Relay error: {}", msg),
            CallError::Codec(msg) => write!(f, "Codec error: {}", msg),
            CallError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            CallError::EngineStopped => write!(f, "Call engine is no longer running"),
            CallError::FeatureDisabled => write!(f, "WebRTC transport feature is not enabled"),
        }
    }
}

impl Error for CallError {}
