//! meshcall - multi-party call core
//!
//! Mesh WebRTC signaling and negotiation: one peer connection per remote
//! participant, negotiated over a channel-scoped signaling relay.

pub mod args;
pub mod config;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::{Config, WebRTCConfig};
pub use transport::{ChannelRelay, RelayFrame, SignalingRelay, WebSocketRelay};
pub use webrtc::{CallEngine, CallError, CallEvent, CallHandle, EngineSettings, LocalMediaSource};
