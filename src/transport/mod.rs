//! Signaling relay transport
//!
//! The engine only ever sees two things of the relay: a [`SignalingRelay`] to
//! queue outbound envelopes on, and a stream of [`RelayFrame`]s that the
//! binary (or an embedding application) feeds into the engine's
//! [`CallHandle`].

pub mod channel;
pub mod codec;
pub mod websocket;

pub use channel::ChannelRelay;
pub use codec::{EnvelopeCodec, RelayControl};
pub use websocket::{RelaySettings, WebSocketRelay};

use crate::webrtc::signaling::{InboundEnvelope, OutboundEnvelope};
use crate::webrtc::{CallError, CallHandle};
use log::{debug, info};
use tokio::sync::mpsc;

/// One decoded frame from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Signal(InboundEnvelope),
    /// A well-formed envelope whose type the engine does not handle
    Unknown { kind: String },
}

/// Outbound half of the signaling relay
pub trait SignalingRelay: Send + Sync {
    /// Queue an envelope for delivery; never waits on the network
    fn send(&self, envelope: OutboundEnvelope) -> Result<(), CallError>;
}

/// Feed relay frames into an engine until either side stops
pub async fn forward_frames(mut frames: mpsc::UnboundedReceiver<RelayFrame>, handle: CallHandle) {
    while let Some(frame) = frames.recv().await {
        if handle.deliver(frame).is_err() {
            debug!("Engine stopped, no longer forwarding relay frames");
            return;
        }
    }
    info!("Relay frame stream ended");
}
