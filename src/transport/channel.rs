//! In-process relay
//!
//! Hands outbound envelopes to an mpsc receiver owned by the embedding
//! application, which routes them however it likes.

use super::SignalingRelay;
use crate::webrtc::signaling::OutboundEnvelope;
use crate::webrtc::CallError;
use tokio::sync::mpsc;

pub struct ChannelRelay {
    tx: mpsc::UnboundedSender<OutboundEnvelope>,
}

impl ChannelRelay {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalingRelay for ChannelRelay {
    fn send(&self, envelope: OutboundEnvelope) -> Result<(), CallError> {
        self.tx
            .send(envelope)
            .map_err(|_| CallError::Relay("relay receiver dropped".to_string()))
    }
}
