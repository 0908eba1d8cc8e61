//! Relay envelope codec
//!
//! Relay frames are JSON text. Outbound: `{"channel","to","type","payload"}`.
//! Inbound: `{"channel"?, "from"?, "type", "payload"}`, where `from` is the
//! sender stamped by the relay. Control frames (`join`, `leave`) carry the
//! local identity instead of an address.

use super::RelayFrame;
use crate::webrtc::signaling::{InboundEnvelope, OutboundEnvelope, Participant, SignalMessage};
use crate::webrtc::CallError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<Participant>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Frames the client sends to manage its channel membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayControl {
    Join {
        channel: String,
        user_id: String,
        display_name: String,
    },
    Leave {
        channel: String,
        user_id: String,
    },
}

/// JSON codec for relay frames
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Decode one inbound text frame
    pub fn decode(text: &str) -> Result<RelayFrame, CallError> {
        let wire: WireEnvelope = serde_json::from_str(text)
            .map_err(|e| CallError::Codec(format!("Invalid relay frame: {}", e)))?;

        if !SignalMessage::is_known_kind(&wire.kind) {
            return Ok(RelayFrame::Unknown { kind: wire.kind });
        }

        let message = SignalMessage::from_parts(&wire.kind, wire.payload)?;
        Ok(RelayFrame::Signal(InboundEnvelope {
            channel: wire.channel,
            from: wire.from,
            message,
        }))
    }

    /// Encode an addressed envelope
    pub fn encode(envelope: &OutboundEnvelope) -> Result<String, CallError> {
        let (kind, payload) = envelope.message.to_parts()?;
        let wire = WireEnvelope {
            channel: Some(envelope.channel.clone()),
            to: Some(envelope.to.clone()),
            from: None,
            kind: kind.to_string(),
            payload,
        };
        serde_json::to_string(&wire)
            .map_err(|e| CallError::Codec(format!("Failed to encode {}: {}", kind, e)))
    }

    /// Encode a membership control frame
    pub fn encode_control(control: &RelayControl) -> Result<String, CallError> {
        let wire = match control {
            RelayControl::Join { channel, user_id, display_name } => WireEnvelope {
                channel: Some(channel.clone()),
                to: None,
                from: None,
                kind: "join".to_string(),
                payload: json!({ "userId": user_id, "displayName": display_name }),
            },
            RelayControl::Leave { channel, user_id } => WireEnvelope {
                channel: Some(channel.clone()),
                to: None,
                from: None,
                kind: "leave".to_string(),
                payload: json!({ "userId": user_id }),
            },
        };
        serde_json::to_string(&wire)
            .map_err(|e| CallError::Codec(format!("Failed to encode control frame: {}", e)))
    }
}
