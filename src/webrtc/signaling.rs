//! Mesh Signaling Protocol
//!
//! Message shapes exchanged with the signaling relay: roster notifications
//! (`participant-joined`, `participant-left`, `existing-participants`) and the
//! per-peer SDP offer/answer and ICE candidate messages.

use super::CallError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote identity in the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    /// Ephemeral relay address of the participant's current connection
    pub relay_address: String,
}

impl Participant {
    pub fn new(user_id: &str, display_name: &str, relay_address: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            relay_address: relay_address.to_string(),
        }
    }
}

/// ICE candidate as carried over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: &str, sdp_mid: Option<&str>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Signaling message types for mesh negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// A participant entered the channel
    ParticipantJoined(Participant),

    /// A participant left the channel
    ParticipantLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Sent once to a newly joined participant
    ExistingParticipants(Vec<Participant>),

    /// SDP offer
    Offer { sdp: String },

    /// SDP answer
    Answer { sdp: String },

    /// Trickled ICE candidate
    IceCandidate { candidate: IceCandidate },
}

impl SignalMessage {
    /// Wire names of every message type the engine understands
    pub const KINDS: [&'static str; 6] = [
        "participant-joined",
        "participant-left",
        "existing-participants",
        "offer",
        "answer",
        "ice-candidate",
    ];

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::ParticipantJoined(_) => "participant-joined",
            SignalMessage::ParticipantLeft { .. } => "participant-left",
            SignalMessage::ExistingParticipants(_) => "existing-participants",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Whether `kind` names a known message type
    pub fn is_known_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }

    /// Rebuild a message from its wire type and payload
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, CallError> {
        let tagged = serde_json::json!({ "type": kind, "payload": payload });
        serde_json::from_value(tagged)
            .map_err(|e| CallError::Codec(format!("Invalid {} payload: {}", kind, e)))
    }

    /// Split a message into its wire type and payload
    pub fn to_parts(&self) -> Result<(&'static str, Value), CallError> {
        let mut tagged = serde_json::to_value(self)
            .map_err(|e| CallError::Codec(format!("Failed to serialize message: {}", e)))?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok((self.kind(), payload))
    }

    /// Create an offer message
    pub fn offer(sdp: String) -> Self {
        SignalMessage::Offer { sdp }
    }

    /// Create an answer message
    pub fn answer(sdp: String) -> Self {
        SignalMessage::Answer { sdp }
    }

    /// Create an ICE candidate message
    pub fn ice_candidate(candidate: IceCandidate) -> Self {
        SignalMessage::IceCandidate { candidate }
    }
}

/// Envelope received from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Channel the relay scoped this message to, if it says
    pub channel: Option<String>,
    /// Sender, stamped by the relay on peer messages
    pub from: Option<Participant>,
    pub message: SignalMessage,
}

/// Envelope addressed to one relay address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub channel: String,
    /// Relay address of the recipient
    pub to: String,
    pub message: SignalMessage,
}
