//! WebRTC PeerConnection transport
//!
//! webrtc-rs implementation of [`PeerTransport`]. Handles creation of
//! RTCPeerConnection instances, ICE server configuration and the mapping of
//! connection callbacks onto [`TransportEvent`]s.

use super::media_track::{LocalTrack, MediaKind, RemoteTrack, RemoteTrackReader};
use super::peer_connection::{
    ConnectivityState, PeerTransport, SdpKind, SenderSlot, TransportEvent, TransportEventSender,
    TransportFactory,
};
use super::signaling::{IceCandidate, Participant};
use super::CallError;
use crate::config::{IceServerConfig, WebRTCConfig};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use parking_lot::RwLock;
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const TURN_CREDENTIAL_TTL_SECS: u64 = 24 * 60 * 60;

/// RTP tracks backing the published [`LocalTrack`]s, shared by all transports
#[derive(Clone, Default)]
pub struct LocalTrackBank {
    tracks: Arc<RwLock<HashMap<String, Arc<TrackLocalStaticRTP>>>>,
}

impl LocalTrackBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an RTP track of `kind` and register it under a new track id
    pub fn create_track(&self, kind: MediaKind, stream_id: &str) -> (LocalTrack, Arc<TrackLocalStaticRTP>) {
        let local = LocalTrack::generate(kind, stream_id);
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            codec_capability(kind),
            local.id.clone(),
            local.stream_id.clone(),
        ));
        self.tracks.write().insert(local.id.clone(), rtp.clone());
        (local, rtp)
    }

    pub fn get(&self, track_id: &str) -> Option<Arc<TrackLocalStaticRTP>> {
        self.tracks.read().get(track_id).cloned()
    }


    fn resolve(&self, track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, CallError> {
        self.get(&track.id)
            .map(|rtp| rtp as Arc<dyn TrackLocal + Send + Sync>)
            .ok_or_else(|| CallError::MediaError(format!("Unknown local track {}", track.id)))
    }
}

fn codec_capability(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
    }
}

fn media_kind(codec_type: RTPCodecType) -> Option<MediaKind> {
    match codec_type {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn connectivity_state(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

/// Creates one RTCPeerConnection per remote participant
pub struct RtcTransportFactory {
    config: WebRTCConfig,
    tracks: LocalTrackBank,
}

impl RtcTransportFactory {
    pub fn new(config: WebRTCConfig, tracks: LocalTrackBank) -> Self {
        Self { config, tracks }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine)?;

        // Create interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = build_ice_servers(&self.config)
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| CallError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        participant: &Participant,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, CallError> {
        let peer_connection = self.create_peer_connection().await?;
        wire_events(&peer_connection, &participant.user_id, events);
        debug!("Created peer connection for {}", participant.user_id);
        Ok(Box::new(RtcTransport {
            peer_connection,
            tracks: self.tracks.clone(),
        }))
    }
}

/// Register the codecs published and accepted by the mesh
fn register_codecs(media_engine: &mut MediaEngine) -> Result<(), CallError> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(MediaKind::Audio),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| CallError::ConnectionFailed(format!("Failed to register Opus: {}", e)))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(MediaKind::Video),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| CallError::ConnectionFailed(format!("Failed to register VP8: {}", e)))?;

    Ok(())
}

/// Forward connection callbacks into the session's event channel
fn wire_events(peer_connection: &Arc<RTCPeerConnection>, user_id: &str, events: TransportEventSender) {
    let candidate_events = events.clone();
    let candidate_user = user_id.to_string();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        let user_id = candidate_user.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                debug!("ICE gathering complete for {}", user_id);
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("Failed to serialize local candidate for {}: {}", user_id, e),
            }
        })
    }));

    let state_events = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::Connectivity(connectivity_state(state)));
        })
    }));

    let track_user = user_id.to_string();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            let user_id = track_user.clone();
            Box::pin(async move {
                let Some(kind) = media_kind(track.kind()) else {
                    debug!("Ignoring remote track of unknown kind from {}", user_id);
                    return;
                };
                let remote = RemoteTrack::new(&track.id(), kind, &track.stream_id())
                    .with_reader(Arc::new(RtpReader { track }));
                let _ = events.send(TransportEvent::RemoteTrack(remote));
            })
        },
    ));
}

/// Reads RTP payloads from a remote track
struct RtpReader {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrackReader for RtpReader {
    async fn read_packet(&self) -> Result<Bytes, CallError> {
        let (packet, _attributes) = self
            .track
            .read_rtp()
            .await
            .map_err(|e| CallError::MediaError(format!("Failed to read RTP: {}", e)))?;
        Ok(packet.payload)
    }
}

/// One RTCPeerConnection towards one remote participant
pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    tracks: LocalTrackBank,
}

impl RtcTransport {
    async fn transceiver(&self, slot: usize) -> Result<Arc<RTCRtpTransceiver>, CallError> {
        self.peer_connection
            .get_transceivers()
            .await
            .get(slot)
            .cloned()
            .ok_or_else(|| CallError::MediaError(format!("No sender slot {}", slot)))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, CallError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| CallError::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, CallError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| CallError::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), CallError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| CallError::SdpError(format!("Invalid SDP {:?}: {}", kind, e)))?;

        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| CallError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<(), CallError> {
        let mut description = self
            .peer_connection
            .pending_local_description()
            .await
            .ok_or_else(|| CallError::InvalidState("No local offer to roll back".to_string()))?;
        description.sdp_type = RTCSdpType::Rollback;

        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| CallError::SdpError(format!("Failed to roll back local offer: {}", e)))
    }

    async fn rollback_remote(&self) -> Result<(), CallError> {
        let mut description = self
            .peer_connection
            .pending_remote_description()
            .await
            .ok_or_else(|| CallError::InvalidState("No remote offer to roll back".to_string()))?;
        description.sdp_type = RTCSdpType::Rollback;

        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| CallError::SdpError(format!("Failed to roll back remote offer: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| CallError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn has_local_description(&self) -> bool {
        self.peer_connection.local_description().await.is_some()
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn senders(&self) -> Vec<SenderSlot> {
        let mut slots = Vec::new();
        for (index, transceiver) in self.peer_connection.get_transceivers().await.iter().enumerate() {
            let Some(kind) = media_kind(transceiver.kind()) else {
                continue;
            };
            if !matches!(
                transceiver.direction(),
                RTCRtpTransceiverDirection::Sendrecv | RTCRtpTransceiverDirection::Sendonly
            ) {
                continue;
            }
            let sender = transceiver.sender().await;
            let track_id = sender.track().await.map(|track| track.id().to_string());
            slots.push(SenderSlot { index, kind, track_id });
        }
        slots
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let rtp = self.tracks.resolve(track)?;
        let sender = self
            .peer_connection
            .add_track(rtp)
            .await
            .map_err(|e| CallError::MediaError(format!("Failed to add {} track: {}", track.kind, e)))?;

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn replace_track(&self, slot: usize, track: Option<&LocalTrack>) -> Result<(), CallError> {
        let replacement = track.map(|t| self.tracks.resolve(t)).transpose()?;
        let sender = self.transceiver(slot).await?.sender().await;
        sender
            .replace_track(replacement)
            .await
            .map_err(|e| CallError::MediaError(format!("Failed to replace track: {}", e)))
    }

    async fn close(&self) -> Result<(), CallError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| CallError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        info!("Peer connection closed");
        Ok(())
    }
}

/// STUN/TURN servers from the config. Explicit `ice_servers` are used only
/// when no STUN or TURN host is configured.
pub fn build_ice_servers(config: &WebRTCConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    if !config.stun_host.is_empty() && config.stun_port != 0 {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let transport = if config.turn_protocol.is_empty() {
            "udp"
        } else {
            config.turn_protocol.as_str()
        };
        let url = format!("{}:{}:{}?transport={}", scheme, config.turn_host, config.turn_port, transport);

        let (username, credential) = if !config.turn_shared_secret.is_empty() {
            let expiry = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() + TURN_CREDENTIAL_TTL_SECS)
                .unwrap_or(TURN_CREDENTIAL_TTL_SECS);
            turn_rest_credentials(&config.turn_shared_secret, expiry)
        } else if !config.turn_username.is_empty() && !config.turn_password.is_empty() {
            (Some(config.turn_username.clone()), Some(config.turn_password.clone()))
        } else {
            (None, None)
        };

        servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }

    servers
}

/// Time-limited TURN REST username/password valid until `expiry`
fn turn_rest_credentials(secret: &str, expiry: u64) -> (Option<String>, Option<String>) {
    let user = format!("{}:meshcall", expiry);
    match hmac_sha1_base64(secret, &user) {
        Some(password) => (Some(user), Some(password)),
        None => {
            warn!("Invalid TURN shared secret, connecting without TURN credentials");
            (None, None)
        }
    }
}

fn hmac_sha1_base64(secret: &str, message: &str) -> Option<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    Some(base64::engine::general_purpose::STANDARD.encode(result))
}
