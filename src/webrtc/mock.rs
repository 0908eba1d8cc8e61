//! In-memory transports and relays for tests

use super::media_track::{LocalTrack, MediaKind};
use super::negotiation::NegotiationState;
use super::peer_connection::{
    PeerTransport, SdpKind, SenderSlot, TransportEvent, TransportEventSender, TransportFactory,
};
use super::signaling::{IceCandidate, InboundEnvelope, OutboundEnvelope, Participant};
use super::{CallError, CallHandle};
use crate::transport::{RelayFrame, SignalingRelay};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A plausible SDP whose origin identifies `user` at `version`
pub(crate) fn remote_sdp(user: &str, version: u64) -> String {
    let session_id = user
        .bytes()
        .fold(1_469_598_103_934_665_603u64, |h, b| (h ^ u64::from(b)).wrapping_mul(1_099_511_628_211))
        >> 1;
    format!(
        "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\na=sendrecv\r\n\
         a=rtpmap:111 opus/48000/2\r\n",
        session_id, version
    )
}

#[derive(Default)]
struct MockState {
    signaling: NegotiationState,
    has_local: bool,
    local_before_offer: bool,
    has_remote: bool,
    remote_before_offer: bool,
    version: u64,
    applied: Vec<IceCandidate>,
    reject: Option<String>,
    rollbacks: usize,
    remote_rollbacks: usize,
    ice_restarts: usize,
    senders: Vec<(MediaKind, Option<String>)>,
    closed: bool,
}

impl MockState {
    fn check_open(&self) -> Result<(), CallError> {
        if self.closed {
            Err(CallError::ConnectionFailed("transport closed".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Transport with the signaling state rules of a real peer connection
pub(crate) struct MockTransport {
    tag: String,
    state: Arc<Mutex<MockState>>,
    fail_offers: Arc<AtomicBool>,
    failing_answers: Arc<AtomicUsize>,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, CallError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(CallError::SdpError("offer creation disabled".to_string()));
        }
        let mut state = self.state.lock();
        state.check_open()?;
        if state.signaling != NegotiationState::Stable {
            return Err(CallError::InvalidState(format!(
                "create offer in {}",
                state.signaling.as_str()
            )));
        }
        if ice_restart {
            state.ice_restarts += 1;
        }
        state.local_before_offer = state.has_local;
        state.version += 1;
        state.has_local = true;
        state.signaling = NegotiationState::HaveLocalOffer;
        Ok(remote_sdp(&self.tag, state.version))
    }

    async fn create_answer(&self) -> Result<String, CallError> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.signaling != NegotiationState::HaveRemoteOffer {
            return Err(CallError::InvalidState(format!(
                "create answer in {}",
                state.signaling.as_str()
            )));
        }
        let failing = self
            .failing_answers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(CallError::SdpError("answer creation failed".to_string()));
        }
        state.version += 1;
        state.has_local = true;
        state.signaling = NegotiationState::Stable;
        Ok(remote_sdp(&self.tag, state.version))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), CallError> {
        let mut state = self.state.lock();
        state.check_open()?;
        if !sdp.starts_with("v=0") {
            return Err(CallError::SdpError("malformed description".to_string()));
        }
        let expected = match kind {
            SdpKind::Offer => NegotiationState::Stable,
            SdpKind::Answer => NegotiationState::HaveLocalOffer,
        };
        if state.signaling != expected {
            return Err(CallError::InvalidState(format!(
                "remote {:?} in {}",
                kind,
                state.signaling.as_str()
            )));
        }
        if kind == SdpKind::Offer {
            state.remote_before_offer = state.has_remote;
        }
        state.has_remote = true;
        state.signaling = match kind {
            SdpKind::Offer => NegotiationState::HaveRemoteOffer,
            SdpKind::Answer => NegotiationState::Stable,
        };
        Ok(())
    }

    async fn rollback(&self) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.signaling != NegotiationState::HaveLocalOffer {
            return Err(CallError::InvalidState("nothing to roll back".to_string()));
        }
        state.rollbacks += 1;
        state.has_local = state.local_before_offer;
        state.signaling = NegotiationState::Stable;
        Ok(())
    }

    async fn rollback_remote(&self) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.signaling != NegotiationState::HaveRemoteOffer {
            return Err(CallError::InvalidState("no remote offer to roll back".to_string()));
        }
        state.remote_rollbacks += 1;
        state.has_remote = state.remote_before_offer;
        state.signaling = NegotiationState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let mut state = self.state.lock();
        state.check_open()?;
        if !state.has_remote {
            return Err(CallError::IceError("no remote description".to_string()));
        }
        if let Some(pattern) = &state.reject {
            if candidate.candidate.contains(pattern.as_str()) {
                return Err(CallError::IceError(format!("rejected {}", candidate.candidate)));
            }
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn has_local_description(&self) -> bool {
        self.state.lock().has_local
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().has_remote
    }

    async fn senders(&self) -> Vec<SenderSlot> {
        self.state
            .lock()
            .senders
            .iter()
            .enumerate()
            .map(|(index, (kind, track_id))| SenderSlot {
                index,
                kind: *kind,
                track_id: track_id.clone(),
            })
            .collect()
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.senders.push((track.kind, Some(track.id.clone())));
        Ok(())
    }

    async fn replace_track(&self, slot: usize, track: Option<&LocalTrack>) -> Result<(), CallError> {
        let mut state = self.state.lock();
        state.check_open()?;
        let (kind, current) = state
            .senders
            .get_mut(slot)
            .ok_or_else(|| CallError::MediaError(format!("no sender slot {}", slot)))?;
        if let Some(track) = track {
            if track.kind != *kind {
                return Err(CallError::MediaError("kind mismatch".to_string()));
            }
        }
        *current = track.map(|t| t.id.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Test-side view of a mock transport
#[derive(Clone)]
pub(crate) struct MockProbe {
    state: Arc<Mutex<MockState>>,
    events: TransportEventSender,
}

impl MockProbe {
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn reject_candidates_containing(&self, pattern: &str) {
        self.state.lock().reject = Some(pattern.to_string());
    }

    pub fn has_remote(&self) -> bool {
        self.state.lock().has_remote
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn remote_rollbacks(&self) -> usize {
        self.state.lock().remote_rollbacks
    }

    pub fn signaling(&self) -> NegotiationState {
        self.state.lock().signaling
    }

    pub fn ice_restarts(&self) -> usize {
        self.state.lock().ice_restarts
    }

    pub fn sender_track_ids(&self) -> Vec<Option<String>> {
        self.state.lock().senders.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Raise an event as if the transport produced it
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.emit(TransportEvent::LocalCandidate(IceCandidate::new(candidate, Some("0"), Some(0))));
    }
}

#[derive(Default)]
struct FactoryState {
    probes: HashMap<String, MockProbe>,
}

/// Factory handing out [`MockTransport`]s keyed by remote user id
#[derive(Clone, Default)]
pub(crate) struct MockFactory {
    state: Arc<Mutex<FactoryState>>,
    created: Arc<AtomicUsize>,
    fail_offers: Arc<AtomicBool>,
    failing_answers: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe of the latest transport created for `user_id`
    pub fn probe(&self, user_id: &str) -> Option<MockProbe> {
        self.state.lock().probes.get(user_id).cloned()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` answer creations fail
    pub fn fail_next_answers(&self, count: usize) {
        self.failing_answers.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        participant: &Participant,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, CallError> {
        let seq = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(Mutex::new(MockState::default()));
        self.state.lock().probes.insert(
            participant.user_id.clone(),
            MockProbe {
                state: state.clone(),
                events,
            },
        );
        Ok(Box::new(MockTransport {
            tag: format!("to-{}-{}", participant.user_id, seq),
            state,
            fail_offers: self.fail_offers.clone(),
            failing_answers: self.failing_answers.clone(),
        }))
    }
}

/// Relay that only records what it is asked to send
#[derive(Default)]
pub(crate) struct RecordingRelay {
    sent: Mutex<Vec<OutboundEnvelope>>,
}

impl RecordingRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<OutboundEnvelope> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.message.kind() == kind)
            .cloned()
            .collect()
    }
}

impl SignalingRelay for RecordingRelay {
    fn send(&self, envelope: OutboundEnvelope) -> Result<(), CallError> {
        self.sent.lock().push(envelope);
        Ok(())
    }
}

#[derive(Default)]
struct HubState {
    engines: HashMap<String, CallHandle>,
    log: Vec<(String, OutboundEnvelope)>,
}

/// Relay that connects engines in one process, stamping `from` like the
/// real relay does
pub(crate) struct LoopbackHub {
    channel: String,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            state: Arc::new(Mutex::new(HubState::default())),
        }
    }

    /// Relay endpoint for one participant
    pub fn relay_for(&self, participant: &Participant) -> Arc<dyn SignalingRelay> {
        Arc::new(LoopbackRelay {
            channel: self.channel.clone(),
            from: participant.clone(),
            state: self.state.clone(),
        })
    }

    /// Route envelopes addressed to the participant into `handle`
    pub fn register(&self, participant: &Participant, handle: CallHandle) {
        self.state
            .lock()
            .engines
            .insert(participant.relay_address.clone(), handle);
    }

    pub fn sent_by(&self, user_id: &str, kind: &str) -> Vec<OutboundEnvelope> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(from, e)| from == user_id && e.message.kind() == kind)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn sent_to(&self, address: &str) -> Vec<OutboundEnvelope> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(_, e)| e.to == address)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

struct LoopbackRelay {
    channel: String,
    from: Participant,
    state: Arc<Mutex<HubState>>,
}

impl SignalingRelay for LoopbackRelay {
    fn send(&self, envelope: OutboundEnvelope) -> Result<(), CallError> {
        let target = {
            let mut state = self.state.lock();
            state.log.push((self.from.user_id.clone(), envelope.clone()));
            state.engines.get(&envelope.to).cloned()
        };
        if let Some(target) = target {
            let _ = target.deliver(RelayFrame::Signal(InboundEnvelope {
                channel: Some(self.channel.clone()),
                from: Some(self.from.clone()),
                message: envelope.message,
            }));
        }
        Ok(())
    }
}
