//! Per-peer negotiation state machine
//!
//! ```text
//! stable --create offer--> have-local-offer --answer applied--> stable
//! stable --offer applied--> have-remote-offer --answer sent--> stable
//! ```
//!
//! [`Negotiation`] holds no I/O. The session actor asks it what to do with an
//! event, performs the transport call, and reports the result back, so every
//! flag is changed in exactly one transition.

use super::signaling::IceCandidate;
use std::collections::VecDeque;

/// Offer/answer state of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Stable => "stable",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
        }
    }
}

/// Why an offer is being created
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfferReason {
    /// Initial offer from an existing participant towards a new joiner
    Join,
    /// Local track set changed in a way that needs new media sections
    Renegotiate,
    /// Connectivity failed; restart ICE
    IceRestart,
}

impl OfferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferReason::Join => "join",
            OfferReason::Renegotiate => "renegotiate",
            OfferReason::IceRestart => "ice-restart",
        }
    }
}

/// What to do with an inbound offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// Apply it and answer
    Accept,
    /// Glare, and we yield: roll back our offer, then apply and answer
    RollbackAndAccept,
    /// Glare, and the remote yields: keep our offer outstanding
    KeepLocalOffer,
    /// Re-delivery of an offer we already answered
    Duplicate,
}

/// What to do with an inbound answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDecision {
    Apply,
    /// No local offer outstanding
    Stale,
}

/// Where a candidate goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateDecision {
    ApplyNow(IceCandidate),
    Queued,
}

/// Glare tie-break: the lexicographically larger user id discards its offer
pub fn local_yields(local_user_id: &str, remote_user_id: &str) -> bool {
    local_user_id > remote_user_id
}

/// `o=` line identity of a session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub session_id: String,
    pub version: u64,
}

impl SdpOrigin {
    /// Parse `o=<username> <sess-id> <sess-version> <nettype> <addrtype> <addr>`
    pub fn parse(sdp: &str) -> Option<Self> {
        let line = sdp.lines().find_map(|l| l.trim().strip_prefix("o="))?;
        let mut fields = line.split_whitespace();
        let _username = fields.next()?;
        let session_id = fields.next()?.to_string();
        let version = fields.next()?.parse().ok()?;
        Some(Self { session_id, version })
    }
}

/// Last remote description applied, for duplicate detection
#[derive(Debug, Clone, PartialEq, Eq)]
enum RemoteMark {
    Origin(SdpOrigin),
    Raw(String),
}

impl RemoteMark {
    fn of(sdp: &str) -> Self {
        match SdpOrigin::parse(sdp) {
            Some(origin) => RemoteMark::Origin(origin),
            None => RemoteMark::Raw(sdp.to_string()),
        }
    }

    /// Whether `sdp` carries nothing newer than this mark
    fn covers(&self, sdp: &str) -> bool {
        match (self, RemoteMark::of(sdp)) {
            (RemoteMark::Origin(seen), RemoteMark::Origin(incoming)) => {
                seen.session_id == incoming.session_id && incoming.version <= seen.version
            }
            (RemoteMark::Raw(seen), RemoteMark::Raw(incoming)) => *seen == incoming,
            _ => false,
        }
    }
}

/// Explicit negotiation state for one peer session
#[derive(Debug, Default)]
pub struct Negotiation {
    state: NegotiationState,
    negotiating: bool,
    round: u64,
    pending: VecDeque<IceCandidate>,
    remote_mark: Option<RemoteMark>,
    /// Mark to restore if the remote offer being answered is rolled back
    superseded_mark: Option<RemoteMark>,
    deferred: Option<OfferReason>,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// True while an offer/answer round trip we started is in flight
    pub fn is_negotiating(&self) -> bool {
        self.negotiating
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Whether a remote description has ever been applied
    pub fn has_remote_description(&self) -> bool {
        self.remote_mark.is_some()
    }

    /// No offer has been created or answered yet, so new tracks can ride
    /// along with the first one
    pub fn before_first_exchange(&self) -> bool {
        self.state == NegotiationState::Stable && !self.negotiating && self.remote_mark.is_none()
    }

    /// Start an offer. Returns the round id, or None if an offer is already in
    /// flight or the state does not allow one.
    pub fn begin_offer(&mut self) -> Option<u64> {
        if self.negotiating || self.state != NegotiationState::Stable {
            return None;
        }
        self.negotiating = true;
        self.round += 1;
        Some(self.round)
    }

    /// The local offer was created and applied
    pub fn offer_applied(&mut self) {
        self.state = NegotiationState::HaveLocalOffer;
    }

    /// Offer creation or application failed
    pub fn offer_failed(&mut self) {
        self.negotiating = false;
        self.state = NegotiationState::Stable;
    }

    /// Whether `round` is the offer still awaiting an answer
    pub fn is_outstanding(&self, round: u64) -> bool {
        self.negotiating && self.round == round && self.state == NegotiationState::HaveLocalOffer
    }

    /// The outstanding local offer was rolled back
    pub fn rolled_back(&mut self) {
        self.negotiating = false;
        self.state = NegotiationState::Stable;
    }

    pub fn on_offer(
        &self,
        sdp: &str,
        fully_described: bool,
        local_user_id: &str,
        remote_user_id: &str,
    ) -> OfferDecision {
        match self.state {
            NegotiationState::HaveLocalOffer => {
                if local_yields(local_user_id, remote_user_id) {
                    OfferDecision::RollbackAndAccept
                } else {
                    OfferDecision::KeepLocalOffer
                }
            }
            NegotiationState::Stable
                if fully_described
                    && self.remote_mark.as_ref().is_some_and(|mark| mark.covers(sdp)) =>
            {
                OfferDecision::Duplicate
            }
            _ => OfferDecision::Accept,
        }
    }

    /// The remote offer was applied. Returns queued candidates in arrival order.
    pub fn remote_offer_applied(&mut self, sdp: &str) -> Vec<IceCandidate> {
        self.state = NegotiationState::HaveRemoteOffer;
        self.superseded_mark = self.remote_mark.replace(RemoteMark::of(sdp));
        self.pending.drain(..).collect()
    }

    /// The local answer was created, applied and handed to the relay
    pub fn answer_sent(&mut self) {
        self.state = NegotiationState::Stable;
        self.superseded_mark = None;
    }

    /// The remote offer could not be answered and was rolled back. A
    /// re-delivery of the same offer is answered again.
    pub fn remote_offer_rolled_back(&mut self) {
        if self.state == NegotiationState::HaveRemoteOffer {
            self.remote_mark = self.superseded_mark.take();
        }
        self.state = NegotiationState::Stable;
    }

    pub fn on_answer(&self) -> AnswerDecision {
        if self.state == NegotiationState::HaveLocalOffer {
            AnswerDecision::Apply
        } else {
            AnswerDecision::Stale
        }
    }

    /// The remote answer was applied. Returns queued candidates in arrival order.
    pub fn answer_applied(&mut self, sdp: &str) -> Vec<IceCandidate> {
        self.state = NegotiationState::Stable;
        self.negotiating = false;
        self.remote_mark = Some(RemoteMark::of(sdp));
        self.pending.drain(..).collect()
    }

    /// Candidates wait until a remote description exists
    pub fn on_candidate(&mut self, candidate: IceCandidate) -> CandidateDecision {
        if self.remote_mark.is_some() {
            CandidateDecision::ApplyNow(candidate)
        } else {
            self.pending.push_back(candidate);
            CandidateDecision::Queued
        }
    }

    /// Remember an offer that could not start now
    pub fn defer(&mut self, reason: OfferReason) {
        self.deferred = Some(self.deferred.map_or(reason, |current| current.max(reason)));
    }

    /// Take the deferred offer once the session is stable and idle
    pub fn take_deferred(&mut self) -> Option<OfferReason> {
        if self.negotiating || self.state != NegotiationState::Stable {
            return None;
        }
        self.deferred.take()
    }
}
