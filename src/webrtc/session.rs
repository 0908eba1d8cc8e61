//! Peer Session Management
//!
//! One actor task per remote participant. The task exclusively owns the
//! participant's transport and negotiation state and handles its commands
//! strictly in arrival order. Everything it wants the outside world to see
//! (signaling messages, connectivity, remote tracks, errors) is reported to
//! the engine tagged with the session's generation, so reports from a session
//! that has since been removed can be recognised and dropped.

use super::media_track::{LocalTrack, RemoteTrack};
use super::negotiation::{
    AnswerDecision, CandidateDecision, Negotiation, NegotiationState, OfferDecision, OfferReason,
};
use super::peer_connection::{
    ConnectivityState, PeerTransport, SdpKind, TransportEvent, TransportFactory,
};
use super::signaling::{IceCandidate, Participant, SignalMessage};
use super::CallError;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Health of a session with respect to connectivity recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Healthy,
    /// A connectivity restart is in progress
    Restarting,
    /// The restart failed; waiting for the caller to decide
    Degraded,
}

impl SessionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionHealth::Healthy => "healthy",
            SessionHealth::Restarting => "restarting",
            SessionHealth::Degraded => "degraded",
        }
    }
}

/// Observable state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub negotiation_state: NegotiationState,
    pub negotiating: bool,
    pub pending_candidates: usize,
    pub connectivity: ConnectivityState,
    pub health: SessionHealth,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            negotiation_state: NegotiationState::Stable,
            negotiating: false,
            pending_candidates: 0,
            connectivity: ConnectivityState::New,
            health: SessionHealth::Healthy,
        }
    }
}

/// Commands handled by a session actor
#[derive(Debug)]
pub enum SessionCommand {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    InitiateOffer(OfferReason),
    /// The local track set changed
    SyncTracks(Vec<LocalTrack>),
    NegotiationTimeout { round: u64 },
    Close,
}

/// What a session reports to the engine
#[derive(Debug)]
pub enum SessionOutput {
    /// Send to the participant's current relay address
    Signal(SignalMessage),
    Connectivity(ConnectivityState),
    RemoteTrack(RemoteTrack),
    /// A failure that exhausted local recovery
    Error(String),
    /// The transport could not be created; the session is gone
    Closed(String),
}

/// A report tagged with the session it came from
#[derive(Debug)]
pub struct SessionReport {
    pub user_id: String,
    pub generation: u64,
    pub output: SessionOutput,
}

/// Everything a session needs to start
pub struct SessionContext {
    pub local_user_id: String,
    pub participant: Participant,
    pub generation: u64,
    /// Tracks attached to the transport before the first negotiation
    pub tracks: Vec<LocalTrack>,
    pub factory: Arc<dyn TransportFactory>,
    pub negotiation_timeout: Duration,
    pub reports: mpsc::UnboundedSender<SessionReport>,
}

/// Cloneable sender into a session actor
#[derive(Debug, Clone)]
pub struct SessionSender {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionSender {
    /// Queue a command. Returns false if the session has exited.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Engine-side handle of a running session
pub struct SessionHandle {
    pub generation: u64,
    sender: SessionSender,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn the session actor
    pub fn spawn(ctx: SessionContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let generation = ctx.generation;
        let timer_tx = tx.downgrade();

        let task = tokio::spawn(async move {
            let user_id = ctx.participant.user_id.clone();
            let reports = ctx.reports.clone();
            match PeerSession::open(ctx, timer_tx, status_tx).await {
                Ok((session, events)) => session.run(rx, events).await,
                Err(e) => {
                    warn!("Failed to open session for {}: {}", user_id, e);
                    let _ = reports.send(SessionReport {
                        user_id,
                        generation,
                        output: SessionOutput::Closed(e.to_string()),
                    });
                }
            }
        });

        Self {
            generation,
            sender: SessionSender { commands: tx },
            status: status_rx,
            task,
        }
    }

    pub fn send(&self, command: SessionCommand) -> bool {
        self.sender.send(command)
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Ask the actor to close its transport and exit
    pub fn close(self) -> JoinHandle<()> {
        self.sender.send(SessionCommand::Close);
        self.task
    }
}

/// Negotiation unit for one remote participant
pub struct PeerSession {
    local_user_id: String,
    participant: Participant,
    generation: u64,
    transport: Box<dyn PeerTransport>,
    negotiation: Negotiation,
    connectivity: ConnectivityState,
    health: SessionHealth,
    restart_attempted: bool,
    negotiation_timeout: Duration,
    timeout_task: Option<JoinHandle<()>>,
    timer_tx: mpsc::WeakUnboundedSender<SessionCommand>,
    reports: mpsc::UnboundedSender<SessionReport>,
    status: watch::Sender<SessionStatus>,
}

impl PeerSession {
    /// Create the transport and attach the current local tracks
    async fn open(
        ctx: SessionContext,
        timer_tx: mpsc::WeakUnboundedSender<SessionCommand>,
        status: watch::Sender<SessionStatus>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), CallError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = ctx.factory.create(&ctx.participant, events_tx).await?;

        for track in &ctx.tracks {
            if let Err(e) = transport.add_track(track).await {
                warn!("Session {}: failed to attach {} track {}: {}", ctx.participant.user_id, track.kind, track.id, e);
            }
        }

        info!("Created peer session for {} (generation {})", ctx.participant.user_id, ctx.generation);

        let session = Self {
            local_user_id: ctx.local_user_id,
            participant: ctx.participant,
            generation: ctx.generation,
            transport,
            negotiation: Negotiation::new(),
            connectivity: ConnectivityState::New,
            health: SessionHealth::Healthy,
            restart_attempted: false,
            negotiation_timeout: ctx.negotiation_timeout,
            timeout_task: None,
            timer_tx,
            reports: ctx.reports,
            status,
        };
        Ok((session, events_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => self.handle_transport_event(event).await,
            }
            self.publish_status();
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Offer { sdp } => self.handle_offer(sdp).await,
            SessionCommand::Answer { sdp } => self.handle_answer(sdp).await,
            SessionCommand::Candidate(candidate) => self.handle_candidate(candidate).await,
            SessionCommand::InitiateOffer(reason) => self.initiate_offer(reason).await,
            SessionCommand::SyncTracks(tracks) => self.sync_tracks(&tracks).await,
            SessionCommand::NegotiationTimeout { round } => self.handle_timeout(round).await,
            SessionCommand::Close => {}
        }
    }

    async fn initiate_offer(&mut self, reason: OfferReason) {
        let user_id = &self.participant.user_id;

        // Only the first offer towards a joiner is conditional: skip it if the
        // peer has already negotiated with us.
        if reason == OfferReason::Join
            && (self.negotiation.state() != NegotiationState::Stable
                || self.negotiation.has_remote_description())
        {
            debug!("Session {}: skipping join offer, negotiation already under way", user_id);
            return;
        }

        let Some(round) = self.negotiation.begin_offer() else {
            if reason == OfferReason::Join {
                debug!("Session {}: offer already in flight", user_id);
            } else {
                debug!("Session {}: deferring {} offer until stable", user_id, reason.as_str());
                self.negotiation.defer(reason);
            }
            return;
        };

        match self.transport.create_offer(reason == OfferReason::IceRestart).await {
            Ok(sdp) => {
                self.negotiation.offer_applied();
                debug!("Session {}: sending {} offer (round {})", user_id, reason.as_str(), round);
                self.report(SessionOutput::Signal(SignalMessage::offer(sdp)));
                self.arm_timeout(round);
            }
            Err(e) => {
                self.negotiation.offer_failed();
                self.negotiation_failed(format!("Failed to create offer: {}", e));
            }
        }
    }

    async fn handle_offer(&mut self, sdp: String) {
        let fully_described =
            self.transport.has_local_description().await && self.transport.has_remote_description().await;
        let decision = self.negotiation.on_offer(
            &sdp,
            fully_described,
            &self.local_user_id,
            &self.participant.user_id,
        );

        match decision {
            OfferDecision::Duplicate => {
                debug!("Session {}: ignoring duplicate offer", self.participant.user_id);
            }
            OfferDecision::KeepLocalOffer => {
                warn!(
                    "Session {}: simultaneous offers, keeping local offer (remote yields)",
                    self.participant.user_id
                );
            }
            OfferDecision::RollbackAndAccept => {
                warn!(
                    "Session {}: simultaneous offers, discarding local offer",
                    self.participant.user_id
                );
                self.cancel_timeout();
                if let Err(e) = self.transport.rollback().await {
                    self.negotiation.rolled_back();
                    self.negotiation_failed(format!("Failed to roll back local offer: {}", e));
                    return;
                }
                self.negotiation.rolled_back();
                self.answer_offer(sdp).await;
            }
            OfferDecision::Accept => self.answer_offer(sdp).await,
        }
    }

    async fn answer_offer(&mut self, sdp: String) {
        if let Err(e) = self.transport.set_remote_description(SdpKind::Offer, &sdp).await {
            self.negotiation_failed(format!("Failed to apply remote offer: {}", e));
            self.after_stable().await;
            return;
        }

        let queued = self.negotiation.remote_offer_applied(&sdp);
        self.apply_candidates(queued).await;

        match self.transport.create_answer().await {
            Ok(answer) => {
                self.negotiation.answer_sent();
                debug!("Session {}: sending answer", self.participant.user_id);
                self.report(SessionOutput::Signal(SignalMessage::answer(answer)));
                self.after_stable().await;
            }
            Err(e) => {
                if let Err(rollback_err) = self.transport.rollback_remote().await {
                    debug!(
                        "Session {}: rollback of unanswered offer failed: {}",
                        self.participant.user_id, rollback_err
                    );
                }
                self.negotiation.remote_offer_rolled_back();
                self.negotiation_failed(format!("Failed to create answer: {}", e));
                self.after_stable().await;
            }
        }
    }

    async fn handle_answer(&mut self, sdp: String) {
        if self.negotiation.on_answer() == AnswerDecision::Stale {
            debug!(
                "Session {}: ignoring answer in state {}",
                self.participant.user_id,
                self.negotiation.state().as_str()
            );
            return;
        }

        self.cancel_timeout();
        if let Err(e) = self.transport.set_remote_description(SdpKind::Answer, &sdp).await {
            if let Err(rollback_err) = self.transport.rollback().await {
                debug!("Session {}: rollback after bad answer failed: {}", self.participant.user_id, rollback_err);
            }
            self.negotiation.rolled_back();
            self.negotiation_failed(format!("Failed to apply remote answer: {}", e));
            return;
        }

        let queued = self.negotiation.answer_applied(&sdp);
        self.apply_candidates(queued).await;
        debug!("Session {}: negotiation complete", self.participant.user_id);
        self.after_stable().await;
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) {
        match self.negotiation.on_candidate(candidate) {
            CandidateDecision::ApplyNow(candidate) => self.apply_candidates(vec![candidate]).await,
            CandidateDecision::Queued => {
                debug!(
                    "Session {}: queued candidate ({} pending)",
                    self.participant.user_id,
                    self.negotiation.pending_candidates()
                );
            }
        }
    }

    /// Apply candidates in order; a bad candidate is dropped, never fatal
    async fn apply_candidates(&mut self, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!("Session {}: dropping candidate: {}", self.participant.user_id, e);
            }
        }
    }

    /// Run any offer that was deferred while negotiating
    async fn after_stable(&mut self) {
        if let Some(reason) = self.negotiation.take_deferred() {
            self.initiate_offer(reason).await;
        }
    }

    async fn handle_timeout(&mut self, round: u64) {
        if !self.negotiation.is_outstanding(round) {
            return;
        }
        self.timeout_task = None;
        warn!(
            "Session {}: no answer within {:?}, abandoning offer",
            self.participant.user_id, self.negotiation_timeout
        );
        if let Err(e) = self.transport.rollback().await {
            debug!("Session {}: rollback after timeout failed: {}", self.participant.user_id, e);
        }
        self.negotiation.rolled_back();
        let err = CallError::Timeout(format!("no answer within {}s", self.negotiation_timeout.as_secs()));
        self.negotiation_failed(err.to_string());
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.report(SessionOutput::Signal(SignalMessage::ice_candidate(candidate)));
            }
            TransportEvent::RemoteTrack(track) => {
                info!(
                    "Session {}: remote {} track {}",
                    self.participant.user_id, track.kind, track.id
                );
                self.report(SessionOutput::RemoteTrack(track));
            }
            TransportEvent::Connectivity(state) => self.connectivity_changed(state).await,
        }
    }

    async fn connectivity_changed(&mut self, state: ConnectivityState) {
        if state == self.connectivity {
            return;
        }
        info!(
            "Session {} connectivity: {} -> {}",
            self.participant.user_id,
            self.connectivity.as_str(),
            state.as_str()
        );
        self.connectivity = state;
        self.report(SessionOutput::Connectivity(state));

        match state {
            ConnectivityState::Connected => {
                self.restart_attempted = false;
                self.health = SessionHealth::Healthy;
            }
            ConnectivityState::Failed if !self.restart_attempted => {
                self.restart_attempted = true;
                self.health = SessionHealth::Restarting;
                info!("Session {}: attempting connectivity restart", self.participant.user_id);
                self.initiate_offer(OfferReason::IceRestart).await;
            }
            ConnectivityState::Failed => {
                self.degrade("connectivity failed again after restart".to_string());
            }
            _ => {}
        }
    }

    /// Push the local track set into this transport
    async fn sync_tracks(&mut self, tracks: &[LocalTrack]) {
        let senders = self.transport.senders().await;
        let wanted: HashSet<&str> = tracks.iter().map(|t| t.id.as_str()).collect();
        let present: HashSet<&str> = senders.iter().filter_map(|s| s.track_id.as_deref()).collect();

        // Slots whose track is no longer published can be reused
        let mut free: Vec<_> = senders
            .iter()
            .filter(|s| s.track_id.as_deref().map_or(true, |id| !wanted.contains(id)))
            .collect();

        let mut needs_offer = false;
        for track in tracks.iter().filter(|t| !present.contains(t.id.as_str())) {
            if let Some(pos) = free.iter().position(|s| s.kind == track.kind) {
                let slot = free.remove(pos);
                match self.transport.replace_track(slot.index, Some(track)).await {
                    Ok(()) => debug!(
                        "Session {}: replaced {} slot {} with {}",
                        self.participant.user_id, track.kind, slot.index, track.id
                    ),
                    Err(e) => warn!("Session {}: replace track failed: {}", self.participant.user_id, e),
                }
            } else {
                match self.transport.add_track(track).await {
                    Ok(()) => needs_offer = true,
                    Err(e) => warn!("Session {}: add track failed: {}", self.participant.user_id, e),
                }
            }
        }

        for slot in free.into_iter().filter(|s| s.track_id.is_some()) {
            if let Err(e) = self.transport.replace_track(slot.index, None).await {
                warn!("Session {}: failed to clear slot {}: {}", self.participant.user_id, slot.index, e);
            }
        }

        // Before the first offer, new tracks ride along with it. Otherwise a
        // busy session defers the renegotiation until it is stable again.
        if needs_offer && !self.negotiation.before_first_exchange() {
            self.initiate_offer(OfferReason::Renegotiate).await;
        }
    }

    fn arm_timeout(&mut self, round: u64) {
        self.cancel_timeout();
        let timer_tx = self.timer_tx.clone();
        let timeout = self.negotiation_timeout;
        self.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = timer_tx.upgrade() {
                let _ = tx.send(SessionCommand::NegotiationTimeout { round });
            }
        }));
    }

    fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }

    /// Surface a negotiation failure; the session stays in the roster
    fn negotiation_failed(&mut self, message: String) {
        if self.health == SessionHealth::Restarting {
            self.degrade(message);
            return;
        }
        warn!("Session {}: {}", self.participant.user_id, message);
        self.report(SessionOutput::Error(message));
    }

    fn degrade(&mut self, message: String) {
        if self.health == SessionHealth::Degraded {
            return;
        }
        self.health = SessionHealth::Degraded;
        warn!("Session {} degraded: {}", self.participant.user_id, message);
        self.report(SessionOutput::Error(format!("Connectivity restart failed: {}", message)));
    }

    fn report(&self, output: SessionOutput) {
        let _ = self.reports.send(SessionReport {
            user_id: self.participant.user_id.clone(),
            generation: self.generation,
            output,
        });
    }

    fn publish_status(&self) {
        let status = SessionStatus {
            negotiation_state: self.negotiation.state(),
            negotiating: self.negotiation.is_negotiating(),
            pending_candidates: self.negotiation.pending_candidates(),
            connectivity: self.connectivity,
            health: self.health,
        };
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    async fn shutdown(&mut self) {
        self.cancel_timeout();
        if let Err(e) = self.transport.close().await {
            warn!("Session {}: close failed: {}", self.participant.user_id, e);
        }
        self.connectivity = ConnectivityState::Closed;
        self.publish_status();
        info!("Session {} closed", self.participant.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::media_track::MediaKind;
    use crate::webrtc::mock::{remote_sdp, MockFactory};

    struct Harness {
        handle: SessionHandle,
        reports: mpsc::UnboundedReceiver<SessionReport>,
        factory: MockFactory,
    }

    impl Harness {
        fn start(local: &str, remote: &str, tracks: Vec<LocalTrack>) -> Self {
            Self::start_with(local, remote, tracks, MockFactory::new())
        }

        fn start_with(local: &str, remote: &str, tracks: Vec<LocalTrack>, factory: MockFactory) -> Self {
            let (reports_tx, reports) = mpsc::unbounded_channel();
            let handle = SessionHandle::spawn(SessionContext {
                local_user_id: local.to_string(),
                participant: Participant::new(remote, remote, &format!("conn-{}", remote)),
                generation: 1,
                tracks,
                factory: Arc::new(factory.clone()),
                negotiation_timeout: Duration::from_secs(12),
                reports: reports_tx,
            });
            Self { handle, reports, factory }
        }

        fn outputs(&mut self) -> Vec<SessionOutput> {
            let mut out = Vec::new();
            while let Ok(report) = self.reports.try_recv() {
                out.push(report.output);
            }
            out
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn count_offers(outputs: &[SessionOutput]) -> usize {
        outputs
            .iter()
            .filter(|o| matches!(o, SessionOutput::Signal(SignalMessage::Offer { .. })))
            .count()
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(&format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n), Some("0"), Some(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_double_offer() {
        let mut h = Harness::start("1", "2", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;

        assert_eq!(count_offers(&h.outputs()), 1);
        let status = h.handle.status();
        assert_eq!(status.negotiation_state, NegotiationState::HaveLocalOffer);
        assert!(status.negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_completes_round() {
        let mut h = Harness::start("1", "2", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;
        h.handle.send(SessionCommand::Answer { sdp: remote_sdp("2", 1) });
        settle().await;

        let status = h.handle.status();
        assert_eq!(status.negotiation_state, NegotiationState::Stable);
        assert!(!status.negotiating);
        assert!(h.outputs().iter().all(|o| !matches!(o, SessionOutput::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_flushed_in_arrival_order() {
        let mut h = Harness::start("2", "1", vec![]);
        for n in 1..=3 {
            h.handle.send(SessionCommand::Candidate(candidate(n)));
        }
        settle().await;
        assert_eq!(h.handle.status().pending_candidates, 3);

        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        settle().await;

        let probe = h.factory.probe("1").unwrap();
        assert_eq!(probe.applied_candidates(), vec![candidate(1), candidate(2), candidate(3)]);
        let status = h.handle.status();
        assert_eq!(status.pending_candidates, 0);
        assert_eq!(status.negotiation_state, NegotiationState::Stable);

        let outputs = h.outputs();
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::Signal(SignalMessage::Answer { .. }))));
        assert_eq!(count_offers(&outputs), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_candidate_is_dropped() {
        let mut h = Harness::start("2", "1", vec![]);
        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        settle().await;

        h.factory.probe("1").unwrap().reject_candidates_containing("bogus");
        h.handle.send(SessionCommand::Candidate(IceCandidate::new("bogus", None, None)));
        h.handle.send(SessionCommand::Candidate(candidate(4)));
        settle().await;

        assert_eq!(h.factory.probe("1").unwrap().applied_candidates(), vec![candidate(4)]);
        assert!(h.outputs().iter().all(|o| !matches!(o, SessionOutput::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_answer_ignored() {
        let mut h = Harness::start("1", "2", vec![]);
        h.handle.send(SessionCommand::Answer { sdp: remote_sdp("2", 1) });
        settle().await;

        assert!(!h.factory.probe("2").unwrap().has_remote());
        assert!(h.outputs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_offer_ignored() {
        let mut h = Harness::start("2", "1", vec![]);
        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        settle().await;

        let answers = h
            .outputs()
            .iter()
            .filter(|o| matches!(o, SessionOutput::Signal(SignalMessage::Answer { .. })))
            .count();
        assert_eq!(answers, 1);

        // A newer version is a renegotiation and gets answered
        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 2) });
        settle().await;
        assert!(h.outputs().iter().any(|o| matches!(o, SessionOutput::Signal(SignalMessage::Answer { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_glare_larger_id_yields() {
        let mut h = Harness::start("2", "1", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Renegotiate));
        settle().await;
        assert_eq!(h.handle.status().negotiation_state, NegotiationState::HaveLocalOffer);

        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        settle().await;

        let probe = h.factory.probe("1").unwrap();
        assert_eq!(probe.rollbacks(), 1);
        let status = h.handle.status();
        assert_eq!(status.negotiation_state, NegotiationState::Stable);
        assert!(!status.negotiating);
        assert!(h.outputs().iter().any(|o| matches!(o, SessionOutput::Signal(SignalMessage::Answer { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_glare_smaller_id_keeps_offer() {
        let mut h = Harness::start("1", "2", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Renegotiate));
        settle().await;
        h.outputs();

        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("2", 1) });
        settle().await;

        assert_eq!(h.factory.probe("2").unwrap().rollbacks(), 0);
        assert_eq!(h.handle.status().negotiation_state, NegotiationState::HaveLocalOffer);
        assert!(h.outputs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_failure_surfaces_error_and_unlocks() {
        let factory = MockFactory::new();
        factory.fail_offers(true);
        let mut h = Harness::start_with("1", "2", vec![], factory.clone());
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;

        let outputs = h.outputs();
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::Error(_))));
        assert!(!h.handle.status().negotiating);

        factory.fail_offers(false);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;
        assert_eq!(count_offers(&h.outputs()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout() {
        let mut h = Harness::start("1", "2", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;
        h.outputs();

        tokio::time::sleep(Duration::from_secs(13)).await;

        let outputs = h.outputs();
        assert!(outputs
            .iter()
            .any(|o| matches!(o, SessionOutput::Error(msg) if msg.contains("no answer"))));
        let status = h.handle.status();
        assert_eq!(status.negotiation_state, NegotiationState::Stable);
        assert!(!status.negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_restart_then_degraded() {
        let mut h = Harness::start("1", "2", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;
        h.handle.send(SessionCommand::Answer { sdp: remote_sdp("2", 1) });
        settle().await;
        h.outputs();

        let probe = h.factory.probe("2").unwrap();
        probe.emit(TransportEvent::Connectivity(ConnectivityState::Failed));
        settle().await;

        assert_eq!(probe.ice_restarts(), 1);
        assert_eq!(count_offers(&h.outputs()), 1);
        assert_eq!(h.handle.status().health, SessionHealth::Restarting);

        h.handle.send(SessionCommand::Answer { sdp: remote_sdp("2", 2) });
        probe.emit(TransportEvent::Connectivity(ConnectivityState::Connecting));
        probe.emit(TransportEvent::Connectivity(ConnectivityState::Failed));
        settle().await;

        let outputs = h.outputs();
        assert_eq!(count_offers(&outputs), 0);
        assert_eq!(
            outputs.iter().filter(|o| matches!(o, SessionOutput::Error(_))).count(),
            1
        );
        assert_eq!(probe.ice_restarts(), 1);
        assert_eq!(h.handle.status().health, SessionHealth::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_track_without_renegotiation() {
        let camera = LocalTrack::new("camera", MediaKind::Video, "local");
        let mut h = Harness::start("1", "2", vec![camera]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;
        h.handle.send(SessionCommand::Answer { sdp: remote_sdp("2", 1) });
        settle().await;
        h.outputs();

        let screen = LocalTrack::new("screen", MediaKind::Video, "local");
        h.handle.send(SessionCommand::SyncTracks(vec![screen]));
        settle().await;

        let probe = h.factory.probe("2").unwrap();
        assert_eq!(probe.sender_track_ids(), vec![Some("screen".to_string())]);
        assert_eq!(count_offers(&h.outputs()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_added_track_renegotiates() {
        let mic = LocalTrack::new("mic", MediaKind::Audio, "local");
        let mut h = Harness::start("1", "2", vec![mic.clone()]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;
        h.handle.send(SessionCommand::Answer { sdp: remote_sdp("2", 1) });
        settle().await;
        h.outputs();

        let camera = LocalTrack::new("camera", MediaKind::Video, "local");
        h.handle.send(SessionCommand::SyncTracks(vec![mic, camera]));
        settle().await;

        assert_eq!(count_offers(&h.outputs()), 1);
        assert_eq!(h.factory.probe("2").unwrap().sender_track_ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_added_before_first_offer_rides_along() {
        let mut h = Harness::start("1", "2", vec![]);
        let mic = LocalTrack::new("mic", MediaKind::Audio, "local");
        h.handle.send(SessionCommand::SyncTracks(vec![mic]));
        settle().await;
        assert_eq!(count_offers(&h.outputs()), 0);

        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;
        assert_eq!(count_offers(&h.outputs()), 1);
        assert_eq!(h.factory.probe("2").unwrap().sender_track_ids(), vec![Some("mic".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_added_while_offer_outstanding_renegotiates_after_answer() {
        let mic = LocalTrack::new("mic", MediaKind::Audio, "local");
        let mut h = Harness::start("1", "2", vec![mic.clone()]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Join));
        settle().await;

        let camera = LocalTrack::new("camera", MediaKind::Video, "local");
        h.handle.send(SessionCommand::SyncTracks(vec![mic, camera]));
        settle().await;
        assert_eq!(count_offers(&h.outputs()), 1);

        h.handle.send(SessionCommand::Answer { sdp: remote_sdp("2", 1) });
        settle().await;

        assert_eq!(count_offers(&h.outputs()), 1);
        assert_eq!(
            h.factory.probe("2").unwrap().sender_track_ids(),
            vec![Some("mic".to_string()), Some("camera".to_string())]
        );
        let status = h.handle.status();
        assert_eq!(status.negotiation_state, NegotiationState::HaveLocalOffer);
        assert!(status.negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_failure_rolls_back_and_recovers() {
        let factory = MockFactory::new();
        factory.fail_next_answers(1);
        let mut h = Harness::start_with("2", "1", vec![], factory);
        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        settle().await;

        let outputs = h.outputs();
        assert_eq!(outputs.iter().filter(|o| matches!(o, SessionOutput::Error(_))).count(), 1);
        assert!(outputs.iter().all(|o| !matches!(o, SessionOutput::Signal(SignalMessage::Answer { .. }))));
        let probe = h.factory.probe("1").unwrap();
        assert_eq!(probe.remote_rollbacks(), 1);
        assert_eq!(probe.signaling(), NegotiationState::Stable);
        assert_eq!(h.handle.status().negotiation_state, NegotiationState::Stable);

        // The remote retries the same offer
        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        settle().await;
        assert!(h.outputs().iter().any(|o| matches!(o, SessionOutput::Signal(SignalMessage::Answer { .. }))));
        assert_eq!(h.handle.status().negotiation_state, NegotiationState::Stable);

        // Restart is still possible
        probe.emit(TransportEvent::Connectivity(ConnectivityState::Failed));
        settle().await;
        assert_eq!(count_offers(&h.outputs()), 1);
        assert_eq!(probe.ice_restarts(), 1);
        assert_eq!(h.handle.status().health, SessionHealth::Restarting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_sync_during_glare_is_offered_after_answer() {
        let mut h = Harness::start("2", "1", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Renegotiate));
        settle().await;
        let camera = LocalTrack::new("camera", MediaKind::Video, "local");
        h.handle.send(SessionCommand::SyncTracks(vec![camera]));
        settle().await;
        h.outputs();

        h.handle.send(SessionCommand::Offer { sdp: remote_sdp("1", 1) });
        settle().await;

        let outputs = h.outputs();
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::Signal(SignalMessage::Answer { .. }))));
        assert_eq!(count_offers(&outputs), 1);
        assert_eq!(h.factory.probe("1").unwrap().rollbacks(), 1);
        assert_eq!(h.handle.status().negotiation_state, NegotiationState::HaveLocalOffer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_offer_after_glare_rollback_unlocks() {
        let mut h = Harness::start("2", "1", vec![]);
        h.handle.send(SessionCommand::InitiateOffer(OfferReason::Renegotiate));
        settle().await;
        let camera = LocalTrack::new("camera", MediaKind::Video, "local");
        h.handle.send(SessionCommand::SyncTracks(vec![camera]));
        settle().await;
        h.outputs();

        h.handle.send(SessionCommand::Offer { sdp: "garbage".to_string() });
        settle().await;

        let outputs = h.outputs();
        assert_eq!(outputs.iter().filter(|o| matches!(o, SessionOutput::Error(_))).count(), 1);
        // The deferred renegotiation goes out once the session is stable again
        assert_eq!(count_offers(&outputs), 1);
        let status = h.handle.status();
        assert_eq!(status.negotiation_state, NegotiationState::HaveLocalOffer);
        assert!(status.negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_transport() {
        let h = Harness::start("1", "2", vec![]);
        settle().await;
        let probe = h.factory.probe("2").unwrap();
        h.handle.close().await.unwrap();
        assert!(probe.is_closed());
    }
}
