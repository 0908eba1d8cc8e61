//! Call engine
//!
//! A single task per call owns the [`CallRoster`] and is its only writer.
//! It demultiplexes relay envelopes, creates and tears down peer sessions as
//! participants join and leave, forwards local track changes to every
//! session, and turns session reports into relay envelopes and caller events.

use super::media_track::{LocalMediaSource, LocalTrack, RemoteTrack};
use super::negotiation::OfferReason;
use super::peer_connection::{ConnectivityState, TransportFactory};
use super::roster::{CallRoster, SessionSnapshot};
use super::session::{SessionCommand, SessionContext, SessionHandle, SessionOutput, SessionReport};
use super::signaling::{IceCandidate, InboundEnvelope, OutboundEnvelope, Participant, SignalMessage};
use super::CallError;
use crate::config::Config;
use crate::transport::{RelayFrame, SignalingRelay};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Events surfaced to the call UI
#[derive(Debug, Clone)]
pub enum CallEvent {
    RemoteTrackAdded { user_id: String, track: RemoteTrack },
    ParticipantConnectivityChanged { user_id: String, state: ConnectivityState },
    ConnectivityError { user_id: String, message: String },
}

/// Engine tuning and local identity
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub user_id: String,
    pub display_name: String,
    pub channel: String,
    /// Wait before offering to a new joiner
    pub settle_delay: Duration,
    /// Wait for an answer before abandoning an offer
    pub negotiation_timeout: Duration,
    pub max_participants: usize,
    /// Candidates kept per participant that has no session yet
    pub early_candidate_limit: usize,
}

impl EngineSettings {
    pub fn new(user_id: &str, display_name: &str, channel: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            channel: channel.to_string(),
            settle_delay: Duration::from_millis(250),
            negotiation_timeout: Duration::from_secs(12),
            max_participants: 16,
            early_candidate_limit: 64,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            user_id: config.identity.user_id.clone(),
            display_name: config.identity.display_name.clone(),
            channel: config.relay.channel.clone(),
            settle_delay: Duration::from_millis(config.call.settle_delay_ms),
            negotiation_timeout: Duration::from_secs(config.call.negotiation_timeout_secs),
            max_participants: config.call.max_participants,
            early_candidate_limit: config.call.early_candidate_limit,
        }
    }
}

enum EngineCommand {
    Frame(RelayFrame),
    Settled { user_id: String, generation: u64 },
    Roster(oneshot::Sender<Vec<SessionSnapshot>>),
    Leave(oneshot::Sender<()>),
}

/// Caller handle of a running call
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl CallHandle {
    /// Hand an inbound relay frame to the engine
    pub fn deliver(&self, frame: RelayFrame) -> Result<(), CallError> {
        self.commands
            .send(EngineCommand::Frame(frame))
            .map_err(|_| CallError::EngineStopped)
    }

    /// Snapshot of every peer session
    pub async fn roster(&self) -> Result<Vec<SessionSnapshot>, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Roster(tx))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    /// Snapshot of the session for one participant
    pub async fn session(&self, user_id: &str) -> Result<SessionSnapshot, CallError> {
        self.roster()
            .await?
            .into_iter()
            .find(|snapshot| snapshot.user_id == user_id)
            .ok_or_else(|| CallError::SessionNotFound(user_id.to_string()))
    }

    /// Leave the call: close every session and stop the engine
    pub async fn leave(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Leave(tx))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Multi-party call engine
pub struct CallEngine {
    settings: EngineSettings,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    media: LocalMediaSource,
    roster: CallRoster,
    early_candidates: HashMap<String, Vec<IceCandidate>>,
    events: mpsc::UnboundedSender<CallEvent>,
    self_tx: mpsc::WeakUnboundedSender<EngineCommand>,
    reports_tx: mpsc::UnboundedSender<SessionReport>,
}

impl CallEngine {
    /// Start the engine task for one call
    pub fn spawn(
        settings: EngineSettings,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn TransportFactory>,
        media: LocalMediaSource,
    ) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let media_rx = media.subscribe();

        info!(
            "Starting call engine for {} in channel {}",
            settings.user_id, settings.channel
        );

        let engine = CallEngine {
            settings,
            relay,
            factory,
            media,
            roster: CallRoster::new(),
            early_candidates: HashMap::new(),
            events: events_tx,
            self_tx: commands_tx.downgrade(),
            reports_tx,
        };
        tokio::spawn(engine.run(commands_rx, reports_rx, media_rx));

        (CallHandle { commands: commands_tx }, events_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        mut reports: mpsc::UnboundedReceiver<SessionReport>,
        mut media: watch::Receiver<Vec<LocalTrack>>,
    ) {
        let mut media_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand::Leave(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report),
                changed = media.changed(), if media_open => match changed {
                    Ok(()) => {
                        let tracks = media.borrow_and_update().clone();
                        self.propagate_tracks(tracks);
                    }
                    Err(_) => media_open = false,
                },
            }
        }
        info!("Call engine for {} stopped", self.settings.user_id);
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Frame(frame) => self.dispatch(frame),
            EngineCommand::Settled { user_id, generation } => {
                if let Some(session) = self.roster.get(&user_id) {
                    if session.generation == generation {
                        session.send(SessionCommand::InitiateOffer(OfferReason::Join));
                    }
                }
            }
            EngineCommand::Roster(reply) => {
                let _ = reply.send(self.roster.snapshot());
            }
            EngineCommand::Leave(_) => {}
        }
    }

    /// Route one inbound frame
    fn dispatch(&mut self, frame: RelayFrame) {
        let envelope = match frame {
            RelayFrame::Signal(envelope) => envelope,
            RelayFrame::Unknown { kind } => {
                warn!("Dropping signaling envelope with unknown type '{}'", kind);
                return;
            }
        };

        let InboundEnvelope { channel, from, message } = envelope;
        if let Some(channel) = channel {
            if channel != self.settings.channel {
                debug!("Dropping {} for channel {}", message.kind(), channel);
                return;
            }
        }

        match message {
            SignalMessage::ParticipantJoined(participant) => self.on_participant_joined(participant),
            SignalMessage::ParticipantLeft { user_id } => self.on_participant_left(&user_id),
            SignalMessage::ExistingParticipants(participants) => self.on_existing_participants(participants),
            message => match from {
                Some(from) if from.user_id == self.settings.user_id => {
                    debug!("Dropping own {} echoed by relay", message.kind());
                }
                Some(from) => self.route_peer_message(from, message),
                None => warn!("Dropping {} without sender", message.kind()),
            },
        }
    }

    fn on_participant_joined(&mut self, participant: Participant) {
        if participant.user_id == self.settings.user_id {
            return;
        }
        let user_id = participant.user_id.clone();
        self.roster.record_participant(participant.clone());

        if self.roster.contains(&user_id) {
            debug!("Participant {} already has a session", user_id);
            return;
        }

        info!("Participant {} joined", user_id);
        if let Some(generation) = self.open_session(participant) {
            self.schedule_settle(user_id, generation);
        }
    }

    fn on_participant_left(&mut self, user_id: &str) {
        self.early_candidates.remove(user_id);
        let name = self
            .roster
            .participant(user_id)
            .map(|p| p.display_name.clone())
            .unwrap_or_default();
        match self.roster.remove(user_id) {
            Some(session) => {
                info!("Participant {} ({}) left, closing session", user_id, name);
                drop(session.close());
            }
            None => debug!("Participant {} left without a session", user_id),
        }
        if self.roster.is_empty() {
            info!("No other participants in channel {}", self.settings.channel);
        }
    }

    /// The new joiner only learns addresses; existing participants offer to it
    fn on_existing_participants(&mut self, participants: Vec<Participant>) {
        let mut count = 0;
        for participant in participants {
            if participant.user_id == self.settings.user_id {
                continue;
            }
            self.roster.record_participant(participant);
            count += 1;
        }
        info!("Joined call with {} existing participant(s), awaiting offers", count);
    }

    fn route_peer_message(&mut self, from: Participant, message: SignalMessage) {
        let user_id = from.user_id.clone();
        let command = match message {
            SignalMessage::Offer { sdp } => SessionCommand::Offer { sdp },
            SignalMessage::Answer { sdp } => SessionCommand::Answer { sdp },
            SignalMessage::IceCandidate { candidate } => SessionCommand::Candidate(candidate),
            other => {
                debug!("Unexpected {} in peer route", other.kind());
                return;
            }
        };

        if !self.roster.contains(&user_id) {
            match command {
                SessionCommand::Offer { .. } => {
                    self.roster.record_participant(from.clone());
                    if self.open_session(from).is_none() {
                        return;
                    }
                }
                SessionCommand::Candidate(candidate) => {
                    self.roster.record_participant(from);
                    self.stash_candidate(&user_id, candidate);
                    return;
                }
                _ => {
                    debug!("Dropping answer from {} with no session", user_id);
                    return;
                }
            }
        } else {
            self.roster.record_participant(from);
        }

        if let Some(session) = self.roster.get(&user_id) {
            session.send(command);
        }
    }

    /// Hold candidates that outran the offer that creates their session
    fn stash_candidate(&mut self, user_id: &str, candidate: IceCandidate) {
        let limit = self.settings.early_candidate_limit;
        let stash = self.early_candidates.entry(user_id.to_string()).or_default();
        if stash.len() >= limit {
            debug!("Dropping early candidate from {}: stash full", user_id);
            return;
        }
        stash.push(candidate);
    }

    fn open_session(&mut self, participant: Participant) -> Option<u64> {
        if self.roster.len() >= self.settings.max_participants {
            warn!(
                "Not opening session for {}: {} participants is the maximum",
                participant.user_id, self.settings.max_participants
            );
            return None;
        }

        let user_id = participant.user_id.clone();
        let generation = self.roster.next_generation();
        let session = SessionHandle::spawn(SessionContext {
            local_user_id: self.settings.user_id.clone(),
            participant,
            generation,
            tracks: self.media.tracks(),
            factory: self.factory.clone(),
            negotiation_timeout: self.settings.negotiation_timeout,
            reports: self.reports_tx.clone(),
        });

        if let Some(stashed) = self.early_candidates.remove(&user_id) {
            debug!("Replaying {} early candidate(s) from {}", stashed.len(), user_id);
            for candidate in stashed {
                session.send(SessionCommand::Candidate(candidate));
            }
        }

        self.roster.insert(user_id, session);
        Some(generation)
    }

    fn schedule_settle(&self, user_id: String, generation: u64) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let delay = self.settings.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineCommand::Settled { user_id, generation });
        });
    }

    fn handle_report(&mut self, report: SessionReport) {
        let SessionReport { user_id, generation, output } = report;
        if !self.roster.is_current(&user_id, generation) {
            debug!("Dropping report from closed session {} (generation {})", user_id, generation);
            return;
        }

        match output {
            SessionOutput::Signal(message) => self.send_to(&user_id, message),
            SessionOutput::Connectivity(state) => {
                self.emit(CallEvent::ParticipantConnectivityChanged { user_id, state });
            }
            SessionOutput::RemoteTrack(track) => {
                self.emit(CallEvent::RemoteTrackAdded { user_id, track });
            }
            SessionOutput::Error(message) => {
                self.emit(CallEvent::ConnectivityError { user_id, message });
            }
            SessionOutput::Closed(message) => {
                self.roster.remove_session(&user_id);
                self.emit(CallEvent::ConnectivityError { user_id, message });
            }
        }
    }

    /// Address a message to the participant's current relay address
    fn send_to(&self, user_id: &str, message: SignalMessage) {
        let Some(address) = self.roster.relay_address(user_id) else {
            warn!("No relay address for {}, dropping {}", user_id, message.kind());
            return;
        };
        let kind = message.kind();
        let envelope = OutboundEnvelope {
            channel: self.settings.channel.clone(),
            to: address.to_string(),
            message,
        };
        if let Err(e) = self.relay.send(envelope) {
            warn!("Failed to send {} to {}: {}", kind, user_id, e);
            self.emit(CallEvent::ConnectivityError {
                user_id: user_id.to_string(),
                message: e.to_string(),
            });
        }
    }

    fn propagate_tracks(&self, tracks: Vec<LocalTrack>) {
        let sessions = self.roster.senders();
        debug!("Local tracks changed ({}), updating {} session(s)", tracks.len(), sessions.len());
        for (user_id, sender) in sessions {
            if !sender.send(SessionCommand::SyncTracks(tracks.clone())) {
                debug!("Session {} exited before track update", user_id);
            }
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    async fn shutdown(&mut self) {
        let sessions = self.roster.drain();
        self.early_candidates.clear();
        info!("Leaving call, closing {} session(s)", sessions.len());
        let tasks: Vec<_> = sessions.into_iter().map(|(_, session)| session.close()).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}
