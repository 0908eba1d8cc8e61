//! Call roster
//!
//! Owned by the engine task and never shared: it maps each remote user id to
//! its running session and keeps the relay address book. Addresses are kept
//! separately from sessions because a new joiner learns addresses from
//! `existing-participants` before any session exists.

use super::session::{SessionHandle, SessionSender, SessionStatus};
use super::signaling::Participant;
use std::collections::HashMap;

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub display_name: String,
    pub relay_address: Option<String>,
    pub generation: u64,
    pub status: SessionStatus,
}

/// Sessions of the active call, keyed by user id
#[derive(Default)]
pub struct CallRoster {
    sessions: HashMap<String, SessionHandle>,
    participants: HashMap<String, Participant>,
    next_generation: u64,
}

impl CallRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&SessionHandle> {
        self.sessions.get(user_id)
    }

    /// Record or refresh a participant's identity and relay address
    pub fn record_participant(&mut self, participant: Participant) {
        match self.participants.get_mut(&participant.user_id) {
            Some(known) => {
                known.relay_address = participant.relay_address;
                if !participant.display_name.is_empty() {
                    known.display_name = participant.display_name;
                }
            }
            None => {
                self.participants.insert(participant.user_id.clone(), participant);
            }
        }
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    /// Current relay address of a participant
    pub fn relay_address(&self, user_id: &str) -> Option<&str> {
        self.participants.get(user_id).map(|p| p.relay_address.as_str())
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn insert(&mut self, user_id: String, session: SessionHandle) {
        self.sessions.insert(user_id, session);
    }

    /// Remove a participant entirely. The returned session still has to be closed.
    pub fn remove(&mut self, user_id: &str) -> Option<SessionHandle> {
        self.participants.remove(user_id);
        self.sessions.remove(user_id)
    }

    /// Remove only the session, keeping the address
    pub fn remove_session(&mut self, user_id: &str) -> Option<SessionHandle> {
        self.sessions.remove(user_id)
    }

    /// Whether `generation` is the live session for `user_id`
    pub fn is_current(&self, user_id: &str, generation: u64) -> bool {
        self.sessions
            .get(user_id)
            .is_some_and(|session| session.generation == generation)
    }

    /// Snapshot of session senders, safe to iterate while the roster changes
    pub fn senders(&self) -> Vec<(String, SessionSender)> {
        self.sessions
            .iter()
            .map(|(user_id, session)| (user_id.clone(), session.sender()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut entries: Vec<_> = self
            .sessions
            .iter()
            .map(|(user_id, session)| {
                let participant = self.participants.get(user_id);
                SessionSnapshot {
                    user_id: user_id.clone(),
                    display_name: participant.map(|p| p.display_name.clone()).unwrap_or_default(),
                    relay_address: participant.map(|p| p.relay_address.clone()),
                    generation: session.generation,
                    status: session.status(),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    /// Remove every session and forget every address
    pub fn drain(&mut self) -> Vec<(String, SessionHandle)> {
        self.participants.clear();
        self.sessions.drain().collect()
    }
}
