//! Local and remote media tracks
//!
//! The engine never captures media itself. It observes a [`LocalMediaSource`]
//! (the current outbound track set, changed by mute, camera toggle or screen
//! share) and hands [`RemoteTrack`]s back to the caller as they arrive.

use super::CallError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Media kind of a track or sender slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound track published by the local participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

impl LocalTrack {
    pub fn new(id: &str, kind: MediaKind, stream_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            stream_id: stream_id.to_string(),
        }
    }

    /// Create a track with a random id
    pub fn generate(kind: MediaKind, stream_id: &str) -> Self {
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            stream_id: stream_id.to_string(),
        }
    }
}

/// Observable set of outbound tracks
///
/// Every mutation is published as a change event to all subscribers.
#[derive(Clone)]
pub struct LocalMediaSource {
    tracks: Arc<watch::Sender<Vec<LocalTrack>>>,
}

impl LocalMediaSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::with_tracks(Vec::new())
    }

    /// Create a source with an initial track set
    pub fn with_tracks(tracks: Vec<LocalTrack>) -> Self {
        let (tx, _rx) = watch::channel(tracks);
        Self { tracks: Arc::new(tx) }
    }

    /// Current outbound tracks
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.borrow().clone()
    }

    /// Subscribe to track set changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<LocalTrack>> {
        self.tracks.subscribe()
    }

    /// Publish a new track
    pub fn add_track(&self, track: LocalTrack) {
        self.tracks.send_modify(|tracks| {
            tracks.retain(|t| t.id != track.id);
            tracks.push(track);
        });
    }

    /// Stop publishing a track. Returns false if it was not published.
    pub fn remove_track(&self, track_id: &str) -> bool {
        self.tracks.send_if_modified(|tracks| {
            let before = tracks.len();
            tracks.retain(|t| t.id != track_id);
            tracks.len() != before
        })
    }

    /// Swap the first track of the same kind for `track` (camera toggle,
    /// screen share). Adds the track if no track of that kind exists.
    pub fn replace_track(&self, track: LocalTrack) {
        self.tracks.send_modify(|tracks| {
            match tracks.iter_mut().find(|t| t.kind == track.kind) {
                Some(slot) => *slot = track,
                None => tracks.push(track),
            }
        });
    }
}

impl Default for LocalMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads media packets from a remote track
#[async_trait]
pub trait RemoteTrackReader: Send + Sync {
    /// Next media payload
    async fn read_packet(&self) -> Result<Bytes, CallError>;
}

/// A track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
    reader: Option<Arc<dyn RemoteTrackReader>>,
}

impl RemoteTrack {
    pub fn new(id: &str, kind: MediaKind, stream_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            stream_id: stream_id.to_string(),
            reader: None,
        }
    }

    /// Attach a media reader
    pub fn with_reader(mut self, reader: Arc<dyn RemoteTrackReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Read the next media payload
    pub async fn read_packet(&self) -> Result<Bytes, CallError> {
        match &self.reader {
            Some(reader) => reader.read_packet().await,
            None => Err(CallError::MediaError(format!("Track {} has no media reader", self.id))),
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("readable", &self.reader.is_some())
            .finish()
    }
}
