//! Shared playback view-state and the command/event ordering gate.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::provider::Track;

/// Index value meaning "no track selected".
pub const NO_TRACK: isize = -1;

/// The session's view of playback. Mutated by user commands and by inbound
/// player events; both go through the [`SeqGate`] so a stale command
/// completion cannot overwrite fresher event-driven state.
#[derive(Debug, Clone, Default)]
pub struct PlaybackState {
    pub selected_playlist_id: Option<String>,
    pub tracks: Vec<Track>,
    /// Always within `[-1, tracks.len() - 1]`.
    pub current_track_index: isize,
    /// Fraction of the current track played, `0.0..=1.0`.
    pub progress: f64,
    pub is_playing: bool,
}

impl PlaybackState {
    pub fn new() -> Self {
        Self {
            current_track_index: NO_TRACK,
            ..Default::default()
        }
    }

    /// Swap in a new playlist. Clears selection and progress.
    pub fn set_playlist(&mut self, playlist_id: Option<String>, tracks: Vec<Track>) {
        self.selected_playlist_id = playlist_id;
        self.tracks = tracks;
        self.current_track_index = NO_TRACK;
        self.progress = 0.0;
        self.is_playing = false;
    }

    pub fn set_index(&mut self, index: isize) {
        if index >= NO_TRACK && index < self.tracks.len() as isize {
            self.current_track_index = index;
        }
    }

    pub fn current_track(&self) -> Option<&Track> {
        usize::try_from(self.current_track_index)
            .ok()
            .and_then(|i| self.tracks.get(i))
    }

    pub fn index_of(&self, track_id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == track_id)
    }

    pub fn is_last_track(&self) -> bool {
        !self.tracks.is_empty() && self.current_track_index == self.tracks.len() as isize - 1
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

/// Player state observed from the active device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStateChanged {
    pub position_ms: u64,
    pub duration_ms: u64,
    pub paused: bool,
    pub current_track_id: Option<String>,
    pub context_uri: Option<String>,
}

/// Events flowing from the playback device towards the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready { device_id: String },
    NotReady,
    StateChanged(PlayerStateChanged),
}

pub fn event_channel() -> (mpsc::Sender<PlayerEvent>, mpsc::Receiver<PlayerEvent>) {
    mpsc::channel(64)
}

/// Monotonic sequence numbers ordering state writes.
///
/// Every state-affecting command takes a sequence number before dispatching
/// and commits its write only if nothing newer landed while it was in
/// flight. Inbound events take their number at arrival, so an event that
/// arrives after a command was issued wins over that command's completion.
#[derive(Debug, Default)]
pub struct SeqGate {
    issued: AtomicU64,
    committed: AtomicU64,
}

impl SeqGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns false when a newer write already committed; the caller must
    /// then discard its state update.
    pub fn try_commit(&self, seq: u64) -> bool {
        self.committed.fetch_max(seq, Ordering::SeqCst) < seq
    }
}
