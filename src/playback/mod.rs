//! Playback command surface.
//!
//! [`PlaybackController`] is the one entry point for user playback
//! commands. The account tier picks the backend once, at session start;
//! from then on every command goes through [`PlaybackBackend`] dispatch and
//! no caller branches on tier again.

pub mod backend;
pub mod reconciler;
pub mod state;

pub use backend::{LocalBackend, PlaybackBackend, PlaybackError, RemoteBackend, PREVIEW_CLIP_MS};
pub use reconciler::StateReconciler;
pub use state::{PlaybackState, PlayerEvent, PlayerStateChanged, SeqGate};

use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::provider::{playlist_context_uri, PlayTarget, Track};
use state::NO_TRACK;

const DEFAULT_VOLUME: f64 = 0.5;

struct VolumeControl {
    /// Effective volume, `0.0..=1.0`.
    volume: f64,
    muted: bool,
    /// Restored on unmute.
    last_audible: f64,
}

pub struct PlaybackController {
    backend: Arc<dyn PlaybackBackend>,
    state: Arc<RwLock<PlaybackState>>,
    seq: Arc<SeqGate>,
    volume: Mutex<VolumeControl>,
}

impl PlaybackController {
    pub fn new(backend: Arc<dyn PlaybackBackend>) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(PlaybackState::new())),
            seq: Arc::new(SeqGate::new()),
            volume: Mutex::new(VolumeControl {
                volume: DEFAULT_VOLUME,
                muted: false,
                last_audible: DEFAULT_VOLUME,
            }),
        }
    }

    pub fn snapshot(&self) -> PlaybackState {
        self.state.read().unwrap().clone()
    }

    pub fn current_track(&self) -> Option<Track> {
        self.state.read().unwrap().current_track().cloned()
    }

    /// Swap in a playlist. Also advances the sequence gate so commands
    /// still in flight against the previous list cannot commit into the
    /// new one.
    pub fn set_playlist(&self, playlist_id: Option<String>, tracks: Vec<Track>) {
        let seq = self.seq.issue();
        self.seq.try_commit(seq);
        self.state.write().unwrap().set_playlist(playlist_id, tracks);
    }

    pub fn clear(&self) {
        let seq = self.seq.issue();
        self.seq.try_commit(seq);
        self.state.write().unwrap().clear();
    }

    /// Start playback of the track at `index` in the current playlist.
    pub async fn play_index(&self, index: usize) -> Result<(), PlaybackError> {
        let (track, target) = {
            let state = self.state.read().unwrap();
            let track = state.tracks.get(index).cloned().ok_or_else(|| {
                PlaybackError::PlaybackFailed(format!("track index {} out of range", index))
            })?;
            let target = match &state.selected_playlist_id {
                Some(playlist_id) => PlayTarget::Context {
                    context_uri: playlist_context_uri(playlist_id),
                    offset: index,
                },
                None => PlayTarget::Track {
                    uri: track.uri.clone(),
                },
            };
            (track, target)
        };

        let seq = self.seq.issue();
        self.backend.play(&track, &target).await?;
        if self.seq.try_commit(seq) {
            let mut state = self.state.write().unwrap();
            state.set_index(index as isize);
            state.progress = 0.0;
            state.is_playing = true;
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), PlaybackError> {
        let seq = self.seq.issue();
        self.backend.pause().await?;
        if self.seq.try_commit(seq) {
            self.state.write().unwrap().is_playing = false;
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), PlaybackError> {
        if self.state.read().unwrap().current_track().is_none() {
            return Err(PlaybackError::PlaybackFailed(
                "no track selected".to_string(),
            ));
        }
        let seq = self.seq.issue();
        self.backend.resume().await?;
        if self.seq.try_commit(seq) {
            self.state.write().unwrap().is_playing = true;
        }
        Ok(())
    }

    pub async fn seek(&self, position_ms: u64) -> Result<(), PlaybackError> {
        let duration_ms = {
            let state = self.state.read().unwrap();
            let track = state.current_track().ok_or_else(|| {
                PlaybackError::PlaybackFailed("no track selected".to_string())
            })?;
            self.backend.effective_duration_ms(track)
        };
        let seq = self.seq.issue();
        self.backend.seek(position_ms).await?;
        if self.seq.try_commit(seq) {
            let mut state = self.state.write().unwrap();
            state.progress = if duration_ms > 0 {
                (position_ms as f64 / duration_ms as f64).min(1.0)
            } else {
                0.0
            };
        }
        Ok(())
    }

    pub async fn set_volume(&self, volume: f64) -> Result<(), PlaybackError> {
        let volume = volume.clamp(0.0, 1.0);
        self.backend.set_volume(volume).await?;
        let mut control = self.volume.lock().unwrap();
        control.volume = volume;
        control.muted = volume == 0.0;
        if volume > 0.0 {
            control.last_audible = volume;
        }
        Ok(())
    }

    /// Mute drops the effective volume to zero but remembers the audible
    /// level; unmute restores it.
    pub async fn toggle_mute(&self) -> Result<(), PlaybackError> {
        let (target, muted) = {
            let mut control = self.volume.lock().unwrap();
            if control.muted {
                (control.last_audible, false)
            } else {
                if control.volume > 0.0 {
                    control.last_audible = control.volume;
                }
                (0.0, true)
            }
        };
        self.backend.set_volume(target).await?;
        let mut control = self.volume.lock().unwrap();
        control.volume = target;
        control.muted = muted;
        Ok(())
    }

    /// Effective volume and mute flag.
    pub fn volume(&self) -> (f64, bool) {
        let control = self.volume.lock().unwrap();
        (control.volume, control.muted)
    }

    /// Advance to the next track. On the last track the playlist wraps to
    /// the first one.
    pub async fn next(&self) -> Result<(), PlaybackError> {
        let (index, len) = self.selection()?;
        if index + 1 >= len {
            debug!("End of playlist reached, restarting from the first track");
            return self.play_index(0).await;
        }
        if self.backend.skip_next().await? {
            self.commit_skip(index as isize + 1);
            Ok(())
        } else {
            self.play_index(index + 1).await
        }
    }

    /// Go back one track. Going back from the first track is an error the
    /// caller surfaces as a notice, not a session fault.
    pub async fn previous(&self) -> Result<(), PlaybackError> {
        let (index, _len) = self.selection()?;
        if index == 0 {
            return Err(PlaybackError::PlaybackFailed(
                "already at the first track".to_string(),
            ));
        }
        if self.backend.skip_previous().await? {
            self.commit_skip(index as isize - 1);
            Ok(())
        } else {
            self.play_index(index - 1).await
        }
    }

    /// Apply an inbound player event to the shared state. Events always
    /// represent fresher truth than any command still in flight.
    pub fn commit_event(&self, update: &PlayerStateChanged, index: Option<isize>) {
        let seq = self.seq.issue();
        self.seq.try_commit(seq);
        let mut state = self.state.write().unwrap();
        state.progress = if update.duration_ms > 0 {
            (update.position_ms as f64 / update.duration_ms as f64).min(1.0)
        } else {
            0.0
        };
        state.is_playing = !update.paused;
        if let Some(index) = index {
            state.set_index(index);
        }
    }

    fn selection(&self) -> Result<(usize, usize), PlaybackError> {
        let state = self.state.read().unwrap();
        if state.tracks.is_empty() || state.current_track_index == NO_TRACK {
            return Err(PlaybackError::PlaybackFailed(
                "no track selected".to_string(),
            ));
        }
        Ok((state.current_track_index as usize, state.tracks.len()))
    }

    fn commit_skip(&self, index: isize) {
        let seq = self.seq.issue();
        if self.seq.try_commit(seq) {
            let mut state = self.state.write().unwrap();
            state.set_index(index);
            state.progress = 0.0;
            state.is_playing = true;
        }
    }
}
