//! Reconciles inbound player events with the session's playback state.
//!
//! Progress, play/pause flags and the selected track index always follow
//! the device's reported truth. On top of that, two situations trigger a
//! corrective command sequence:
//!
//! - the last playlist track is about to end (the provider would wander off
//!   into its own recommendations), emulating a playlist loop instead;
//! - a track that is not part of the selected playlist shows up playing.
//!
//! Both corrections run the same way: pause, let the device settle for half
//! a second, re-check that it is still ready, then restart the playlist
//! from the top. At most one correction is in flight at a time, and a
//! pending one is dropped when the device goes away or the session ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::playback::state::{PlayerEvent, PlayerStateChanged};
use crate::playback::{PlaybackController, PlaybackError};
use crate::session::device::DeviceSessionManager;
use crate::session::SessionNotice;

/// A track within this many milliseconds of its end counts as finished.
const TRACK_END_THRESHOLD_MS: u64 = 300;

/// How long the device gets to settle between the corrective pause and the
/// restart.
const CORRECTION_SETTLE: Duration = Duration::from_millis(500);

pub struct StateReconciler {
    controller: Arc<PlaybackController>,
    /// `None` for clip playback, which needs no corrections.
    device: Option<Arc<DeviceSessionManager>>,
    notices: mpsc::Sender<SessionNotice>,
    cancel: CancellationToken,
    correction_in_flight: Arc<AtomicBool>,
}

impl StateReconciler {
    pub fn new(
        controller: Arc<PlaybackController>,
        device: Option<Arc<DeviceSessionManager>>,
        notices: mpsc::Sender<SessionNotice>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            controller,
            device,
            notices,
            cancel,
            correction_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<PlayerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                PlayerEvent::Ready { device_id } => {
                    debug!("Playback device {} reported ready", device_id)
                }
                PlayerEvent::NotReady => debug!("Playback device reported offline"),
                PlayerEvent::StateChanged(update) => self.observe(&update).await,
            }
        }
        debug!("State reconciler stopped");
    }

    async fn observe(&self, update: &PlayerStateChanged) {
        let snapshot = self.controller.snapshot();
        let index = update
            .current_track_id
            .as_deref()
            .and_then(|id| snapshot.index_of(id));
        self.controller
            .commit_event(update, index.map(|i| i as isize));

        // Clip playback cannot wander off; nothing to correct.
        let Some(device) = self.device.clone() else {
            return;
        };

        if snapshot.selected_playlist_id.is_none() || snapshot.tracks.is_empty() {
            return;
        }

        match index {
            Some(_) => {
                let remaining = update.duration_ms.saturating_sub(update.position_ms);
                // The commit above moved the selection to the event's track.
                if self.controller.snapshot().is_last_track()
                    && update.duration_ms > 0
                    && remaining <= TRACK_END_THRESHOLD_MS
                {
                    info!("Last playlist track ending, emulating loop");
                    self.schedule_correction(device).await;
                }
            }
            None => {
                if update.current_track_id.is_some() && !update.paused {
                    info!("Track outside the selected playlist is playing, correcting");
                    self.schedule_correction(device).await;
                }
            }
        }
    }

    /// Pause, wait out the settle delay, then restart the playlist from the
    /// first track. Never more than one of these at a time.
    async fn schedule_correction(&self, device: Arc<DeviceSessionManager>) {
        if self.correction_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.controller.pause().await {
            self.report_failure(err).await;
            self.correction_in_flight.store(false, Ordering::SeqCst);
            return;
        }

        let controller = self.controller.clone();
        let notices = self.notices.clone();
        let cancel = self.cancel.clone();
        let in_flight = self.correction_in_flight.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    in_flight.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(CORRECTION_SETTLE) => {}
            }
            if device.is_ready() {
                if let Err(err) = controller.play_index(0).await {
                    warn!("Failed to loop playlist: {}", err);
                    let _ = notices.send(SessionNotice::LoopFailed).await;
                }
            } else {
                debug!("Device no longer ready, dropping scheduled correction");
            }
            in_flight.store(false, Ordering::SeqCst);
        });
    }

    async fn report_failure(&self, err: PlaybackError) {
        warn!("Failed to loop playlist: {}", err);
        let _ = self.notices.send(SessionNotice::LoopFailed).await;
    }
}
