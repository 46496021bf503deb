//! Playback backends.
//!
//! [`RemoteBackend`] drives the provider's player endpoints against the
//! connected device (premium accounts). [`LocalBackend`] plays the short
//! preview clips attached to track metadata (free accounts) and never
//! touches the provider's player surface. The controller picks one per
//! session; callers above it never branch on tier again.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::playback::state::{PlayerEvent, PlayerStateChanged};
use crate::provider::{PlayTarget, ProviderApi, ProviderError, Track};
use crate::session::device::DeviceSessionManager;
use crate::session::tier::PremiumGate;
use crate::session::token::{TokenError, TokenStore};

/// Preview clips are capped at 30 seconds.
pub const PREVIEW_CLIP_MS: u64 = 30_000;

#[derive(Debug, Error, PartialEq)]
pub enum PlaybackError {
    #[error("playback requires authorization")]
    Unauthorized,

    #[error("provider denied playback control")]
    Forbidden,

    #[error("no active playback device")]
    NoActiveDevice,

    #[error("playback device is not ready")]
    DeviceNotReady,

    #[error("no preview clip available for this track")]
    NoPreviewAvailable,

    /// Fatal: the session must be torn down.
    #[error("token refresh failed")]
    RefreshFailed,

    #[error("playback failed: {0}")]
    PlaybackFailed(String),
}

#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    async fn play(&self, track: &Track, target: &PlayTarget) -> Result<(), PlaybackError>;

    async fn pause(&self) -> Result<(), PlaybackError>;

    async fn resume(&self) -> Result<(), PlaybackError>;

    async fn seek(&self, position_ms: u64) -> Result<(), PlaybackError>;

    /// `volume` is `0.0..=1.0`.
    async fn set_volume(&self, volume: f64) -> Result<(), PlaybackError>;

    /// Advance within the device-managed queue. `Ok(false)` means this
    /// backend has no queue and the caller should play the adjacent track
    /// explicitly.
    async fn skip_next(&self) -> Result<bool, PlaybackError>;

    async fn skip_previous(&self) -> Result<bool, PlaybackError>;

    /// How long this backend will actually play the track for.
    fn effective_duration_ms(&self, track: &Track) -> u64;
}

/// Premium playback through the provider's player endpoints.
pub struct RemoteBackend {
    provider: Arc<dyn ProviderApi>,
    tokens: Arc<TokenStore>,
    device: Arc<DeviceSessionManager>,
    gate: Arc<PremiumGate>,
}

impl RemoteBackend {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        tokens: Arc<TokenStore>,
        device: Arc<DeviceSessionManager>,
        gate: Arc<PremiumGate>,
    ) -> Self {
        Self {
            provider,
            tokens,
            device,
            gate,
        }
    }

    /// Current access token, refreshing first when it has already expired.
    async fn access_token(&self) -> Result<String, PlaybackError> {
        let record = self.tokens.current().ok_or(PlaybackError::Unauthorized)?;
        if !record.is_expired() {
            return Ok(record.access_token);
        }
        debug!("Access token expired, refreshing before playback command");
        match self.tokens.refresh().await {
            Ok(fresh) => Ok(fresh.access_token),
            Err(TokenError::RefreshFailed) => Err(PlaybackError::RefreshFailed),
            Err(_) => Err(PlaybackError::Unauthorized),
        }
    }

    /// Refresh after a failed command so a retry can succeed. Only a fatal
    /// refresh failure changes the error we report.
    async fn refresh_after_failure(&self) -> Option<PlaybackError> {
        match self.tokens.refresh().await {
            Err(TokenError::RefreshFailed) => Some(PlaybackError::RefreshFailed),
            _ => None,
        }
    }

    async fn map_remote(&self, err: ProviderError) -> PlaybackError {
        match err {
            ProviderError::Unauthorized => self
                .refresh_after_failure()
                .await
                .unwrap_or(PlaybackError::Unauthorized),
            ProviderError::Forbidden => {
                self.gate.downgrade_to_free();
                PlaybackError::Forbidden
            }
            ProviderError::NotFound => {
                // Usually a stale device binding; refresh so the next
                // attempt binds a fresh one.
                self.refresh_after_failure()
                    .await
                    .unwrap_or(PlaybackError::NoActiveDevice)
            }
            other => PlaybackError::PlaybackFailed(other.to_string()),
        }
    }

    async fn command<F, Fut>(&self, f: F) -> Result<(), PlaybackError>
    where
        F: FnOnce(String, String) -> Fut,
        Fut: Future<Output = Result<(), ProviderError>>,
    {
        let device_id = self
            .device
            .ready_device_id()
            .ok_or(PlaybackError::DeviceNotReady)?;
        let access_token = self.access_token().await?;
        match f(access_token, device_id).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.map_remote(err).await),
        }
    }
}

#[async_trait]
impl PlaybackBackend for RemoteBackend {
    async fn play(&self, _track: &Track, target: &PlayTarget) -> Result<(), PlaybackError> {
        let provider = self.provider.clone();
        let target = target.clone();
        self.command(move |access, device| async move {
            provider.play(&access, &device, &target, 0).await
        })
        .await
    }

    async fn pause(&self) -> Result<(), PlaybackError> {
        let provider = self.provider.clone();
        self.command(move |access, device| async move { provider.pause(&access, &device).await })
            .await
    }

    async fn resume(&self) -> Result<(), PlaybackError> {
        let provider = self.provider.clone();
        self.command(move |access, device| async move { provider.resume(&access, &device).await })
            .await
    }

    async fn seek(&self, position_ms: u64) -> Result<(), PlaybackError> {
        let provider = self.provider.clone();
        self.command(move |access, device| async move {
            provider.seek(&access, &device, position_ms).await
        })
        .await
    }

    async fn set_volume(&self, volume: f64) -> Result<(), PlaybackError> {
        let provider = self.provider.clone();
        let percent = (volume.clamp(0.0, 1.0) * 100.0).round() as u8;
        self.command(move |access, device| async move {
            provider.set_volume(&access, &device, percent).await
        })
        .await
    }

    async fn skip_next(&self) -> Result<bool, PlaybackError> {
        let provider = self.provider.clone();
        self.command(move |access, device| async move { provider.next(&access, &device).await })
            .await?;
        Ok(true)
    }

    async fn skip_previous(&self) -> Result<bool, PlaybackError> {
        let provider = self.provider.clone();
        self.command(move |access, device| async move { provider.previous(&access, &device).await })
            .await?;
        Ok(true)
    }

    fn effective_duration_ms(&self, track: &Track) -> u64 {
        track.duration_ms
    }
}

struct PreviewClock {
    track: Option<Track>,
    clip_ms: u64,
    base_position_ms: u64,
    /// `Some` while playing.
    resumed_at: Option<Instant>,
}

impl PreviewClock {
    fn idle() -> Self {
        Self {
            track: None,
            clip_ms: PREVIEW_CLIP_MS,
            base_position_ms: 0,
            resumed_at: None,
        }
    }

    fn position_ms(&self) -> u64 {
        let elapsed = self
            .resumed_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        (self.base_position_ms + elapsed).min(self.clip_ms)
    }
}

/// Free-tier playback: a clock over the track's preview clip. Emits the
/// same player events the remote monitor does, so the layers above see one
/// shape of state.
pub struct LocalBackend {
    clock: Arc<Mutex<PreviewClock>>,
}

impl LocalBackend {
    pub fn new(events: mpsc::Sender<PlayerEvent>, cancel: CancellationToken) -> Self {
        let clock = Arc::new(Mutex::new(PreviewClock::idle()));

        let tick_clock = clock.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let update = {
                    let mut clock = tick_clock.lock().unwrap();
                    let track_id = clock.track.as_ref().map(|t| t.id.clone());
                    track_id.map(|id| {
                        let position = clock.position_ms();
                        if position >= clock.clip_ms && clock.resumed_at.is_some() {
                            // Clip ran out; stop the clock at the end.
                            clock.base_position_ms = clock.clip_ms;
                            clock.resumed_at = None;
                        }
                        PlayerStateChanged {
                            position_ms: position,
                            duration_ms: clock.clip_ms,
                            paused: clock.resumed_at.is_none(),
                            current_track_id: Some(id),
                            context_uri: None,
                        }
                    })
                };
                if let Some(update) = update {
                    if events.send(PlayerEvent::StateChanged(update)).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self { clock }
    }
}

#[async_trait]
impl PlaybackBackend for LocalBackend {
    async fn play(&self, track: &Track, _target: &PlayTarget) -> Result<(), PlaybackError> {
        let preview_url = track
            .preview_url
            .as_ref()
            .ok_or(PlaybackError::NoPreviewAvailable)?;
        debug!("Playing preview clip {}", preview_url);
        let mut clock = self.clock.lock().unwrap();
        clock.track = Some(track.clone());
        clock.clip_ms = track.duration_ms.min(PREVIEW_CLIP_MS);
        clock.base_position_ms = 0;
        clock.resumed_at = Some(Instant::now());
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlaybackError> {
        let mut clock = self.clock.lock().unwrap();
        clock.base_position_ms = clock.position_ms();
        clock.resumed_at = None;
        Ok(())
    }

    async fn resume(&self) -> Result<(), PlaybackError> {
        let mut clock = self.clock.lock().unwrap();
        if clock.track.is_none() {
            return Err(PlaybackError::PlaybackFailed(
                "no preview clip loaded".to_string(),
            ));
        }
        if clock.resumed_at.is_none() {
            clock.resumed_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), PlaybackError> {
        let mut clock = self.clock.lock().unwrap();
        clock.base_position_ms = position_ms.min(clock.clip_ms);
        if clock.resumed_at.is_some() {
            clock.resumed_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn set_volume(&self, _volume: f64) -> Result<(), PlaybackError> {
        // The clip player has no server-side volume; bookkeeping lives in
        // the controller.
        Ok(())
    }

    async fn skip_next(&self) -> Result<bool, PlaybackError> {
        Ok(false)
    }

    async fn skip_previous(&self) -> Result<bool, PlaybackError> {
        Ok(false)
    }

    fn effective_duration_ms(&self, track: &Track) -> u64 {
        track.duration_ms.min(PREVIEW_CLIP_MS)
    }
}
