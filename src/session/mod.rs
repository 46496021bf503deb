//! Per-user playback session orchestration.
//!
//! [`SessionController`] drives the whole lifecycle: authorization,
//! tier resolution, device connection, playback command routing and the
//! unconditional teardown on logout or fatal token failure. Everything a
//! session owns hangs off one cancellation token tree so teardown is a
//! single cut.

pub mod device;
pub mod tier;
pub mod token;

use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthFlowError, AuthorizationFlow, AuthorizationHandoff};
use crate::playback::state::event_channel;
use crate::playback::{
    LocalBackend, PlaybackController, PlaybackError, PlaybackState, RemoteBackend, StateReconciler,
};
use crate::provider::{Playlist, Profile, ProviderApi, ProviderError};
use crate::share::{NowPlayingShare, ShareError, ShareSink};
use device::{DeviceError, DeviceSessionManager, PlayerSdk, TokenSource};
use tier::{PremiumGate, Tier};
use token::{TokenError, TokenRecord, TokenStore};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("session expired, please sign in again")]
    SessionExpired,

    #[error("nothing is playing")]
    NothingPlaying,

    #[error(transparent)]
    Auth(#[from] AuthFlowError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Playback(PlaybackError),

    #[error(transparent)]
    Provider(ProviderError),

    #[error(transparent)]
    Share(#[from] ShareError),
}

/// Out-of-band messages for whoever renders this session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// Playlist loop emulation could not restart playback.
    LoopFailed,
    /// The session was torn down after an unrecoverable token failure.
    SessionExpired,
}

impl std::fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionNotice::LoopFailed => write!(f, "Failed to loop playlist"),
            SessionNotice::SessionExpired => write!(f, "Session expired, please sign in again"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    Unauthenticated,
    Authorizing,
    Authenticated,
    Free,
    Premium { device_ready: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Unauthenticated,
    Authorizing,
    Authenticated,
    Free,
    Premium,
}

struct Inner {
    phase: Phase,
    profile: Option<Profile>,
    device: Option<Arc<DeviceSessionManager>>,
    playback: Option<Arc<PlaybackController>>,
    cancel: CancellationToken,
}

pub struct SessionController {
    provider: Arc<dyn ProviderApi>,
    sdk: Arc<dyn PlayerSdk>,
    share: Arc<dyn ShareSink>,
    flow: AuthorizationFlow,
    tokens: Arc<TokenStore>,
    gate: Arc<PremiumGate>,
    notices: mpsc::Sender<SessionNotice>,
    inner: RwLock<Inner>,
}

impl SessionController {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        sdk: Arc<dyn PlayerSdk>,
        share: Arc<dyn ShareSink>,
        flow: AuthorizationFlow,
    ) -> (Arc<Self>, mpsc::Receiver<SessionNotice>) {
        let (notices, notice_rx) = mpsc::channel(16);
        let controller = Arc::new(Self {
            tokens: Arc::new(TokenStore::new(provider.clone())),
            provider,
            sdk,
            share,
            flow,
            gate: Arc::new(PremiumGate::new()),
            notices,
            inner: RwLock::new(Inner {
                phase: Phase::Unauthenticated,
                profile: None,
                device: None,
                playback: None,
                cancel: CancellationToken::new(),
            }),
        });
        (controller, notice_rx)
    }

    pub fn phase(&self) -> SessionPhase {
        let inner = self.inner.read().unwrap();
        match inner.phase {
            Phase::Unauthenticated => SessionPhase::Unauthenticated,
            Phase::Authorizing => SessionPhase::Authorizing,
            Phase::Authenticated => SessionPhase::Authenticated,
            Phase::Free => SessionPhase::Free,
            Phase::Premium => SessionPhase::Premium {
                device_ready: inner.device.as_ref().is_some_and(|d| d.is_ready()),
            },
        }
    }

    pub fn tier(&self) -> Tier {
        self.gate.tier()
    }

    /// The authenticated profile, once tier resolution has run.
    pub fn profile(&self) -> Option<Profile> {
        self.inner.read().unwrap().profile.clone()
    }

    pub fn playback_state(&self) -> Option<PlaybackState> {
        self.inner
            .read()
            .unwrap()
            .playback
            .as_ref()
            .map(|p| p.snapshot())
    }

    /// Start the authorization handshake.
    pub async fn begin_authorization(&self) -> AuthorizationHandoff {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.phase == Phase::Unauthenticated {
                inner.phase = Phase::Authorizing;
            }
        }
        self.flow.initiate().await
    }

    /// Finish the handshake: exchange the code, resolve the tier and bring
    /// up the matching playback stack. Any failure past the exchange tears
    /// the half-built session down again.
    pub async fn complete_authorization(
        self: &Arc<Self>,
        code: &str,
        code_verifier: &str,
        state: &str,
    ) -> Result<(), SessionError> {
        let response = match self.flow.complete(code, code_verifier, state).await {
            Ok(response) => response,
            Err(err) => {
                self.inner.write().unwrap().phase = Phase::Unauthenticated;
                return Err(err.into());
            }
        };

        let record = TokenRecord::from_grant(&response, None).ok_or_else(|| {
            SessionError::Provider(ProviderError::Transport(
                "token grant carried no refresh token".to_string(),
            ))
        })?;
        self.tokens.install(record);
        self.inner.write().unwrap().phase = Phase::Authenticated;

        if let Err(err) = self.resolve_tier().await {
            self.teardown();
            return Err(err);
        }
        info!("Session established");
        Ok(())
    }

    async fn resolve_tier(self: &Arc<Self>) -> Result<(), SessionError> {
        let provider = self.provider.clone();
        let profile = self
            .gated(move |token| {
                let provider = provider.clone();
                async move { provider.profile(&token).await }
            })
            .await?;
        let tier = self.gate.detect(&profile);
        self.inner.write().unwrap().profile = Some(profile);

        match tier {
            Tier::Premium => self.start_premium_playback().await,
            _ => {
                self.start_local_playback();
                Ok(())
            }
        }
    }

    async fn start_premium_playback(self: &Arc<Self>) -> Result<(), SessionError> {
        let cancel = self.inner.read().unwrap().cancel.clone();
        let (event_tx, event_rx) = event_channel();
        let device = Arc::new(DeviceSessionManager::new(
            self.sdk.clone(),
            event_tx,
            cancel.clone(),
        ));

        let tokens = self.tokens.clone();
        let source: TokenSource = Arc::new(move || tokens.current().map(|r| r.access_token));
        device.connect(source).await?;

        let backend = Arc::new(RemoteBackend::new(
            self.provider.clone(),
            self.tokens.clone(),
            device.clone(),
            self.gate.clone(),
        ));
        let playback = Arc::new(PlaybackController::new(backend));

        let reconciler = StateReconciler::new(
            playback.clone(),
            Some(device.clone()),
            self.notices.clone(),
            cancel.child_token(),
        );
        tokio::spawn(reconciler.run(event_rx));

        let mut inner = self.inner.write().unwrap();
        inner.device = Some(device);
        inner.playback = Some(playback);
        inner.phase = Phase::Premium;
        Ok(())
    }

    fn start_local_playback(self: &Arc<Self>) {
        let cancel = self.inner.read().unwrap().cancel.clone();
        let (event_tx, event_rx) = event_channel();
        let backend = Arc::new(LocalBackend::new(event_tx, cancel.child_token()));
        let playback = Arc::new(PlaybackController::new(backend));

        let reconciler = StateReconciler::new(
            playback.clone(),
            None,
            self.notices.clone(),
            cancel.child_token(),
        );
        tokio::spawn(reconciler.run(event_rx));

        let mut inner = self.inner.write().unwrap();
        inner.device = None;
        inner.playback = Some(playback);
        inner.phase = Phase::Free;
    }

    /// Rebuild the playback stack on preview clips after a mid-session
    /// downgrade, carrying the selected playlist over.
    fn switch_to_local_playback(self: &Arc<Self>) {
        let snapshot = self.playback_state();
        if let Some(device) = self.inner.write().unwrap().device.take() {
            device.disconnect();
        }
        self.start_local_playback();
        if let Some(snapshot) = snapshot {
            if let Ok(playback) = self.playback_handle() {
                playback.set_playlist(snapshot.selected_playlist_id, snapshot.tracks);
            }
        }
        info!("Session switched to preview playback");
    }

    pub async fn playlists(self: &Arc<Self>) -> Result<Vec<Playlist>, SessionError> {
        let provider = self.provider.clone();
        self.gated(move |token| {
            let provider = provider.clone();
            async move { provider.playlists(&token).await }
        })
        .await
    }

    /// Load a playlist's tracks and make it the session's active list.
    pub async fn select_playlist(self: &Arc<Self>, playlist_id: &str) -> Result<(), SessionError> {
        let provider = self.provider.clone();
        let id = playlist_id.to_string();
        let tracks = self
            .gated(move |token| {
                let provider = provider.clone();
                let id = id.clone();
                async move { provider.playlist_tracks(&token, &id).await }
            })
            .await?;
        self.playback_handle()?
            .set_playlist(Some(playlist_id.to_string()), tracks);
        Ok(())
    }

    pub async fn play_index(self: &Arc<Self>, index: usize) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.play_index(index).await)
    }

    pub async fn pause(self: &Arc<Self>) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.pause().await)
    }

    pub async fn resume(self: &Arc<Self>) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.resume().await)
    }

    pub async fn seek(self: &Arc<Self>, position_ms: u64) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.seek(position_ms).await)
    }

    pub async fn set_volume(self: &Arc<Self>, volume: f64) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.set_volume(volume).await)
    }

    pub async fn toggle_mute(self: &Arc<Self>) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.toggle_mute().await)
    }

    pub async fn next(self: &Arc<Self>) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.next().await)
    }

    pub async fn previous(self: &Arc<Self>) -> Result<(), SessionError> {
        let playback = self.playback_handle()?;
        self.map_playback(playback.previous().await)
    }

    /// Compose and post a "now playing" share for the current track.
    pub async fn share_now_playing(&self) -> Result<NowPlayingShare, SessionError> {
        let profile = self.profile().ok_or(SessionError::NotAuthenticated)?;
        let track = self
            .inner
            .read()
            .unwrap()
            .playback
            .as_ref()
            .and_then(|p| p.current_track())
            .ok_or(SessionError::NothingPlaying)?;

        let share = NowPlayingShare::compose(&profile.display_name, &track);
        self.share.create_post(&share).await?;
        info!("Shared now-playing post for {}", track.name);
        Ok(share)
    }

    pub fn logout(&self) {
        info!("Logging out");
        self.teardown();
    }

    /// Tear everything down: cancel the session's task tree, release the
    /// device, drop tokens, tier and playback state. Safe to call in any
    /// phase, any number of times.
    fn teardown(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();
            if let Some(device) = inner.device.take() {
                device.disconnect();
            }
            if let Some(playback) = inner.playback.take() {
                playback.clear();
            }
            inner.profile = None;
            inner.phase = Phase::Unauthenticated;
        }
        self.tokens.clear();
        self.gate.reset();
        info!("Session torn down");
    }

    fn expire(&self) {
        warn!("Session expired, tearing down");
        self.teardown();
        let _ = self.notices.try_send(SessionNotice::SessionExpired);
    }

    fn playback_handle(&self) -> Result<Arc<PlaybackController>, SessionError> {
        self.inner
            .read()
            .unwrap()
            .playback
            .clone()
            .ok_or(SessionError::NotAuthenticated)
    }

    fn map_playback(self: &Arc<Self>, result: Result<(), PlaybackError>) -> Result<(), SessionError> {
        match result {
            Ok(()) => Ok(()),
            Err(PlaybackError::RefreshFailed) => {
                self.expire();
                Err(SessionError::SessionExpired)
            }
            Err(PlaybackError::Forbidden) => {
                // The backend already downgraded the tier; move playback
                // onto preview clips.
                self.switch_to_local_playback();
                Err(SessionError::Playback(PlaybackError::Forbidden))
            }
            Err(err) => Err(SessionError::Playback(err)),
        }
    }

    async fn gated<T, F, Fut>(self: &Arc<Self>, op: F) -> Result<T, SessionError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match self.tokens.gated_read(op).await {
            Ok(value) => Ok(value),
            Err(TokenError::NotAuthenticated) => Err(SessionError::NotAuthenticated),
            Err(TokenError::RefreshFailed) | Err(TokenError::SessionExpired) => {
                self.expire();
                Err(SessionError::SessionExpired)
            }
            Err(TokenError::Provider(err)) => Err(SessionError::Provider(err)),
        }
    }
}
