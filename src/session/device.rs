//! Playback device session lifecycle.
//!
//! [`DeviceSessionManager`] owns the connection to the playback device and
//! tracks its readiness. The device itself is reached through the
//! [`PlayerSdk`] seam; the production implementation polls the provider's
//! player-state endpoint once per second and synthesizes ready / not-ready /
//! state-changed events from the responses.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::playback::state::{PlayerEvent, PlayerStateChanged};
use crate::provider::ProviderApi;

pub const PLAYER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Yields the current access token for the session, or `None` when the
/// session holds no token. Read on every use so a refresh mid-connection
/// is picked up without reconnecting.
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to connect playback device: {0}")]
    ConnectFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSessionState {
    Uninitialized,
    Loading,
    Connecting,
    Ready { device_id: String },
    NotReady,
}

#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait PlayerSdk: Send + Sync {
    /// Establish the device monitor. Implementations emit [`PlayerEvent`]s
    /// into `events` until `cancel` fires.
    async fn connect(
        &self,
        tokens: TokenSource,
        events: mpsc::Sender<PlayerEvent>,
        cancel: CancellationToken,
    ) -> Result<(), DeviceError>;
}

pub struct DeviceSessionManager {
    sdk: Arc<dyn PlayerSdk>,
    state: RwLock<DeviceSessionState>,
    downstream: mpsc::Sender<PlayerEvent>,
    monitor_cancel: Mutex<Option<CancellationToken>>,
    session_cancel: CancellationToken,
}

impl DeviceSessionManager {
    pub fn new(
        sdk: Arc<dyn PlayerSdk>,
        downstream: mpsc::Sender<PlayerEvent>,
        session_cancel: CancellationToken,
    ) -> Self {
        Self {
            sdk,
            state: RwLock::new(DeviceSessionState::Uninitialized),
            downstream,
            monitor_cancel: Mutex::new(None),
            session_cancel,
        }
    }

    pub fn state(&self) -> DeviceSessionState {
        self.state.read().unwrap().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read().unwrap(), DeviceSessionState::Ready { .. })
    }

    pub fn ready_device_id(&self) -> Option<String> {
        match &*self.state.read().unwrap() {
            DeviceSessionState::Ready { device_id } => Some(device_id.clone()),
            _ => None,
        }
    }

    /// Connect the playback device. Safe to call repeatedly: once a
    /// connection attempt is underway or established, further calls are
    /// no-ops.
    pub async fn connect(self: &Arc<Self>, tokens: TokenSource) -> Result<(), DeviceError> {
        {
            let mut state = self.state.write().unwrap();
            if *state != DeviceSessionState::Uninitialized {
                debug!("Device session already initialized, ignoring connect");
                return Ok(());
            }
            *state = DeviceSessionState::Loading;
        }

        let cancel = self.session_cancel.child_token();
        let (monitor_tx, mut monitor_rx) = mpsc::channel(64);

        *self.state.write().unwrap() = DeviceSessionState::Connecting;

        if let Err(err) = self.sdk.connect(tokens, monitor_tx, cancel.clone()).await {
            cancel.cancel();
            *self.state.write().unwrap() = DeviceSessionState::Uninitialized;
            return Err(err);
        }

        *self.monitor_cancel.lock().unwrap() = Some(cancel);

        // Track readiness off the monitor's events, then pass them on.
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = monitor_rx.recv().await {
                manager.observe(&event);
                if manager.downstream.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    /// Tear the device session down. Reentrant: releasing an already
    /// released session is a no-op.
    pub fn disconnect(&self) {
        if let Some(cancel) = self.monitor_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let mut state = self.state.write().unwrap();
        if *state != DeviceSessionState::Uninitialized {
            info!("Playback device session released");
            *state = DeviceSessionState::Uninitialized;
        }
    }

    fn observe(&self, event: &PlayerEvent) {
        let mut state = self.state.write().unwrap();
        match event {
            PlayerEvent::Ready { device_id } => {
                info!("Playback device {} ready", device_id);
                *state = DeviceSessionState::Ready {
                    device_id: device_id.clone(),
                };
            }
            PlayerEvent::NotReady => {
                if *state != DeviceSessionState::Uninitialized {
                    info!("Playback device went offline");
                    *state = DeviceSessionState::NotReady;
                }
            }
            PlayerEvent::StateChanged(_) => {}
        }
    }
}

#[cfg(test)]
impl DeviceSessionManager {
    pub(crate) fn force_state(&self, state: DeviceSessionState) {
        *self.state.write().unwrap() = state;
    }
}

/// Production [`PlayerSdk`]: polls the provider's player-state endpoint and
/// derives device events from the answers. A newly observed device id emits
/// `Ready`, an empty player state emits `NotReady`, every snapshot emits
/// `StateChanged`.
pub struct PollingPlayerSdk {
    provider: Arc<dyn ProviderApi>,
    interval: Duration,
}

impl PollingPlayerSdk {
    pub fn new(provider: Arc<dyn ProviderApi>) -> Self {
        Self::with_interval(provider, PLAYER_POLL_INTERVAL)
    }

    pub fn with_interval(provider: Arc<dyn ProviderApi>, interval: Duration) -> Self {
        Self { provider, interval }
    }
}

#[async_trait]
impl PlayerSdk for PollingPlayerSdk {
    async fn connect(
        &self,
        tokens: TokenSource,
        events: mpsc::Sender<PlayerEvent>,
        cancel: CancellationToken,
    ) -> Result<(), DeviceError> {
        if tokens().is_none() {
            return Err(DeviceError::ConnectFailed(
                "no access token available".to_string(),
            ));
        }

        let provider = self.provider.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut known_device: Option<String> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(token) = tokens() else {
                    continue;
                };
                match provider.player_state(&token).await {
                    Ok(Some(snapshot)) => {
                        if known_device.as_deref() != Some(snapshot.device_id.as_str()) {
                            known_device = Some(snapshot.device_id.clone());
                            let ready = PlayerEvent::Ready {
                                device_id: snapshot.device_id.clone(),
                            };
                            if events.send(ready).await.is_err() {
                                break;
                            }
                        }
                        let changed = PlayerEvent::StateChanged(PlayerStateChanged {
                            position_ms: snapshot.position_ms,
                            duration_ms: snapshot.duration_ms,
                            paused: snapshot.paused,
                            current_track_id: snapshot.track_id.clone(),
                            context_uri: snapshot.context_uri.clone(),
                        });
                        if events.send(changed).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        if known_device.take().is_some()
                            && events.send(PlayerEvent::NotReady).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        // Transient; a 401 heals once the session refreshes.
                        debug!("Player state poll failed: {}", err);
                    }
                }
            }
            debug!("Player monitor stopped");
        });

        Ok(())
    }
}
