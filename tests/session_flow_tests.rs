//! End-to-end session flows against a scripted provider: authorization
//! handshake, tier resolution, playback and teardown.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use soundmate_server::auth::{AuthorizationFlow, InMemoryAuthRequestStore};
use soundmate_server::playback::state::PlayerEvent;
use soundmate_server::provider::{
    PlayTarget, PlayerSnapshot, Playlist, Profile, ProviderApi, ProviderError, TokenResponse, Track,
};
use soundmate_server::session::device::{DeviceError, PlayerSdk, TokenSource};
use soundmate_server::session::tier::Tier;
use soundmate_server::session::{SessionController, SessionNotice, SessionPhase};
use soundmate_server::share::{NoopShareSink, NowPlayingShare, ShareError, ShareSink};

fn make_track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        uri: format!("spotify:track:{}", id),
        name: format!("Song {}", id),
        artists: vec!["The Band".to_string()],
        album_name: "The Album".to_string(),
        duration_ms: 200_000,
        preview_url: Some(format!("https://preview.example.com/{}.mp3", id)),
        artwork_url: Some(format!("https://img.example.com/{}.jpg", id)),
    }
}

struct ScriptedProvider {
    product: String,
    play_calls: Mutex<Vec<(String, PlayTarget)>>,
    pause_calls: AtomicUsize,
    next_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(product: &str) -> Self {
        Self {
            product: product.to_string(),
            play_calls: Mutex::new(Vec::new()),
            pause_calls: AtomicUsize::new(0),
            next_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProviderApi for ScriptedProvider {
    async fn exchange_code(
        &self,
        _code: &str,
        _code_verifier: &str,
        _redirect_uri: &str,
    ) -> Result<TokenResponse, ProviderError> {
        Ok(TokenResponse {
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_in: 3600,
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        Ok(TokenResponse {
            access_token: "access-2".to_string(),
            refresh_token: None,
            expires_in: 3600,
        })
    }

    async fn profile(&self, _access_token: &str) -> Result<Profile, ProviderError> {
        Ok(Profile {
            id: "listener-1".to_string(),
            display_name: "Dana".to_string(),
            email: None,
            product: self.product.clone(),
            avatar_url: None,
        })
    }

    async fn playlists(&self, _access_token: &str) -> Result<Vec<Playlist>, ProviderError> {
        Ok(vec![Playlist {
            id: "pl-1".to_string(),
            name: "Road Trip".to_string(),
            total_tracks: 2,
            artwork_url: None,
        }])
    }

    async fn playlist_tracks(
        &self,
        _access_token: &str,
        _playlist_id: &str,
    ) -> Result<Vec<Track>, ProviderError> {
        Ok(vec![make_track("one"), make_track("two")])
    }

    async fn player_state(
        &self,
        _access_token: &str,
    ) -> Result<Option<PlayerSnapshot>, ProviderError> {
        Ok(None)
    }

    async fn play(
        &self,
        _access_token: &str,
        device_id: &str,
        target: &PlayTarget,
        _position_ms: u64,
    ) -> Result<(), ProviderError> {
        self.play_calls
            .lock()
            .unwrap()
            .push((device_id.to_string(), target.clone()));
        Ok(())
    }

    async fn pause(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn seek(
        &self,
        _access_token: &str,
        _device_id: &str,
        _position_ms: u64,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn set_volume(
        &self,
        _access_token: &str,
        _device_id: &str,
        _volume_percent: u8,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn next(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn previous(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Announces one ready device right after connecting.
struct OneDeviceSdk;

#[async_trait]
impl PlayerSdk for OneDeviceSdk {
    async fn connect(
        &self,
        _tokens: TokenSource,
        events: mpsc::Sender<PlayerEvent>,
        _cancel: CancellationToken,
    ) -> Result<(), DeviceError> {
        tokio::spawn(async move {
            let _ = events
                .send(PlayerEvent::Ready {
                    device_id: "living-room".to_string(),
                })
                .await;
        });
        Ok(())
    }
}

#[derive(Default)]
struct CapturingShareSink {
    posts: Mutex<Vec<NowPlayingShare>>,
}

#[async_trait]
impl ShareSink for CapturingShareSink {
    async fn create_post(&self, share: &NowPlayingShare) -> Result<(), ShareError> {
        self.posts.lock().unwrap().push(share.clone());
        Ok(())
    }
}

fn build_session(
    provider: Arc<ScriptedProvider>,
    share: Arc<dyn ShareSink>,
) -> (Arc<SessionController>, mpsc::Receiver<SessionNotice>) {
    let flow = AuthorizationFlow::new(
        Arc::new(InMemoryAuthRequestStore::new()),
        provider.clone(),
        "https://accounts.example.com/authorize",
        "client-123",
        "https://app.example.com/callback",
    );
    SessionController::new(provider, Arc::new(OneDeviceSdk), share, flow)
}

async fn sign_in(session: &Arc<SessionController>) {
    let handoff = session.begin_authorization().await;
    assert_eq!(session.phase(), SessionPhase::Authorizing);
    session
        .complete_authorization("auth-code", &handoff.code_verifier, &handoff.state)
        .await
        .unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn premium_listener_controls_the_remote_device() {
    let provider = Arc::new(ScriptedProvider::new("premium"));
    let share = Arc::new(CapturingShareSink::default());
    let (session, _notices) = build_session(provider.clone(), share.clone());

    sign_in(&session).await;
    assert_eq!(session.tier(), Tier::Premium);
    assert_eq!(
        session.phase(),
        SessionPhase::Premium { device_ready: true }
    );

    let playlists = session.playlists().await.unwrap();
    assert_eq!(playlists[0].name, "Road Trip");

    session.select_playlist("pl-1").await.unwrap();
    session.play_index(0).await.unwrap();

    {
        let calls = provider.play_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "living-room");
        assert_eq!(
            calls[0].1,
            PlayTarget::Context {
                context_uri: "spotify:playlist:pl-1".to_string(),
                offset: 0,
            }
        );
    }

    // Mid-list skip uses the provider queue; from the last track the
    // playlist wraps around with an explicit play.
    session.next().await.unwrap();
    assert_eq!(provider.next_calls.load(Ordering::SeqCst), 1);
    session.next().await.unwrap();
    assert_eq!(provider.play_calls.lock().unwrap().len(), 2);
    assert_eq!(
        session.playback_state().unwrap().current_track_index,
        0
    );

    session.pause().await.unwrap();
    assert_eq!(provider.pause_calls.load(Ordering::SeqCst), 1);
    assert!(!session.playback_state().unwrap().is_playing);

    session.resume().await.unwrap();
    let posted = session.share_now_playing().await.unwrap();
    assert_eq!(posted.content, "Dana is listening to Song one by The Band");
    assert_eq!(share.posts.lock().unwrap().len(), 1);

    session.logout();
    assert_eq!(session.phase(), SessionPhase::Unauthenticated);
    assert!(session.playback_state().is_none());
}

#[tokio::test(start_paused = true)]
async fn free_listener_plays_preview_clips() {
    let provider = Arc::new(ScriptedProvider::new("free"));
    let (session, _notices) = build_session(provider.clone(), Arc::new(NoopShareSink));

    sign_in(&session).await;
    assert_eq!(session.tier(), Tier::Free);
    assert_eq!(session.phase(), SessionPhase::Free);

    session.select_playlist("pl-1").await.unwrap();
    session.play_index(0).await.unwrap();

    let state = session.playback_state().unwrap();
    assert!(state.is_playing);
    assert_eq!(state.current_track_index, 0);
    // Preview playback must not reach the provider's player endpoints.
    assert!(provider.play_calls.lock().unwrap().is_empty());

    // The preview clock reports progress within a couple of ticks.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    let state = session.playback_state().unwrap();
    assert!(state.progress > 0.0);

    session.logout();
    assert_eq!(session.phase(), SessionPhase::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn a_session_can_sign_in_again_after_logout() {
    let provider = Arc::new(ScriptedProvider::new("premium"));
    let (session, _notices) = build_session(provider.clone(), Arc::new(NoopShareSink));

    sign_in(&session).await;
    session.logout();
    assert_eq!(session.tier(), Tier::Unknown);

    sign_in(&session).await;
    assert_eq!(session.tier(), Tier::Premium);
    assert_eq!(
        session.phase(),
        SessionPhase::Premium { device_ready: true }
    );
}
