//! Hand-rolled [`ProviderApi`] fake for unit tests.
//!
//! Records every call and lets tests inject failures per endpoint as HTTP
//! status codes. Token grants answer with generated token material:
//! exchange yields `access-1`, the n-th refresh yields `access-r{n}`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::provider::{
    PlayTarget, PlayerSnapshot, Playlist, Profile, ProviderApi, ProviderError, TokenResponse, Track,
};

pub fn track(id: &str, duration_ms: u64, preview: bool) -> Track {
    Track {
        id: id.to_string(),
        uri: format!("provider:track:{}", id),
        name: format!("Track {}", id),
        artists: vec!["Artist".to_string()],
        album_name: "Album".to_string(),
        duration_ms,
        preview_url: preview.then(|| format!("https://preview.example.com/{}", id)),
        artwork_url: Some(format!("https://img.example.com/{}", id)),
    }
}

#[derive(Default)]
struct Inner {
    product: Option<String>,
    rotate_refresh_token: bool,
    refresh_delay: Option<Duration>,
    playlists: Vec<Playlist>,
    tracks: Vec<Track>,
    player_states: VecDeque<Option<PlayerSnapshot>>,
    last_player_state: Option<PlayerSnapshot>,

    fail_exchange: VecDeque<u16>,
    fail_refresh: VecDeque<u16>,
    fail_profile: VecDeque<u16>,
    fail_playlists: VecDeque<u16>,
    fail_playlist_tracks: VecDeque<u16>,
    fail_play: VecDeque<u16>,
    fail_pause: VecDeque<u16>,
    fail_seek: VecDeque<u16>,
    fail_volume: VecDeque<u16>,
    fail_next: VecDeque<u16>,
    fail_previous: VecDeque<u16>,

    exchange_calls: usize,
    refresh_calls: usize,
    profile_calls: usize,
    play_calls: Vec<(String, PlayTarget, u64)>,
    pause_calls: usize,
    resume_calls: usize,
    seek_calls: Vec<(String, u64)>,
    volume_calls: Vec<u8>,
    next_calls: usize,
    previous_calls: usize,
}

#[derive(Default)]
pub struct FakeProvider {
    inner: Mutex<Inner>,
}

fn injected(queue: &mut VecDeque<u16>) -> Result<(), ProviderError> {
    match queue.pop_front() {
        Some(status) => Err(ProviderError::from_status(status, "injected failure")),
        None => Ok(()),
    }
}

impl FakeProvider {
    pub fn with_product(product: &str) -> Self {
        let fake = Self::default();
        fake.inner.lock().unwrap().product = Some(product.to_string());
        fake
    }

    pub fn set_playlists(&self, playlists: Vec<Playlist>) {
        self.inner.lock().unwrap().playlists = playlists;
    }

    pub fn set_tracks(&self, tracks: Vec<Track>) {
        self.inner.lock().unwrap().tracks = tracks;
    }

    pub fn push_player_state(&self, state: Option<PlayerSnapshot>) {
        self.inner.lock().unwrap().player_states.push_back(state);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().refresh_delay = Some(delay);
    }

    pub fn rotate_refresh_tokens(&self) {
        self.inner.lock().unwrap().rotate_refresh_token = true;
    }

    pub fn fail_next_exchange(&self, status: u16) {
        self.inner.lock().unwrap().fail_exchange.push_back(status);
    }

    pub fn fail_next_refresh(&self, status: u16) {
        self.inner.lock().unwrap().fail_refresh.push_back(status);
    }

    pub fn fail_next_profile(&self, status: u16) {
        self.inner.lock().unwrap().fail_profile.push_back(status);
    }

    pub fn fail_next_playlists(&self, status: u16) {
        self.inner.lock().unwrap().fail_playlists.push_back(status);
    }

    pub fn fail_next_play(&self, status: u16) {
        self.inner.lock().unwrap().fail_play.push_back(status);
    }

    pub fn fail_next_pause(&self, status: u16) {
        self.inner.lock().unwrap().fail_pause.push_back(status);
    }

    pub fn exchange_calls(&self) -> usize {
        self.inner.lock().unwrap().exchange_calls
    }

    pub fn refresh_calls(&self) -> usize {
        self.inner.lock().unwrap().refresh_calls
    }

    pub fn profile_calls(&self) -> usize {
        self.inner.lock().unwrap().profile_calls
    }

    pub fn play_calls(&self) -> Vec<(String, PlayTarget, u64)> {
        self.inner.lock().unwrap().play_calls.clone()
    }

    pub fn pause_calls(&self) -> usize {
        self.inner.lock().unwrap().pause_calls
    }

    pub fn resume_calls(&self) -> usize {
        self.inner.lock().unwrap().resume_calls
    }

    pub fn seek_calls(&self) -> Vec<(String, u64)> {
        self.inner.lock().unwrap().seek_calls.clone()
    }

    pub fn volume_calls(&self) -> Vec<u8> {
        self.inner.lock().unwrap().volume_calls.clone()
    }

    pub fn next_calls(&self) -> usize {
        self.inner.lock().unwrap().next_calls
    }

    pub fn previous_calls(&self) -> usize {
        self.inner.lock().unwrap().previous_calls
    }
}

#[async_trait]
impl ProviderApi for FakeProvider {
    async fn exchange_code(
        &self,
        _code: &str,
        _code_verifier: &str,
        _redirect_uri: &str,
    ) -> Result<TokenResponse, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_exchange)?;
        inner.exchange_calls += 1;
        Ok(TokenResponse {
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_in: 3600,
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        let delay = self.inner.lock().unwrap().refresh_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_refresh)?;
        inner.refresh_calls += 1;
        let n = inner.refresh_calls;
        Ok(TokenResponse {
            access_token: format!("access-r{}", n),
            refresh_token: inner
                .rotate_refresh_token
                .then(|| format!("refresh-r{}", n)),
            expires_in: 3600,
        })
    }

    async fn profile(&self, _access_token: &str) -> Result<Profile, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_profile)?;
        inner.profile_calls += 1;
        Ok(Profile {
            id: "user-1".to_string(),
            display_name: "Test Listener".to_string(),
            email: Some("listener@example.com".to_string()),
            product: inner
                .product
                .clone()
                .unwrap_or_else(|| "premium".to_string()),
            avatar_url: None,
        })
    }

    async fn playlists(&self, _access_token: &str) -> Result<Vec<Playlist>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_playlists)?;
        Ok(inner.playlists.clone())
    }

    async fn playlist_tracks(
        &self,
        _access_token: &str,
        _playlist_id: &str,
    ) -> Result<Vec<Track>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_playlist_tracks)?;
        Ok(inner.tracks.clone())
    }

    async fn player_state(
        &self,
        _access_token: &str,
    ) -> Result<Option<PlayerSnapshot>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.player_states.pop_front() {
            Some(state) => {
                inner.last_player_state = state.clone();
                Ok(state)
            }
            None => Ok(inner.last_player_state.clone()),
        }
    }

    async fn play(
        &self,
        _access_token: &str,
        device_id: &str,
        target: &PlayTarget,
        position_ms: u64,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_play)?;
        inner
            .play_calls
            .push((device_id.to_string(), target.clone(), position_ms));
        Ok(())
    }

    async fn pause(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_pause)?;
        inner.pause_calls += 1;
        Ok(())
    }

    async fn resume(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.resume_calls += 1;
        Ok(())
    }

    async fn seek(
        &self,
        _access_token: &str,
        device_id: &str,
        position_ms: u64,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_seek)?;
        inner.seek_calls.push((device_id.to_string(), position_ms));
        Ok(())
    }

    async fn set_volume(
        &self,
        _access_token: &str,
        _device_id: &str,
        volume_percent: u8,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_volume)?;
        inner.volume_calls.push(volume_percent);
        Ok(())
    }

    async fn next(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_next)?;
        inner.next_calls += 1;
        Ok(())
    }

    async fn previous(&self, _access_token: &str, _device_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        injected(&mut inner.fail_previous)?;
        inner.previous_calls += 1;
        Ok(())
    }
}
