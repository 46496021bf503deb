//! reqwest-backed [`ProviderApi`] implementation.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{
    PlayTarget, PlayerSnapshot, Playlist, Profile, ProviderApi, ProviderError, TokenResponse, Track,
};

const PLAYLISTS_PAGE_LIMIT: u32 = 20;
const PLAYLIST_TRACKS_PAGE_LIMIT: u32 = 50;

pub struct HttpProviderApi {
    http: reqwest::Client,
    client_id: String,
    accounts_base_url: String,
    api_base_url: String,
}

impl HttpProviderApi {
    pub fn new(
        client_id: impl Into<String>,
        accounts_base_url: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            client_id: client_id.into(),
            accounts_base_url: trim_trailing_slash(accounts_base_url.into()),
            api_base_url: trim_trailing_slash(api_base_url.into()),
        })
    }

    fn token_url(&self) -> String {
        format!("{}/api/token", self.accounts_base_url)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    async fn token_grant(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ProviderError> {
        let response = self
            .http
            .post(self.token_url())
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        access_token: &str,
        url: String,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }

    /// PUT/POST player command with no meaningful response body.
    async fn player_command(
        &self,
        access_token: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<(), ProviderError> {
        let response = request
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        Ok(())
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

// Wire shapes, mapped into the crate models below.

#[derive(Deserialize)]
struct WireImage {
    url: String,
}

#[derive(Deserialize)]
struct WireProfile {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    images: Vec<WireImage>,
}

#[derive(Deserialize)]
struct WirePlaylistTracksField {
    total: u32,
}

#[derive(Deserialize)]
struct WirePlaylist {
    id: String,
    name: String,
    tracks: WirePlaylistTracksField,
    #[serde(default)]
    images: Vec<WireImage>,
}

#[derive(Deserialize)]
struct WirePage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct WireArtist {
    name: String,
}

#[derive(Deserialize)]
struct WireAlbum {
    name: String,
    #[serde(default)]
    images: Vec<WireImage>,
}

#[derive(Deserialize)]
struct WireTrack {
    id: String,
    uri: String,
    name: String,
    #[serde(default)]
    artists: Vec<WireArtist>,
    album: WireAlbum,
    duration_ms: u64,
    #[serde(default)]
    preview_url: Option<String>,
}

#[derive(Deserialize)]
struct WirePlaylistItem {
    track: Option<WireTrack>,
}

#[derive(Deserialize)]
struct WireDevice {
    id: String,
}

#[derive(Deserialize)]
struct WirePlayingItem {
    id: Option<String>,
    duration_ms: u64,
}

#[derive(Deserialize)]
struct WireContext {
    uri: String,
}

#[derive(Deserialize)]
struct WirePlayerState {
    device: WireDevice,
    #[serde(default)]
    progress_ms: Option<u64>,
    is_playing: bool,
    item: Option<WirePlayingItem>,
    context: Option<WireContext>,
}

impl From<WireTrack> for Track {
    fn from(wire: WireTrack) -> Self {
        Track {
            id: wire.id,
            uri: wire.uri,
            name: wire.name,
            artists: wire.artists.into_iter().map(|a| a.name).collect(),
            album_name: wire.album.name,
            duration_ms: wire.duration_ms,
            preview_url: wire.preview_url,
            artwork_url: wire.album.images.into_iter().next().map(|i| i.url),
        }
    }
}

#[async_trait]
impl ProviderApi for HttpProviderApi {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, ProviderError> {
        debug!("Exchanging authorization code with provider");
        self.token_grant(&[
            ("client_id", self.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        debug!("Refreshing access token with provider");
        self.token_grant(&[
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn profile(&self, access_token: &str) -> Result<Profile, ProviderError> {
        let wire: WireProfile = self.get_json(access_token, self.api_url("/v1/me")).await?;
        Ok(Profile {
            display_name: wire.display_name.unwrap_or_else(|| wire.id.clone()),
            id: wire.id,
            email: wire.email,
            product: wire.product.unwrap_or_else(|| "free".to_string()),
            avatar_url: wire.images.into_iter().next().map(|i| i.url),
        })
    }

    async fn playlists(&self, access_token: &str) -> Result<Vec<Playlist>, ProviderError> {
        let url = self.api_url(&format!("/v1/me/playlists?limit={}", PLAYLISTS_PAGE_LIMIT));
        let page: WirePage<WirePlaylist> = self.get_json(access_token, url).await?;
        Ok(page
            .items
            .into_iter()
            .map(|p| Playlist {
                id: p.id,
                name: p.name,
                total_tracks: p.tracks.total,
                artwork_url: p.images.into_iter().next().map(|i| i.url),
            })
            .collect())
    }

    async fn playlist_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
    ) -> Result<Vec<Track>, ProviderError> {
        let url = self.api_url(&format!(
            "/v1/playlists/{}/tracks?limit={}",
            urlencoding::encode(playlist_id),
            PLAYLIST_TRACKS_PAGE_LIMIT
        ));
        let page: WirePage<WirePlaylistItem> = self.get_json(access_token, url).await?;
        Ok(page
            .items
            .into_iter()
            .filter_map(|item| item.track)
            .map(Track::from)
            .collect())
    }

    async fn player_state(
        &self,
        access_token: &str,
    ) -> Result<Option<PlayerSnapshot>, ProviderError> {
        let response = self
            .http
            .get(self.api_url("/v1/me/player"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status();
        // The provider answers 204 when nothing is playing anywhere.
        if status.as_u16() == 204 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        let wire: WirePlayerState = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Some(PlayerSnapshot {
            device_id: wire.device.id,
            position_ms: wire.progress_ms.unwrap_or(0),
            duration_ms: wire.item.as_ref().map(|i| i.duration_ms).unwrap_or(0),
            paused: !wire.is_playing,
            track_id: wire.item.and_then(|i| i.id),
            context_uri: wire.context.map(|c| c.uri),
        }))
    }

    async fn play(
        &self,
        access_token: &str,
        device_id: &str,
        target: &PlayTarget,
        position_ms: u64,
    ) -> Result<(), ProviderError> {
        let url = self.api_url(&format!(
            "/v1/me/player/play?device_id={}",
            urlencoding::encode(device_id)
        ));
        let body = match target {
            PlayTarget::Track { uri } => serde_json::json!({
                "uris": [uri],
                "position_ms": position_ms,
            }),
            PlayTarget::Context {
                context_uri,
                offset,
            } => serde_json::json!({
                "context_uri": context_uri,
                "offset": { "position": offset },
                "position_ms": position_ms,
            }),
        };
        self.player_command(access_token, self.http.put(url).json(&body))
            .await
    }

    async fn pause(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError> {
        let url = self.api_url(&format!(
            "/v1/me/player/pause?device_id={}",
            urlencoding::encode(device_id)
        ));
        self.player_command(access_token, self.http.put(url)).await
    }

    async fn resume(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError> {
        let url = self.api_url(&format!(
            "/v1/me/player/play?device_id={}",
            urlencoding::encode(device_id)
        ));
        self.player_command(access_token, self.http.put(url)).await
    }

    async fn seek(
        &self,
        access_token: &str,
        device_id: &str,
        position_ms: u64,
    ) -> Result<(), ProviderError> {
        let url = self.api_url(&format!(
            "/v1/me/player/seek?position_ms={}&device_id={}",
            position_ms,
            urlencoding::encode(device_id)
        ));
        self.player_command(access_token, self.http.put(url)).await
    }

    async fn set_volume(
        &self,
        access_token: &str,
        device_id: &str,
        volume_percent: u8,
    ) -> Result<(), ProviderError> {
        let url = self.api_url(&format!(
            "/v1/me/player/volume?volume_percent={}&device_id={}",
            volume_percent,
            urlencoding::encode(device_id)
        ));
        self.player_command(access_token, self.http.put(url)).await
    }

    async fn next(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError> {
        let url = self.api_url(&format!(
            "/v1/me/player/next?device_id={}",
            urlencoding::encode(device_id)
        ));
        self.player_command(access_token, self.http.post(url)).await
    }

    async fn previous(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError> {
        let url = self.api_url(&format!(
            "/v1/me/player/previous?device_id={}",
            urlencoding::encode(device_id)
        ));
        self.player_command(access_token, self.http.post(url)).await
    }
}
