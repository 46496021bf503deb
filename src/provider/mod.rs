//! Typed surface over the streaming provider's REST API.
//!
//! Two base URLs are involved: the accounts host (token grants) and the
//! API host (profile, playlists, player control). Everything that talks to
//! the provider goes through the [`ProviderApi`] trait so tests can swap in
//! a fake.

mod http;

pub use http::HttpProviderApi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scopes requested during authorization.
pub const AUTHORIZATION_SCOPES: &str = "user-read-private user-read-email streaming \
     user-read-playback-state playlist-read-private playlist-read-collaborative \
     user-modify-playback-state";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected the access token")]
    Unauthorized,

    #[error("provider denied the request")]
    Forbidden,

    #[error("provider resource not found")]
    NotFound,

    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("provider transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Classify a non-success HTTP status from the provider.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 => ProviderError::Unauthorized,
            403 => ProviderError::Forbidden,
            404 => ProviderError::NotFound,
            status => ProviderError::Status {
                status,
                message: message.into(),
            },
        }
    }

    /// The HTTP status this error corresponds to, for passthrough responses.
    pub fn status(&self) -> u16 {
        match self {
            ProviderError::Unauthorized => 401,
            ProviderError::Forbidden => 403,
            ProviderError::NotFound => 404,
            ProviderError::Status { status, .. } => *status,
            ProviderError::Transport(_) => 502,
        }
    }
}

/// Token grant response. `refresh_token` is only present when the provider
/// rotates it.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Provider account profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Account capability level as reported by the provider ("premium", "free", ...).
    pub product: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub total_tracks: u32,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// Immutable track metadata. Identity is `id`/`uri`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub uri: String,
    pub name: String,
    pub artists: Vec<String>,
    pub album_name: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

impl Track {
    pub fn artists_line(&self) -> String {
        self.artists.join(", ")
    }
}

/// Snapshot of the remote player, as returned by the player-state endpoint.
/// `None` from [`ProviderApi::player_state`] means no active playback at all.
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub device_id: String,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub paused: bool,
    pub track_id: Option<String>,
    pub context_uri: Option<String>,
}

/// Context uri for a playlist, in the provider's uri scheme.
pub fn playlist_context_uri(playlist_id: &str) -> String {
    format!("spotify:playlist:{}", playlist_id)
}

/// What to start playing on the remote device.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayTarget {
    /// A single track by uri.
    Track { uri: String },
    /// A playlist context starting at the given track offset.
    Context { context_uri: String, offset: usize },
}

#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, ProviderError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError>;

    async fn profile(&self, access_token: &str) -> Result<Profile, ProviderError>;

    async fn playlists(&self, access_token: &str) -> Result<Vec<Playlist>, ProviderError>;

    async fn playlist_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
    ) -> Result<Vec<Track>, ProviderError>;

    async fn player_state(
        &self,
        access_token: &str,
    ) -> Result<Option<PlayerSnapshot>, ProviderError>;

    async fn play(
        &self,
        access_token: &str,
        device_id: &str,
        target: &PlayTarget,
        position_ms: u64,
    ) -> Result<(), ProviderError>;

    async fn pause(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError>;

    async fn resume(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError>;

    async fn seek(
        &self,
        access_token: &str,
        device_id: &str,
        position_ms: u64,
    ) -> Result<(), ProviderError>;

    async fn set_volume(
        &self,
        access_token: &str,
        device_id: &str,
        volume_percent: u8,
    ) -> Result<(), ProviderError>;

    async fn next(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError>;

    async fn previous(&self, access_token: &str, device_id: &str) -> Result<(), ProviderError>;
}
