//! HTTP surface for the provider handoff.
//!
//! The browser client never talks to the provider's accounts host
//! directly: authorization, code exchange and token refresh are brokered
//! here so the PKCE request state stays server-side. The read endpoints are
//! thin proxies that forward the client's bearer token and pass provider
//! statuses through unchanged.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{AuthFlowError, AuthorizationFlow};
use crate::provider::{Playlist, Profile, ProviderApi, ProviderError, TokenResponse, Track};

#[derive(Clone)]
pub struct ServerState {
    pub flow: Arc<AuthorizationFlow>,
    pub provider: Arc<dyn ProviderApi>,
    pub redirect_uri: String,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/provider/authorize", get(authorize))
        .route("/provider/exchange", post(exchange))
        .route("/provider/refresh", post(refresh))
        .route("/provider/logout", post(logout))
        .route("/provider/me", get(me))
        .route("/provider/playlists", get(playlists))
        .route("/provider/playlists/{id}/tracks", get(playlist_tracks))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    state: ServerState,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_GATEWAY),
            message: err.to_string(),
        }
    }
}

impl From<AuthFlowError> for ApiError {
    fn from(err: AuthFlowError) -> Self {
        let status = match &err {
            AuthFlowError::InvalidAuthorizationState | AuthFlowError::VerifierMismatch => {
                StatusCode::BAD_REQUEST
            }
            AuthFlowError::ProviderAuth { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or(ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: "No access token provided".to_string(),
        })
}

#[derive(Serialize)]
struct AuthorizeResponse {
    authorization_url: String,
    code_verifier: String,
    state: String,
}

#[derive(Deserialize)]
struct ExchangeRequest {
    code: String,
    code_verifier: String,
    redirect_uri: String,
    state: String,
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct TokenGrantResponse {
    access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl From<TokenResponse> for TokenGrantResponse {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_in: response.expires_in,
        }
    }
}

async fn authorize(State(state): State<ServerState>) -> Json<AuthorizeResponse> {
    let handoff = state.flow.initiate().await;
    Json(AuthorizeResponse {
        authorization_url: handoff.authorization_url,
        code_verifier: handoff.code_verifier,
        state: handoff.state,
    })
}

async fn exchange(
    State(state): State<ServerState>,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<TokenGrantResponse>, ApiError> {
    if body.code.is_empty() || body.code_verifier.is_empty() || body.state.is_empty() {
        return Err(ApiError::bad_request("Missing required parameters"));
    }
    if body.redirect_uri != state.redirect_uri {
        return Err(ApiError::bad_request("redirect_uri mismatch"));
    }
    let grant = state
        .flow
        .complete(&body.code, &body.code_verifier, &body.state)
        .await?;
    Ok(Json(grant.into()))
}

async fn refresh(
    State(state): State<ServerState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenGrantResponse>, ApiError> {
    if body.refresh_token.is_empty() {
        return Err(ApiError::bad_request("Missing refresh token"));
    }
    let grant = state.provider.refresh_token(&body.refresh_token).await?;
    Ok(Json(grant.into()))
}

async fn logout() -> Json<serde_json::Value> {
    // Token material lives client-side; the ack lets the client clear its
    // persisted session keys in one place.
    Json(json!({ "message": "Logged out successfully" }))
}

async fn me(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<Profile>, ApiError> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.provider.profile(&token).await?))
}

async fn playlists(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Playlist>>, ApiError> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.provider.playlists(&token).await?))
}

async fn playlist_tracks(
    State(state): State<ServerState>,
    Path(playlist_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Track>>, ApiError> {
    let token = bearer_token(&headers)?;
    Ok(Json(
        state.provider.playlist_tracks(&token, &playlist_id).await?,
    ))
}
