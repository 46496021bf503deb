//! PKCE authorization flow against the streaming provider.
//!
//! `initiate` mints a `state`/`code_verifier` pair, stores the request
//! server-side and builds the provider authorization URL. `complete`
//! validates state and verifier, destroys the stored request (single-use)
//! and exchanges the code for tokens.

mod store;

pub use store::{
    AuthRequestStore, AuthorizationRequest, InMemoryAuthRequestStore,
    AUTHORIZATION_REQUEST_TTL_MINUTES,
};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::provider::{ProviderApi, ProviderError, TokenResponse, AUTHORIZATION_SCOPES};

const STATE_LENGTH: usize = 16;
const CODE_VERIFIER_LENGTH: usize = 64;

#[derive(Debug, Error)]
pub enum AuthFlowError {
    /// Unknown, already-consumed or expired `state`.
    #[error("invalid or expired authorization state")]
    InvalidAuthorizationState,

    #[error("code_verifier does not match the stored authorization request")]
    VerifierMismatch,

    /// The provider rejected the code exchange; upstream status passed through.
    #[error("provider authorization failed with status {status}: {message}")]
    ProviderAuth { status: u16, message: String },
}

/// What `initiate` hands back to the client. The client persists
/// `code_verifier` and `state` across the redirect boundary and submits
/// them to `complete`.
#[derive(Debug, Clone)]
pub struct AuthorizationHandoff {
    pub authorization_url: String,
    pub code_verifier: String,
    pub state: String,
}

pub struct AuthorizationFlow {
    store: Arc<dyn AuthRequestStore>,
    provider: Arc<dyn ProviderApi>,
    authorize_url: String,
    client_id: String,
    redirect_uri: String,
}

impl AuthorizationFlow {
    pub fn new(
        store: Arc<dyn AuthRequestStore>,
        provider: Arc<dyn ProviderApi>,
        authorize_url: impl Into<String>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            authorize_url: authorize_url.into(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Issue a new authorization request and build the provider URL.
    pub async fn initiate(&self) -> AuthorizationHandoff {
        let state = random_token(STATE_LENGTH);
        let code_verifier = random_token(CODE_VERIFIER_LENGTH);
        let code_challenge = code_challenge(&code_verifier);

        self.store
            .put(AuthorizationRequest::new(
                state.clone(),
                code_verifier.clone(),
            ))
            .await;

        let authorization_url = format!(
            "{}?response_type=code&client_id={}&scope={}&code_challenge_method=S256&code_challenge={}&redirect_uri={}&state={}",
            self.authorize_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(AUTHORIZATION_SCOPES),
            urlencoding::encode(&code_challenge),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&state),
        );

        debug!("Issued authorization request with state {}", state);

        AuthorizationHandoff {
            authorization_url,
            code_verifier,
            state,
        }
    }

    /// Validate and consume the stored request, then exchange the code.
    ///
    /// The stored request is removed before the verifier check, so a
    /// mismatching or duplicate completion burns the `state` either way.
    pub async fn complete(
        &self,
        code: &str,
        code_verifier: &str,
        state: &str,
    ) -> Result<TokenResponse, AuthFlowError> {
        let request = self
            .store
            .take(state)
            .await
            .ok_or(AuthFlowError::InvalidAuthorizationState)?;

        if request.is_expired() {
            return Err(AuthFlowError::InvalidAuthorizationState);
        }

        if request.code_verifier != code_verifier {
            return Err(AuthFlowError::VerifierMismatch);
        }

        let tokens = self
            .provider
            .exchange_code(code, code_verifier, &self.redirect_uri)
            .await
            .map_err(|err| match err {
                ProviderError::Transport(message) => AuthFlowError::ProviderAuth {
                    status: 502,
                    message,
                },
                err => AuthFlowError::ProviderAuth {
                    status: err.status(),
                    message: err.to_string(),
                },
            })?;

        info!("Authorization code exchanged for state {}", state);
        Ok(tokens)
    }
}

fn random_token(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// `base64url(SHA256(code_verifier))`, no padding.
pub fn code_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
