//! Server-side store for in-flight authorization requests.
//!
//! Keyed by the opaque `state` token, single-use, 10-minute TTL. The store
//! is behind a trait so a distributed cache can back it in multi-instance
//! deployments; the in-memory implementation sweeps expired entries
//! explicitly rather than growing without bound.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// How long an issued authorization request stays redeemable.
pub const AUTHORIZATION_REQUEST_TTL_MINUTES: i64 = 10;

/// One in-flight PKCE authorization, issued by `initiate` and destroyed on
/// exchange or expiry.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub state: String,
    pub code_verifier: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    pub fn new(state: String, code_verifier: String) -> Self {
        let issued_at = Utc::now();
        Self {
            state,
            code_verifier,
            issued_at,
            expires_at: issued_at + Duration::minutes(AUTHORIZATION_REQUEST_TTL_MINUTES),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

#[async_trait]
pub trait AuthRequestStore: Send + Sync {
    /// Store a request, keyed by its `state`.
    async fn put(&self, request: AuthorizationRequest);

    /// Retrieve and remove a request. Removal is atomic with the lookup so
    /// a concurrent duplicate completion for the same `state` gets `None`.
    async fn take(&self, state: &str) -> Option<AuthorizationRequest>;

    /// Drop expired requests. Returns how many were removed.
    async fn sweep_expired(&self) -> usize;
}

pub struct InMemoryAuthRequestStore {
    requests: RwLock<HashMap<String, AuthorizationRequest>>,
}

impl InMemoryAuthRequestStore {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAuthRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthRequestStore for InMemoryAuthRequestStore {
    async fn put(&self, request: AuthorizationRequest) {
        let mut requests = self.requests.write().await;
        requests.insert(request.state.clone(), request);
    }

    async fn take(&self, state: &str) -> Option<AuthorizationRequest> {
        let mut requests = self.requests.write().await;
        requests.remove(state)
    }

    async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, request| request.expires_at > now);
        let removed = before - requests.len();
        if removed > 0 {
            debug!("Swept {} expired authorization request(s)", removed);
        }
        removed
    }
}
