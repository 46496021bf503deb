//! Access/refresh token lifecycle for one session.
//!
//! Exactly one live [`TokenRecord`] per session. Refresh is a critical
//! section: the provider may rotate refresh tokens, so two concurrent
//! refresh grants are a correctness hazard, not just wasted traffic. The
//! store coalesces them behind a gate — whoever wins performs the upstream
//! call, everyone queued behind it observes the bumped generation and
//! returns the fresh record.

use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::provider::{ProviderApi, ProviderError, TokenResponse};

/// How many consecutive gated reads may exhaust their retry budget before
/// the store reports the session as expired.
const MAX_CONSECUTIVE_EXHAUSTIONS: u32 = 2;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no authenticated session")]
    NotAuthenticated,

    /// Fatal: the caller must tear the session down completely.
    #[error("token refresh failed")]
    RefreshFailed,

    #[error("session expired, please re-authenticate")]
    SessionExpired,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// The live token material for a session.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Build a record from a grant response. The provider only includes a
    /// refresh token when it rotates one; otherwise the previous token is
    /// retained. Returns `None` when neither is available.
    pub fn from_grant(response: &TokenResponse, previous_refresh: Option<&str>) -> Option<Self> {
        let refresh_token = response
            .refresh_token
            .clone()
            .or_else(|| previous_refresh.map(String::from))?;
        Some(Self {
            access_token: response.access_token.clone(),
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

struct State {
    record: Option<TokenRecord>,
    generation: u64,
    /// Whether the generation was last bumped by a failed refresh, so
    /// waiters queued behind that refresh share its outcome.
    refresh_failed: bool,
}

pub struct TokenStore {
    provider: Arc<dyn ProviderApi>,
    state: std::sync::RwLock<State>,
    refresh_gate: tokio::sync::Mutex<()>,
    consecutive_exhaustions: AtomicU32,
}

impl TokenStore {
    pub fn new(provider: Arc<dyn ProviderApi>) -> Self {
        Self {
            provider,
            state: std::sync::RwLock::new(State {
                record: None,
                generation: 0,
                refresh_failed: false,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
            consecutive_exhaustions: AtomicU32::new(0),
        }
    }

    /// Install the record produced by a completed authorization.
    pub fn install(&self, record: TokenRecord) {
        let mut state = self.state.write().unwrap();
        state.record = Some(record);
        state.generation += 1;
        state.refresh_failed = false;
        self.consecutive_exhaustions.store(0, Ordering::Relaxed);
    }

    /// The live record, without any network access.
    pub fn current(&self) -> Option<TokenRecord> {
        self.state.read().unwrap().record.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.write().unwrap();
        state.record = None;
        state.generation += 1;
        state.refresh_failed = false;
        self.consecutive_exhaustions.store(0, Ordering::Relaxed);
    }

    fn generation(&self) -> u64 {
        self.state.read().unwrap().generation
    }

    /// Perform (or join) a refresh grant.
    ///
    /// Callers that queued behind an in-flight refresh see the generation
    /// bump and share its outcome — success or failure — instead of issuing
    /// a second grant. A provider failure here is fatal for the session.
    pub async fn refresh(&self) -> Result<TokenRecord, TokenError> {
        let observed = self.generation();
        let _gate = self.refresh_gate.lock().await;

        {
            let state = self.state.read().unwrap();
            if state.generation != observed {
                // Someone else refreshed (or tore down) while we waited.
                if state.refresh_failed {
                    return Err(TokenError::RefreshFailed);
                }
                debug!("Joining already-completed token refresh");
                return state.record.clone().ok_or(TokenError::NotAuthenticated);
            }
        }

        let record = self.current().ok_or(TokenError::NotAuthenticated)?;

        match self.provider.refresh_token(&record.refresh_token).await {
            Ok(response) => {
                let fresh = TokenRecord::from_grant(&response, Some(&record.refresh_token))
                    .ok_or(TokenError::RefreshFailed)?;
                let mut state = self.state.write().unwrap();
                state.record = Some(fresh.clone());
                state.generation += 1;
                state.refresh_failed = false;
                info!("Access token refreshed");
                Ok(fresh)
            }
            Err(err) => {
                warn!("Token refresh rejected by provider: {}", err);
                let mut state = self.state.write().unwrap();
                state.generation += 1;
                state.refresh_failed = true;
                Err(TokenError::RefreshFailed)
            }
        }
    }

    /// Run a token-gated read with the bounded retry budget: two attempts
    /// total, exactly one refresh interposed on a 401. Exhausting the
    /// budget is non-fatal for the read itself, but a second consecutive
    /// exhaustion surfaces [`TokenError::SessionExpired`].
    pub async fn gated_read<T, F, Fut>(&self, op: F) -> Result<T, TokenError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let record = self.current().ok_or(TokenError::NotAuthenticated)?;

        match op(record.access_token).await {
            Ok(value) => {
                self.consecutive_exhaustions.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Err(ProviderError::Unauthorized) => {
                let fresh = self.refresh().await?;
                match op(fresh.access_token).await {
                    Ok(value) => {
                        self.consecutive_exhaustions.store(0, Ordering::Relaxed);
                        Ok(value)
                    }
                    Err(ProviderError::Unauthorized) => {
                        let exhausted =
                            self.consecutive_exhaustions.fetch_add(1, Ordering::Relaxed) + 1;
                        if exhausted >= MAX_CONSECUTIVE_EXHAUSTIONS {
                            warn!("Retry budget exhausted {} times in a row", exhausted);
                            Err(TokenError::SessionExpired)
                        } else {
                            Err(TokenError::Provider(ProviderError::Unauthorized))
                        }
                    }
                    Err(err) => Err(TokenError::Provider(err)),
                }
            }
            Err(err) => Err(TokenError::Provider(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeProvider;

    fn record(access: &str, refresh: &str, expires_in_secs: i64) -> TokenRecord {
        TokenRecord {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    fn store_with(provider: Arc<FakeProvider>) -> TokenStore {
        let store = TokenStore::new(provider);
        store.install(record("access-0", "refresh-0", 3600));
        store
    }

    #[tokio::test]
    async fn refresh_replaces_access_token_and_retains_refresh_token() {
        let provider = Arc::new(FakeProvider::default());
        let store = store_with(provider.clone());

        let fresh = store.refresh().await.unwrap();
        assert_eq!(fresh.access_token, "access-r1");
        // Provider did not rotate, so the old refresh token survives.
        assert_eq!(fresh.refresh_token, "refresh-0");
        assert_eq!(store.current().unwrap().access_token, "access-r1");
    }

    #[tokio::test]
    async fn refresh_adopts_rotated_refresh_token() {
        let provider = Arc::new(FakeProvider::default());
        provider.rotate_refresh_tokens();
        let store = store_with(provider);

        let fresh = store.refresh().await.unwrap();
        assert_eq!(fresh.refresh_token, "refresh-r1");
    }

    #[tokio::test]
    async fn refresh_failure_is_fatal() {
        let provider = Arc::new(FakeProvider::default());
        provider.fail_next_refresh(400);
        let store = store_with(provider);

        let err = store.refresh().await.unwrap_err();
        assert!(matches!(err, TokenError::RefreshFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_are_coalesced() {
        let provider = Arc::new(FakeProvider::default());
        provider.set_refresh_delay(std::time::Duration::from_millis(100));
        let store = Arc::new(store_with(provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.refresh().await }));
        }

        for handle in handles {
            let fresh = handle.await.unwrap().unwrap();
            assert_eq!(fresh.access_token, "access-r1");
        }
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refresh_failure_is_shared_by_all_waiters() {
        let provider = Arc::new(FakeProvider::default());
        provider.set_refresh_delay(std::time::Duration::from_millis(100));
        provider.fail_next_refresh(400);
        let store = Arc::new(store_with(provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.refresh().await }));
        }

        // The one upstream grant fails; everyone queued behind it gets that
        // failure instead of issuing a grant of their own.
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, TokenError::RefreshFailed));
        }
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn gated_read_refreshes_once_and_completes() {
        let provider = Arc::new(FakeProvider::default());
        provider.fail_next_profile(401);
        let store = store_with(provider.clone());

        let profile = store
            .gated_read(|token| {
                let provider = provider.clone();
                async move { provider.profile(&token).await }
            })
            .await
            .unwrap();

        assert_eq!(profile.id, "user-1");
        assert_eq!(provider.refresh_calls(), 1);
        assert_eq!(provider.profile_calls(), 1);
    }

    #[tokio::test]
    async fn gated_read_budget_is_two_attempts() {
        let provider = Arc::new(FakeProvider::default());
        provider.fail_next_profile(401);
        provider.fail_next_profile(401);
        let store = store_with(provider.clone());

        let err = store
            .gated_read(|token| {
                let provider = provider.clone();
                async move { provider.profile(&token).await }
            })
            .await
            .unwrap_err();

        // First exhaustion is non-fatal for the session.
        assert!(matches!(
            err,
            TokenError::Provider(ProviderError::Unauthorized)
        ));
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn repeated_exhaustion_surfaces_session_expired() {
        let provider = Arc::new(FakeProvider::default());
        let store = store_with(provider.clone());

        for expected_expired in [false, true] {
            provider.fail_next_profile(401);
            provider.fail_next_profile(401);
            let err = store
                .gated_read(|token| {
                    let provider = provider.clone();
                    async move { provider.profile(&token).await }
                })
                .await
                .unwrap_err();
            if expected_expired {
                assert!(matches!(err, TokenError::SessionExpired));
            } else {
                assert!(matches!(
                    err,
                    TokenError::Provider(ProviderError::Unauthorized)
                ));
            }
        }
    }

    #[tokio::test]
    async fn successful_read_resets_the_exhaustion_counter() {
        let provider = Arc::new(FakeProvider::default());
        let store = store_with(provider.clone());

        provider.fail_next_profile(401);
        provider.fail_next_profile(401);
        let _ = store
            .gated_read(|token| {
                let provider = provider.clone();
                async move { provider.profile(&token).await }
            })
            .await;

        // A clean read in between resets the "recurring" tracking.
        store
            .gated_read(|token| {
                let provider = provider.clone();
                async move { provider.profile(&token).await }
            })
            .await
            .unwrap();

        provider.fail_next_profile(401);
        provider.fail_next_profile(401);
        let err = store
            .gated_read(|token| {
                let provider = provider.clone();
                async move { provider.profile(&token).await }
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TokenError::Provider(ProviderError::Unauthorized)
        ));
    }
}
