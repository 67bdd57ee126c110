//! Credential refresh coordination.
//!
//! A shared OAuth access token must be refreshed by at most one process at a
//! time: two concurrent refreshes against the identity provider can
//! invalidate each other's tokens. The coordinator wraps the refresh step in
//! the token-refresh lock and guarantees an ownership-safe release on every
//! exit path. It knows nothing about the credential format; callers supply
//! the load/check/refresh/persist logic as a closure.
//!
//! If the lock cannot be acquired within the wait budget the closure runs
//! anyway: a refresh race is self-correcting (last writer wins), a hung
//! request pipeline is not.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::fast_store::FastStore;
use crate::lock::{LockManager, TOKEN_REFRESH_LOCK_KEY};
use crate::model::UnixTimeMs;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The provider answered and said no; retrying with the same input
    /// cannot help.
    #[error("identity provider rejected refresh: {0}")]
    Rejected(String),

    /// The provider could not be reached; the current token stays in use.
    #[error("identity provider unreachable: {0}")]
    Unavailable(String),
}

/// A bearer credential with an optional expiry. The coordinator treats the
/// value as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Option<UnixTimeMs>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: Option<UnixTimeMs>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Does the token expire within `margin_ms` of `now`? Tokens without an
    /// expiry are treated as always due for refresh.
    pub fn expires_within(&self, now: UnixTimeMs, margin_ms: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at.0 <= now.saturating_add_ms(margin_ms).0,
            None => true,
        }
    }
}

/// External identity provider seam: exchanges the current credential for a
/// fresh one.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn refresh(&self, current: &AccessToken) -> Result<AccessToken, AuthError>;
}

#[derive(Clone, Debug)]
pub struct RefreshConfig {
    pub lock_key: String,
    pub lock_ttl_ms: u64,
    pub max_wait_ms: u64,
    /// Refresh when the token expires within this margin, so callers never
    /// hand out a token that dies mid-request.
    pub expiry_margin_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lock_key: TOKEN_REFRESH_LOCK_KEY.to_string(),
            lock_ttl_ms: 30_000,
            max_wait_ms: 10_000,
            expiry_margin_ms: 60_000,
        }
    }
}

/// Serializes access to a shared credential's refresh step.
pub struct RefreshCoordinator<F: FastStore> {
    locks: LockManager<F>,
    config: RefreshConfig,
}

impl<F: FastStore> RefreshCoordinator<F> {
    pub fn new(locks: LockManager<F>, config: RefreshConfig) -> Self {
        Self { locks, config }
    }

    /// Run `refresh` under the token-refresh lock. The lock is released on
    /// every exit path, including an error return from the closure; a
    /// degraded acquisition (timeout, unreachable store) still runs the
    /// closure and is logged with the caller's trace id.
    #[instrument(skip(self, refresh), fields(trace_id = trace_id))]
    pub async fn with_refresh_lock<R, Op, Fut>(&self, trace_id: &str, refresh: Op) -> R
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let acquisition = self
            .locks
            .acquire_with_wait(
                &self.config.lock_key,
                self.config.lock_ttl_ms,
                self.config.max_wait_ms,
            )
            .await;

        if let Some(reason) = acquisition.degrade_reason() {
            warn!(
                trace_id,
                ?reason,
                "token refresh proceeding without mutual exclusion"
            );
        } else {
            debug!(trace_id, "token refresh lock held");
        }

        let result = refresh().await;
        self.locks
            .release(&self.config.lock_key, acquisition.owner())
            .await;
        result
    }

    /// Convenience for the common shape: reuse `current` while it is still
    /// comfortably valid, otherwise refresh through `provider` under the
    /// lock. The expiry is re-checked inside the lock so a caller that
    /// waited behind a concurrent refresh picks up the other worker's token
    /// age rather than refreshing again.
    pub async fn refresh_with<P>(
        &self,
        trace_id: &str,
        provider: &P,
        current: &AccessToken,
    ) -> Result<AccessToken, AuthError>
    where
        P: IdentityProvider,
    {
        if !current.expires_within(UnixTimeMs::now(), self.config.expiry_margin_ms) {
            return Ok(current.clone());
        }

        self.with_refresh_lock(trace_id, || async {
            if !current.expires_within(UnixTimeMs::now(), self.config.expiry_margin_ms) {
                return Ok(current.clone());
            }
            provider.refresh(current).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::MemoryFastStore;
    use crate::lock::LockConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn coordinator(
        store: Arc<MemoryFastStore>,
        max_wait_ms: u64,
    ) -> RefreshCoordinator<MemoryFastStore> {
        RefreshCoordinator::new(
            LockManager::new(
                store,
                LockConfig {
                    poll_interval_ms: 10,
                    max_wait_ms: 1_000,
                },
            ),
            RefreshConfig {
                max_wait_ms,
                ..RefreshConfig::default()
            },
        )
    }

    struct CountingProvider {
        calls: AtomicU32,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl IdentityProvider for CountingProvider {
        async fn refresh(&self, _current: &AccessToken) -> Result<AccessToken, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken::new(
                "refreshed",
                Some(UnixTimeMs::now().saturating_add_ms(3_600_000)),
            ))
        }
    }

    #[tokio::test]
    async fn lock_released_after_success() {
        let store = Arc::new(MemoryFastStore::new());
        let coord = coordinator(Arc::clone(&store), 500);

        let value = coord.with_refresh_lock("trace-1", || async { 7 }).await;
        assert_eq!(value, 7);
        assert_eq!(store.get(TOKEN_REFRESH_LOCK_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_released_after_error_return() {
        let store = Arc::new(MemoryFastStore::new());
        let coord = coordinator(Arc::clone(&store), 500);

        let result: Result<(), AuthError> = coord
            .with_refresh_lock("trace-1", || async {
                Err(AuthError::Unavailable("provider down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get(TOKEN_REFRESH_LOCK_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn held_lock_degrades_but_still_runs() {
        let store = Arc::new(MemoryFastStore::new());

        // Another process holds the refresh lock with a long TTL.
        let foreign = LockManager::new(Arc::clone(&store), LockConfig::default());
        let held = foreign.acquire(TOKEN_REFRESH_LOCK_KEY, 60_000).await;
        assert!(held.is_acquired());

        let coord = coordinator(Arc::clone(&store), 50);
        let value = coord.with_refresh_lock("trace-1", || async { 42 }).await;

        // Ran anyway, and did not steal the foreign owner's lock.
        assert_eq!(value, 42);
        assert_eq!(
            store.get(TOKEN_REFRESH_LOCK_KEY).await.unwrap().as_deref(),
            Some(held.owner().as_str())
        );
    }

    #[tokio::test]
    async fn fresh_token_skips_provider() {
        let store = Arc::new(MemoryFastStore::new());
        let coord = coordinator(store, 500);
        let provider = CountingProvider::new();

        let current = AccessToken::new(
            "current",
            Some(UnixTimeMs::now().saturating_add_ms(3_600_000)),
        );
        let token = coord
            .refresh_with("trace-1", &provider, &current)
            .await
            .unwrap();

        assert_eq!(token, current);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let store = Arc::new(MemoryFastStore::new());
        let coord = coordinator(store, 500);
        let provider = CountingProvider::new();

        let current = AccessToken::new("current", Some(UnixTimeMs(1)));
        let token = coord
            .refresh_with("trace-1", &provider, &current)
            .await
            .unwrap();

        assert_eq!(token.value, "refreshed");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_without_expiry_is_always_refreshed() {
        let store = Arc::new(MemoryFastStore::new());
        let coord = coordinator(store, 500);
        let provider = CountingProvider::new();

        let current = AccessToken::new("current", None);
        coord
            .refresh_with("trace-1", &provider, &current)
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
