//! Distributed mutual exclusion over the fast shared store.
//!
//! One key per lock, owner-tagged values, TTL expiry. Acquisition polls a
//! conditional set-if-absent; release is an atomic compare-and-delete so a
//! slow holder cannot delete a lock that expired and was re-granted.
//!
//! Liveness beats strictness here: when the wait budget runs out or the
//! store is unreachable, callers proceed without mutual exclusion. That path
//! is an explicit tagged variant, not a silent fallback, so call sites can
//! log and count it separately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::fast_store::FastStore;
use crate::model::MessageId;

pub const TOKEN_REFRESH_LOCK_KEY: &str = "lock:token-refresh";
pub const SWEEP_LOCK_KEY: &str = "lock:outbound-sweep";

pub fn message_lock_key(id: &MessageId) -> String {
    format!("lock:message:{}", id.as_str())
}

/// Opaque token identifying the acquiring process/attempt.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        Self(format!(
            "{}-{}-{}",
            std::process::id(),
            crate::model::UnixTimeMs::now().0,
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// The wait budget ran out while another holder kept the lock.
    WaitTimeout,
    /// The fast store could not be reached at all.
    StoreUnavailable,
}

/// Outcome of an acquisition attempt. `ProceededWithoutLock` still carries
/// an owner token so the release path is uniform; releasing a never-held
/// lock is a no-op by construction (compare-and-delete misses).
#[derive(Clone, Debug)]
pub enum LockAcquisition {
    Acquired { owner: OwnerToken },
    ProceededWithoutLock { owner: OwnerToken, reason: DegradeReason },
}

impl LockAcquisition {
    pub fn owner(&self) -> &OwnerToken {
        match self {
            LockAcquisition::Acquired { owner } => owner,
            LockAcquisition::ProceededWithoutLock { owner, .. } => owner,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired { .. })
    }

    pub fn degrade_reason(&self) -> Option<DegradeReason> {
        match self {
            LockAcquisition::Acquired { .. } => None,
            LockAcquisition::ProceededWithoutLock { reason, .. } => Some(*reason),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LockConfig {
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_wait_ms: 10_000,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be > 0".into());
        }
        if self.max_wait_ms < self.poll_interval_ms {
            return Err("max_wait_ms must be >= poll_interval_ms".into());
        }
        Ok(())
    }
}

pub struct LockManager<F: FastStore> {
    store: Arc<F>,
    config: LockConfig,
}

impl<F: FastStore> Clone for LockManager<F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<F: FastStore> LockManager<F> {
    pub fn new(store: Arc<F>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Acquire `key` with the configured wait budget.
    pub async fn acquire(&self, key: &str, ttl_ms: u64) -> LockAcquisition {
        self.acquire_with_wait(key, ttl_ms, self.config.max_wait_ms)
            .await
    }

    /// Acquire `key`, polling at the configured interval for up to
    /// `max_wait_ms`. Never blocks past the budget and never fails: on
    /// timeout or store unreachability the caller proceeds without the lock.
    pub async fn acquire_with_wait(
        &self,
        key: &str,
        ttl_ms: u64,
        max_wait_ms: u64,
    ) -> LockAcquisition {
        let owner = OwnerToken::generate();
        let started = Instant::now();

        loop {
            match self.store.set_if_absent(key, owner.as_str(), ttl_ms).await {
                Ok(true) => {
                    debug!(key, owner = owner.as_str(), "lock acquired");
                    return LockAcquisition::Acquired { owner };
                }
                Ok(false) => {
                    if started.elapsed() >= Duration::from_millis(max_wait_ms) {
                        warn!(key, "lock wait timeout - proceeding without lock");
                        return LockAcquisition::ProceededWithoutLock {
                            owner,
                            reason: DegradeReason::WaitTimeout,
                        };
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms))
                        .await;
                }
                Err(err) => {
                    warn!(key, %err, "fast store unavailable for lock - proceeding without lock");
                    return LockAcquisition::ProceededWithoutLock {
                        owner,
                        reason: DegradeReason::StoreUnavailable,
                    };
                }
            }
        }
    }

    /// Ownership-safe release: deletes the key only if the current holder is
    /// `owner`. Store failures are swallowed; the TTL reclaims the key.
    pub async fn release(&self, key: &str, owner: &OwnerToken) {
        match self.store.compare_and_delete(key, owner.as_str()).await {
            Ok(true) => debug!(key, "lock released"),
            Ok(false) => debug!(key, "lock not held by this owner at release"),
            Err(err) => debug!(key, %err, "lock release failed - ttl will reclaim"),
        }
    }

    /// Unconditional removal, used by operator recovery to clear a stale
    /// per-message lock. Returns whether a key was removed.
    pub async fn force_clear(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(existed) => existed,
            Err(err) => {
                warn!(key, %err, "failed to clear lock - ttl will reclaim");
                false
            }
        }
    }

    pub async fn reachable(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}
