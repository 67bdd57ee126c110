//! Fast shared store seam.
//!
//! The lock manager and the dedup cache tier run against this trait. The
//! contract mirrors what the deployment's shared store provides: conditional
//! set-if-absent with expiry, atomic compare-and-delete, and a time-scored
//! membership set for windowed queries. `MemoryFastStore` is the in-process
//! implementation used by tests and single-node deployments; wire backends
//! live with the host.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum FastStoreError {
    #[error("fast store unavailable: {0}")]
    Unavailable(String),

    #[error("fast store backend error: {0}")]
    Backend(String),
}

/// Conditional-write and scored-set operations over the shared fast store.
///
/// Every mutation here must be atomic on the store side; callers rely on
/// `set_if_absent` and `compare_and_delete` as their only concurrency
/// primitives.
#[async_trait::async_trait]
pub trait FastStore: Send + Sync {
    /// Set `key` to `value` with a TTL, only if the key is absent.
    /// Returns `true` when this call created the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, FastStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, FastStoreError>;

    /// Delete `key` only if its current value equals `expected`, as a single
    /// atomic operation. Returns `true` when the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str)
        -> Result<bool, FastStoreError>;

    /// Unconditional delete. Returns `true` when the key existed.
    async fn delete(&self, key: &str) -> Result<bool, FastStoreError>;

    /// Insert `member` into a scored set (upserts the score).
    async fn scored_insert(
        &self,
        set: &str,
        member: &str,
        score: u64,
    ) -> Result<(), FastStoreError>;

    async fn scored_contains(&self, set: &str, member: &str) -> Result<bool, FastStoreError>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn scored_range(
        &self,
        set: &str,
        min: u64,
        max: u64,
    ) -> Result<Vec<(String, u64)>, FastStoreError>;

    /// Remove `member`. Returns `true` when it was present.
    async fn scored_remove(&self, set: &str, member: &str) -> Result<bool, FastStoreError>;

    async fn scored_count_since(&self, set: &str, min: u64) -> Result<u64, FastStoreError>;

    /// Cheap reachability probe for the health report.
    async fn ping(&self) -> Result<(), FastStoreError>;
}

#[derive(Debug)]
struct ExpiringValue {
    value: String,
    expires_at: Option<Instant>,
}

impl ExpiringValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

#[derive(Debug, Default)]
struct MemoryFastStoreState {
    keys: HashMap<String, ExpiringValue>,
    sets: HashMap<String, HashMap<String, u64>>,
}

/// In-process `FastStore` backed by guarded maps, with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryFastStore {
    state: RwLock<MemoryFastStoreState>,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl FastStore for MemoryFastStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, FastStoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        if let Some(existing) = state.keys.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }

        state.keys.insert(
            key.to_string(),
            ExpiringValue {
                value: value.to_string(),
                expires_at: Some(now + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, FastStoreError> {
        let now = Instant::now();
        let state = self.state.read().await;
        Ok(state
            .keys
            .get(key)
            .filter(|v| !v.is_expired(now))
            .map(|v| v.value.clone()))
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, FastStoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let matches = state
            .keys
            .get(key)
            .filter(|v| !v.is_expired(now))
            .map_or(false, |v| v.value == expected);

        if matches {
            state.keys.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> Result<bool, FastStoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let existed = state
            .keys
            .remove(key)
            .map_or(false, |v| !v.is_expired(now));
        Ok(existed)
    }

    async fn scored_insert(
        &self,
        set: &str,
        member: &str,
        score: u64,
    ) -> Result<(), FastStoreError> {
        let mut state = self.state.write().await;
        state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn scored_contains(&self, set: &str, member: &str) -> Result<bool, FastStoreError> {
        let state = self.state.read().await;
        Ok(state
            .sets
            .get(set)
            .map_or(false, |members| members.contains_key(member)))
    }

    async fn scored_range(
        &self,
        set: &str,
        min: u64,
        max: u64,
    ) -> Result<Vec<(String, u64)>, FastStoreError> {
        let state = self.state.read().await;
        let mut members: Vec<(String, u64)> = state
            .sets
            .get(set)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn scored_remove(&self, set: &str, member: &str) -> Result<bool, FastStoreError> {
        let mut state = self.state.write().await;
        Ok(state
            .sets
            .get_mut(set)
            .map_or(false, |members| members.remove(member).is_some()))
    }

    async fn scored_count_since(&self, set: &str, min: u64) -> Result<u64, FastStoreError> {
        let state = self.state.read().await;
        Ok(state
            .sets
            .get(set)
            .map_or(0, |members| {
                members.values().filter(|score| **score >= min).count() as u64
            }))
    }

    async fn ping(&self) -> Result<(), FastStoreError> {
        Ok(())
    }
}
