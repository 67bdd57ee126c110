//! Inbound dedup store.
//!
//! Two-tier record of already-handled inbound message ids: a durable row
//! (source of truth) plus a time-scored membership set in the fast store for
//! cheap existence checks. The durable conditional insert in
//! `mark_processing` is the sole "exactly one winner" mechanism; the cache
//! is a performance aid, never the authority. Claims are recorded when
//! processing begins, not after it completes, which closes the race window
//! at the cost of a crash-between-claim-and-effect leaving the id claimed -
//! `forget` is the recovery path for that.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::fast_store::FastStore;
use crate::lock::{message_lock_key, LockManager};
use crate::model::{MessageId, ProcessedRecord, UnixTimeMs};
use crate::store::{PrimaryStore, StoreError};

pub const PROCESSED_SET_KEY: &str = "inbound:processed";

#[derive(Debug, Error)]
pub enum DedupError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a candidate inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome<R> {
    /// This worker won the claim and ran the side effect.
    Performed(R),
    /// Another worker already claimed the id; nothing was done.
    Duplicate,
}

impl<R> ProcessOutcome<R> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ProcessOutcome::Duplicate)
    }
}

#[derive(Clone, Debug)]
pub struct DedupConfig {
    pub cache_set_key: String,
    pub claim_lock_ttl_ms: u64,
    pub claim_lock_wait_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cache_set_key: PROCESSED_SET_KEY.to_string(),
            claim_lock_ttl_ms: 30_000,
            claim_lock_wait_ms: 5_000,
        }
    }
}

pub struct DedupStore<S, F>
where
    S: PrimaryStore,
    F: FastStore,
{
    store: Arc<S>,
    cache: Arc<F>,
    locks: LockManager<F>,
    config: DedupConfig,
}

impl<S, F> DedupStore<S, F>
where
    S: PrimaryStore,
    F: FastStore,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<F>,
        locks: LockManager<F>,
        config: DedupConfig,
    ) -> Self {
        Self {
            store,
            cache,
            locks,
            config,
        }
    }

    /// Has this id already been handled? Cache tier first; a miss (or an
    /// unreachable cache) falls back to the durable row, backfilling the
    /// cache so later checks stay cheap after an eviction or restart.
    pub async fn is_processed(&self, id: &MessageId) -> Result<bool, DedupError> {
        match self
            .cache
            .scored_contains(&self.config.cache_set_key, id.as_str())
            .await
        {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                warn!(id = %id, %err, "dedup cache unreachable, falling back to durable tier");
            }
        }

        match self.store.get_processed(id).await? {
            Some(record) => {
                if let Err(err) = self
                    .cache
                    .scored_insert(
                        &self.config.cache_set_key,
                        id.as_str(),
                        record.processed_at.0,
                    )
                    .await
                {
                    debug!(id = %id, %err, "dedup cache backfill failed");
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Atomically claim an id. The durable uniqueness constraint decides the
    /// winner; exactly one concurrent caller sees `true`. Losing is the
    /// expected outcome for racers, not an error.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn mark_processing(
        &self,
        id: &MessageId,
        now: UnixTimeMs,
    ) -> Result<bool, DedupError> {
        let claimed = self.store.insert_processed(id, now).await?;

        if claimed {
            // Cache write is best-effort; the durable row already guards.
            if let Err(err) = self
                .cache
                .scored_insert(&self.config.cache_set_key, id.as_str(), now.0)
                .await
            {
                warn!(id = %id, %err, "dedup cache write failed after claim");
            }
            debug!(id = %id, "inbound message claimed");
        }

        Ok(claimed)
    }

    /// The full worker flow for one candidate id: fast-path check, per-id
    /// lock, double-check, claim, then the side effect - run only by the
    /// single winning claimer.
    #[instrument(skip(self, side_effect), fields(id = %id))]
    pub async fn process_once<R, Op, Fut>(
        &self,
        id: &MessageId,
        now: UnixTimeMs,
        side_effect: Op,
    ) -> Result<ProcessOutcome<R>, DedupError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if self.is_processed(id).await? {
            return Ok(ProcessOutcome::Duplicate);
        }

        let key = message_lock_key(id);
        let acquisition = self
            .locks
            .acquire_with_wait(
                &key,
                self.config.claim_lock_ttl_ms,
                self.config.claim_lock_wait_ms,
            )
            .await;

        let result = self.claim_and_run(id, now, side_effect).await;
        self.locks.release(&key, acquisition.owner()).await;
        result
    }

    async fn claim_and_run<R, Op, Fut>(
        &self,
        id: &MessageId,
        now: UnixTimeMs,
        side_effect: Op,
    ) -> Result<ProcessOutcome<R>, DedupError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        // Double-check under the lock before claiming.
        if self.is_processed(id).await? {
            return Ok(ProcessOutcome::Duplicate);
        }
        if !self.mark_processing(id, now).await? {
            return Ok(ProcessOutcome::Duplicate);
        }

        let value = side_effect().await;
        Ok(ProcessOutcome::Performed(value))
    }

    /// Operator recovery: un-process an id so it can be handled again.
    /// Removes the durable row, the cache entry and any stale per-message
    /// lock. Returns whether a durable row existed.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn forget(&self, id: &MessageId) -> Result<bool, DedupError> {
        let removed = self.store.delete_processed(id).await?;

        if let Err(err) = self
            .cache
            .scored_remove(&self.config.cache_set_key, id.as_str())
            .await
        {
            warn!(id = %id, %err, "dedup cache removal failed during forget");
        }

        self.locks.force_clear(&message_lock_key(id)).await;

        info!(id = %id, removed, "operator un-processed inbound message");
        Ok(removed)
    }

    /// Durable-tier range query for incident investigation ("what was
    /// processed between T1 and T2").
    pub async fn processed_between(
        &self,
        from: UnixTimeMs,
        to: UnixTimeMs,
    ) -> Result<Vec<ProcessedRecord>, DedupError> {
        Ok(self.store.processed_between(from, to).await?)
    }

    /// Recent-activity count for the health report. Served from the cache
    /// tier when reachable, otherwise from the durable rows.
    pub async fn recent_activity(&self, since: UnixTimeMs) -> Result<u64, DedupError> {
        match self
            .cache
            .scored_count_since(&self.config.cache_set_key, since.0)
            .await
        {
            Ok(count) => Ok(count),
            Err(err) => {
                warn!(%err, "dedup cache unreachable for activity count, using durable tier");
                Ok(self.store.processed_count_since(since).await?)
            }
        }
    }

    pub async fn cache_reachable(&self) -> bool {
        self.cache.ping().await.is_ok()
    }
}
