//! Health and recovery reporting.
//!
//! A read-only facade over the delivery subsystems for the admin layer: one
//! aggregated health snapshot, stuck-message enumeration, and the two
//! operator recovery actions (on-demand WAL drain, manual retry). Owns no
//! state of its own; every report type serializes straight into the admin
//! API's JSON responses.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use crate::dedup::DedupStore;
use crate::fast_store::FastStore;
use crate::lock::LockManager;
use crate::model::{MessageId, StuckMessage, UnixTimeMs};
use crate::queue::{MessageTransport, OutboundQueue, QueueError, QueueMetricsSnapshot};
use crate::store::PrimaryStore;
use crate::wal::{WalError, WriteAheadLog};

pub const DEFAULT_STUCK_LIMIT: usize = 50;
pub const MAX_STUCK_LIMIT: usize = 200;

const RECENT_ACTIVITY_WINDOW_MS: u64 = 3_600_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WalHealth {
    pub status: SubsystemStatus,
    pub backlog: usize,
    pub oldest_written_at: Option<UnixTimeMs>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundHealth {
    pub status: SubsystemStatus,
    pub pending: u64,
    pub failed: u64,
    pub sent: u64,
    pub stuck: u64,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InboundHealth {
    pub status: SubsystemStatus,
    /// Messages claimed within the last hour.
    pub recent_activity: u64,
    pub cache_reachable: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LockHealth {
    pub status: SubsystemStatus,
    pub reachable: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall: SubsystemStatus,
    pub outbound: OutboundHealth,
    pub wal: WalHealth,
    pub inbound: InboundHealth,
    pub locks: LockHealth,
    pub generated_at: UnixTimeMs,
}

/// The `GET side-effects` slice: sweeper internals plus the outbound health
/// the sweeper is responsible for.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SideEffectStatus {
    pub sweeper: QueueMetricsSnapshot,
    pub outbound: OutboundHealth,
}

pub struct HealthReporter<S, T, F>
where
    S: PrimaryStore,
    T: MessageTransport,
    F: FastStore,
{
    store: Arc<S>,
    wal: Arc<WriteAheadLog>,
    queue: Arc<OutboundQueue<S, T, F>>,
    dedup: Arc<DedupStore<S, F>>,
    locks: LockManager<F>,
}

impl<S, T, F> HealthReporter<S, T, F>
where
    S: PrimaryStore,
    T: MessageTransport,
    F: FastStore,
{
    pub fn new(
        store: Arc<S>,
        wal: Arc<WriteAheadLog>,
        queue: Arc<OutboundQueue<S, T, F>>,
        dedup: Arc<DedupStore<S, F>>,
        locks: LockManager<F>,
    ) -> Self {
        Self {
            store,
            wal,
            queue,
            dedup,
            locks,
        }
    }

    /// One snapshot across every delivery subsystem. Never fails: a
    /// subsystem that cannot be read reports itself unhealthy instead of
    /// erroring the whole document.
    pub async fn health_report(&self) -> HealthReport {
        let outbound = self.outbound_health().await;
        let wal = self.wal_health().await;
        let inbound = self.inbound_health().await;
        let locks = self.lock_health().await;

        let slices = [outbound.status, wal.status, inbound.status, locks.status];
        let overall = if slices.contains(&SubsystemStatus::Unhealthy) {
            SubsystemStatus::Unhealthy
        } else if slices.contains(&SubsystemStatus::Degraded) {
            SubsystemStatus::Degraded
        } else {
            SubsystemStatus::Healthy
        };

        HealthReport {
            overall,
            outbound,
            wal,
            inbound,
            locks,
            generated_at: UnixTimeMs::now(),
        }
    }

    async fn outbound_health(&self) -> OutboundHealth {
        let counts = match self.store.status_counts().await {
            Ok(counts) => counts,
            Err(err) => {
                return OutboundHealth {
                    status: SubsystemStatus::Unhealthy,
                    pending: 0,
                    failed: 0,
                    sent: 0,
                    stuck: 0,
                    error: Some(err.to_string()),
                }
            }
        };

        match self.queue.count_stuck().await {
            Ok(stuck) => OutboundHealth {
                status: if stuck > 0 {
                    SubsystemStatus::Degraded
                } else {
                    SubsystemStatus::Healthy
                },
                pending: counts.pending,
                failed: counts.failed,
                sent: counts.sent,
                stuck,
                error: None,
            },
            Err(err) => OutboundHealth {
                status: SubsystemStatus::Unhealthy,
                pending: counts.pending,
                failed: counts.failed,
                sent: counts.sent,
                stuck: 0,
                error: Some(err.to_string()),
            },
        }
    }

    async fn wal_health(&self) -> WalHealth {
        let backlog = self.wal.len().await;
        WalHealth {
            // A non-empty WAL means an outage window is still being bridged.
            status: if backlog == 0 {
                SubsystemStatus::Healthy
            } else {
                SubsystemStatus::Degraded
            },
            backlog,
            oldest_written_at: self.wal.oldest_written_at().await,
        }
    }

    async fn inbound_health(&self) -> InboundHealth {
        let since = UnixTimeMs::now().saturating_sub_ms(RECENT_ACTIVITY_WINDOW_MS);
        let cache_reachable = self.dedup.cache_reachable().await;

        match self.dedup.recent_activity(since).await {
            Ok(recent_activity) => InboundHealth {
                status: if cache_reachable {
                    SubsystemStatus::Healthy
                } else {
                    SubsystemStatus::Degraded
                },
                recent_activity,
                cache_reachable,
                error: None,
            },
            Err(err) => InboundHealth {
                status: SubsystemStatus::Unhealthy,
                recent_activity: 0,
                cache_reachable,
                error: Some(err.to_string()),
            },
        }
    }

    async fn lock_health(&self) -> LockHealth {
        let reachable = self.locks.reachable().await;
        LockHealth {
            // Lock-store loss degrades to best-effort sections, it never
            // takes the subsystem down.
            status: if reachable {
                SubsystemStatus::Healthy
            } else {
                SubsystemStatus::Degraded
            },
            reachable,
        }
    }

    /// Stuck outbound messages with reason tags. `limit` defaults to
    /// `DEFAULT_STUCK_LIMIT` and is capped at `MAX_STUCK_LIMIT`.
    pub async fn stuck_messages(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<StuckMessage>, QueueError> {
        let limit = limit.unwrap_or(DEFAULT_STUCK_LIMIT).min(MAX_STUCK_LIMIT);
        self.queue.list_stuck(limit).await
    }

    /// Operator action: drain the WAL into the primary store now instead of
    /// waiting for the next sweep. Idempotent; an empty WAL migrates 0.
    #[instrument(skip(self))]
    pub async fn trigger_wal_recovery(&self) -> Result<usize, WalError> {
        let migrated = self.wal.drain(self.store.as_ref()).await?;
        info!(migrated, "operator-triggered WAL recovery");
        Ok(migrated)
    }

    /// Operator action: reset one message to pending. Surfaces
    /// `QueueError::NotFound` / `QueueError::AlreadySent` for the admin
    /// layer to translate.
    pub async fn retry_message(&self, id: &MessageId) -> Result<(), QueueError> {
        self.queue.retry(id).await
    }

    pub async fn side_effect_status(&self) -> SideEffectStatus {
        SideEffectStatus {
            sweeper: self.queue.metrics_snapshot(),
            outbound: self.outbound_health().await,
        }
    }
}
