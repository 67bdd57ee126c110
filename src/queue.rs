//! Outbound queue manager.
//!
//! Owns the lifecycle of a pending outbound message: enqueue into the
//! primary store (falling back to the WAL during an outage), send attempts
//! with capped exponential backoff, stuck-message enumeration, operator
//! retry, and the periodic background sweep that drives both retries and
//! WAL recovery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::fast_store::FastStore;
use crate::lock::{message_lock_key, DegradeReason, LockManager, SWEEP_LOCK_KEY};
use crate::model::{
    MessageDraft, MessageId, ModelError, OutboundMessage, StuckMessage, UnixTimeMs,
};
use crate::store::{PrimaryStore, StoreError};
use crate::wal::{WalError, WriteAheadLog};

// ============================================================================
// Transport seam
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Worth retrying: timeouts, throttling, connection resets.
    Transient,
    /// Retrying cannot help: rejected recipient, malformed payload.
    Permanent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Transient)
    }
}

/// External delivery collaborator (SMTP relay, provider API, ...).
#[async_trait::async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError>;
}

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("message already sent: {0}")]
    AlreadySent(String),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ModelError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wal(#[from] WalError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The attempt failed; the message is scheduled for another try.
    /// `permanent` carries the transport classification for callers that
    /// want to treat unrecoverable failures differently.
    Failed {
        retry_count: u32,
        next_retry_at: UnixTimeMs,
        permanent: bool,
    },
    /// The row was already terminal, nothing was attempted or changed.
    AlreadySent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Another process held the sweep lock; this cycle did nothing.
    pub skipped: bool,
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub wal_recovered: usize,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Failed messages at or above this retry count are stuck and need an
    /// operator.
    pub retry_ceiling: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A failed message whose `next_retry_at` is older than this is stuck
    /// even below the ceiling - it means the sweep itself stopped running.
    pub stale_after_ms: u64,
    pub sweep_interval_ms: u64,
    pub sweep_batch_limit: usize,
    pub sweep_lock_ttl_ms: u64,
    pub message_lock_ttl_ms: u64,
    pub message_lock_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 5,
            base_backoff_ms: 60_000,
            max_backoff_ms: 3_600_000,
            stale_after_ms: 600_000,
            sweep_interval_ms: 60_000,
            sweep_batch_limit: 100,
            sweep_lock_ttl_ms: 120_000,
            message_lock_ttl_ms: 60_000,
            message_lock_wait_ms: 2_000,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.retry_ceiling == 0 {
            return Err(QueueError::InvalidConfig("retry_ceiling must be > 0".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "base_backoff_ms must be > 0".into(),
            ));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(QueueError::InvalidConfig(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.sweep_batch_limit == 0 {
            return Err(QueueError::InvalidConfig(
                "sweep_batch_limit must be > 0".into(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.message_lock_ttl_ms < 1_000 || self.sweep_lock_ttl_ms < 1_000 {
            return Err(QueueError::InvalidConfig(
                "lock TTLs should be at least 1000ms".into(),
            ));
        }
        Ok(())
    }

    /// Deterministic capped exponential backoff: `base * 2^(n-1)`, clamped
    /// to `max_backoff_ms`. Same input, same delay - no jitter, so a given
    /// retry count always lands on the same schedule.
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms)
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU64,
    pub wal_fallbacks: AtomicU64,
    pub sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub operator_retries: AtomicU64,
    pub lock_degradations: AtomicU64,
    pub sweep_cycles: AtomicU64,
    pub last_sweep_at_ms: AtomicU64,
    pub sweeper_running: AtomicBool,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        let last_sweep = self.last_sweep_at_ms.load(Ordering::Relaxed);
        QueueMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            wal_fallbacks: self.wal_fallbacks.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            operator_retries: self.operator_retries.load(Ordering::Relaxed),
            lock_degradations: self.lock_degradations.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweeper_running: self.sweeper_running.load(Ordering::Relaxed),
            last_sweep_at: (last_sweep > 0).then_some(UnixTimeMs(last_sweep)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub wal_fallbacks: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub operator_retries: u64,
    pub lock_degradations: u64,
    pub sweep_cycles: u64,
    pub sweeper_running: bool,
    pub last_sweep_at: Option<UnixTimeMs>,
}

// ============================================================================
// Queue manager
// ============================================================================

pub struct OutboundQueue<S, T, F>
where
    S: PrimaryStore,
    T: MessageTransport,
    F: FastStore,
{
    store: Arc<S>,
    wal: Arc<WriteAheadLog>,
    transport: Arc<T>,
    locks: LockManager<F>,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
}

impl<S, T, F> OutboundQueue<S, T, F>
where
    S: PrimaryStore,
    T: MessageTransport,
    F: FastStore,
{
    pub fn new(
        store: Arc<S>,
        wal: Arc<WriteAheadLog>,
        transport: Arc<T>,
        locks: LockManager<F>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            store,
            wal,
            transport,
            locks,
            config,
            metrics: Arc::new(QueueMetrics::default()),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics_snapshot(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Accept an outbound message. The primary store is always tried first;
    /// the WAL takes the write only when the store reports unavailability,
    /// never on a business-rule rejection.
    #[instrument(skip(self, draft), fields(recipient = %draft.recipient))]
    pub async fn enqueue(&self, draft: MessageDraft) -> Result<MessageId, QueueError> {
        draft.validate()?;

        let now = UnixTimeMs::now();
        let message = draft.into_message(MessageId::generate(), now);
        let id = message.id.clone();

        match self.store.insert_message(&message).await {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                info!(id = %id, "message enqueued");
                Ok(id)
            }
            Err(err) if err.is_unavailable() => {
                warn!(id = %id, %err, "primary store unavailable, buffering in write-ahead log");
                self.wal.append(message, now).await?;
                self.metrics.wal_fallbacks.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Attempt delivery of one message under its per-message lock, so a
    /// manual operator retry and the background sweep cannot double-send it.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn attempt_send(&self, id: &MessageId) -> Result<SendOutcome, QueueError> {
        let key = message_lock_key(id);
        let acquisition = self
            .locks
            .acquire_with_wait(
                &key,
                self.config.message_lock_ttl_ms,
                self.config.message_lock_wait_ms,
            )
            .await;
        if !acquisition.is_acquired() {
            self.metrics.lock_degradations.fetch_add(1, Ordering::Relaxed);
        }

        let result = self.attempt_send_locked(id).await;
        self.locks.release(&key, acquisition.owner()).await;
        result
    }

    async fn attempt_send_locked(&self, id: &MessageId) -> Result<SendOutcome, QueueError> {
        let message = self
            .store
            .get_message(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if message.is_terminal() {
            return Ok(SendOutcome::AlreadySent);
        }

        match self
            .transport
            .send(&message.recipient, &message.subject, &message.body)
            .await
        {
            Ok(()) => {
                let marked = self.store.mark_sent(id).await?;
                if !marked {
                    // A concurrent writer reached terminal state first.
                    return Ok(SendOutcome::AlreadySent);
                }
                self.metrics.sent.fetch_add(1, Ordering::Relaxed);
                info!(id = %id, "message sent");
                Ok(SendOutcome::Sent)
            }
            Err(transport_err) => {
                let retry_count = message.retry_count.saturating_add(1);
                let next_retry_at = UnixTimeMs::now()
                    .saturating_add_ms(self.config.backoff_delay_ms(retry_count));

                // The transport error is stored verbatim for operator diagnosis.
                let changed = self
                    .store
                    .mark_failed(id, &transport_err.message, next_retry_at)
                    .await?;
                if !changed {
                    return Ok(SendOutcome::AlreadySent);
                }

                self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id = %id,
                    retry_count,
                    kind = ?transport_err.kind,
                    error = %transport_err.message,
                    "send attempt failed"
                );
                Ok(SendOutcome::Failed {
                    retry_count,
                    next_retry_at,
                    permanent: !transport_err.is_transient(),
                })
            }
        }
    }

    /// Operator action: reset a message to `pending` so the next sweep picks
    /// it up. Keeps `retry_count` for audit, clears the failure fields.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn retry(&self, id: &MessageId) -> Result<(), QueueError> {
        let message = self
            .store
            .get_message(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if message.is_terminal() {
            return Err(QueueError::AlreadySent(id.to_string()));
        }

        let changed = self.store.reset_to_pending(id).await?;
        if !changed {
            // Raced a concurrent send that reached terminal state.
            return Err(QueueError::AlreadySent(id.to_string()));
        }

        self.metrics.operator_retries.fetch_add(1, Ordering::Relaxed);
        info!(
            id = %id,
            previous_status = message.status.as_str(),
            retry_count = message.retry_count,
            "operator reset message to pending"
        );
        Ok(())
    }

    /// Failed messages needing operator attention, tagged with why.
    pub async fn list_stuck(&self, limit: usize) -> Result<Vec<StuckMessage>, QueueError> {
        let now = UnixTimeMs::now();
        let rows = self
            .store
            .stuck_messages(
                now,
                self.config.retry_ceiling,
                self.config.stale_after_ms,
                limit,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|(message, reason)| StuckMessage { message, reason })
            .collect())
    }

    pub async fn count_stuck(&self) -> Result<u64, QueueError> {
        let now = UnixTimeMs::now();
        Ok(self
            .store
            .count_stuck(now, self.config.retry_ceiling, self.config.stale_after_ms)
            .await?)
    }

    /// One sweep cycle: send everything due, then drain the WAL. Single
    /// flight across processes via the sweep lock; a cycle that finds the
    /// lock held skips rather than double-driving the same batch.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let acquisition = self
            .locks
            .acquire_with_wait(SWEEP_LOCK_KEY, self.config.sweep_lock_ttl_ms, 0)
            .await;

        if acquisition.degrade_reason() == Some(DegradeReason::WaitTimeout) {
            debug!("sweep lock held elsewhere, skipping cycle");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }
        if !acquisition.is_acquired() {
            // Lock store unreachable: proceed without single-flight.
            self.metrics.lock_degradations.fetch_add(1, Ordering::Relaxed);
        }

        let result = self.sweep_locked().await;
        self.locks.release(SWEEP_LOCK_KEY, acquisition.owner()).await;
        result
    }

    async fn sweep_locked(&self) -> Result<SweepReport, QueueError> {
        let now = UnixTimeMs::now();
        let mut report = SweepReport::default();

        let due = self
            .store
            .due_messages(now, self.config.retry_ceiling, self.config.sweep_batch_limit)
            .await?;
        report.attempted = due.len();

        for message in due {
            match self.attempt_send(&message.id).await {
                Ok(SendOutcome::Sent) => report.sent += 1,
                Ok(SendOutcome::Failed { .. }) => report.failed += 1,
                Ok(SendOutcome::AlreadySent) => {}
                Err(err) => {
                    warn!(id = message.id.as_str(), %err, "sweep attempt errored");
                    if matches!(&err, QueueError::Store(e) if e.is_unavailable()) {
                        break;
                    }
                }
            }
        }

        match self.wal.drain(self.store.as_ref()).await {
            Ok(count) => report.wal_recovered = count,
            Err(err) => error!(%err, "WAL drain failed during sweep"),
        }

        self.metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);
        self.metrics.last_sweep_at_ms.store(now.0, Ordering::Relaxed);
        debug!(?report, "sweep cycle finished");
        Ok(report)
    }
}

// ============================================================================
// Background sweeper
// ============================================================================

/// Handle to the spawned sweeper task; dropping it leaves the task running,
/// `shutdown()` stops it and waits for the in-flight cycle to finish.
pub struct SweeperHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl<S, T, F> OutboundQueue<S, T, F>
where
    S: PrimaryStore + 'static,
    T: MessageTransport + 'static,
    F: FastStore + 'static,
{
    /// Run `sweep` on a fixed interval until shut down. The first cycle runs
    /// immediately so a restart recovers WAL backlog without waiting.
    pub fn spawn_sweeper(queue: Arc<Self>) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let interval_ms = queue.config.sweep_interval_ms;

        queue.metrics.sweeper_running.store(true, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = queue.sweep().await {
                            error!(%err, "sweep cycle failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            queue.metrics.sweeper_running.store(false, Ordering::Relaxed);
            info!("sweeper stopped");
        });

        SweeperHandle { shutdown, handle }
    }
}

// ============================================================================
// Tests with failure injection
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::MemoryFastStore;
    use crate::lock::LockConfig;
    use crate::model::{MessageStatus, ProcessedRecord, StuckReason};
    use crate::store::{SqlitePrimaryStore, StatusCounts};
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn test_config() -> QueueConfig {
        QueueConfig {
            retry_ceiling: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 8_000,
            stale_after_ms: 600_000,
            sweep_interval_ms: 1_000,
            sweep_batch_limit: 50,
            sweep_lock_ttl_ms: 5_000,
            message_lock_ttl_ms: 5_000,
            message_lock_wait_ms: 200,
        }
    }

    fn draft() -> MessageDraft {
        MessageDraft::new("user@example.com", "Booking confirmed", "See you Tuesday").unwrap()
    }

    /// Transport that replays scripted outcomes and records every call.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: AtomicU64,
    }

    impl ScriptedTransport {
        fn always_ok() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU64::new(0),
            }
        }

        fn scripted(outcomes: Vec<Result<(), TransportError>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                calls: AtomicU64::new(0),
            }
        }

        fn call_count(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl MessageTransport for ScriptedTransport {
        async fn send(
            &self,
            _recipient: &str,
            _subject: &str,
            _body: &str,
        ) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().await.pop_front().unwrap_or(Ok(()))
        }
    }

    /// Failure-injectable store wrapper: flips every call into
    /// `Unavailable` while the outage flag is set.
    struct OutageStore<S: PrimaryStore> {
        inner: S,
        down: AtomicBool,
    }

    impl<S: PrimaryStore> OutageStore<S> {
        fn new(inner: S) -> Self {
            Self {
                inner,
                down: AtomicBool::new(false),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("injected outage".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl<S: PrimaryStore> PrimaryStore for OutageStore<S> {
        async fn insert_message(&self, message: &OutboundMessage) -> Result<(), StoreError> {
            self.check()?;
            self.inner.insert_message(message).await
        }

        async fn get_message(
            &self,
            id: &MessageId,
        ) -> Result<Option<OutboundMessage>, StoreError> {
            self.check()?;
            self.inner.get_message(id).await
        }

        async fn mark_sent(&self, id: &MessageId) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.mark_sent(id).await
        }

        async fn mark_failed(
            &self,
            id: &MessageId,
            error_message: &str,
            next_retry_at: UnixTimeMs,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.mark_failed(id, error_message, next_retry_at).await
        }

        async fn reset_to_pending(&self, id: &MessageId) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.reset_to_pending(id).await
        }

        async fn due_messages(
            &self,
            now: UnixTimeMs,
            retry_ceiling: u32,
            limit: usize,
        ) -> Result<Vec<OutboundMessage>, StoreError> {
            self.check()?;
            self.inner.due_messages(now, retry_ceiling, limit).await
        }

        async fn stuck_messages(
            &self,
            now: UnixTimeMs,
            retry_ceiling: u32,
            stale_after_ms: u64,
            limit: usize,
        ) -> Result<Vec<(OutboundMessage, StuckReason)>, StoreError> {
            self.check()?;
            self.inner
                .stuck_messages(now, retry_ceiling, stale_after_ms, limit)
                .await
        }

        async fn count_stuck(
            &self,
            now: UnixTimeMs,
            retry_ceiling: u32,
            stale_after_ms: u64,
        ) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.count_stuck(now, retry_ceiling, stale_after_ms).await
        }

        async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
            self.check()?;
            self.inner.status_counts().await
        }

        async fn insert_processed(
            &self,
            id: &MessageId,
            processed_at: UnixTimeMs,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.insert_processed(id, processed_at).await
        }

        async fn processed_exists(&self, id: &MessageId) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.processed_exists(id).await
        }

        async fn get_processed(
            &self,
            id: &MessageId,
        ) -> Result<Option<ProcessedRecord>, StoreError> {
            self.check()?;
            self.inner.get_processed(id).await
        }

        async fn delete_processed(&self, id: &MessageId) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.delete_processed(id).await
        }

        async fn processed_between(
            &self,
            from: UnixTimeMs,
            to: UnixTimeMs,
        ) -> Result<Vec<ProcessedRecord>, StoreError> {
            self.check()?;
            self.inner.processed_between(from, to).await
        }

        async fn processed_count_since(&self, since: UnixTimeMs) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.processed_count_since(since).await
        }
    }

    struct Fixture {
        queue: OutboundQueue<OutageStore<SqlitePrimaryStore>, ScriptedTransport, MemoryFastStore>,
        store: Arc<OutageStore<SqlitePrimaryStore>>,
        wal: Arc<WriteAheadLog>,
        transport: Arc<ScriptedTransport>,
        _dir: TempDir,
    }

    async fn fixture(transport: ScriptedTransport) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OutageStore::new(
            SqlitePrimaryStore::connect_in_memory().await.unwrap(),
        ));
        let wal = Arc::new(WriteAheadLog::open(dir.path().join("outbound.wal")).unwrap());
        let transport = Arc::new(transport);
        let locks = LockManager::new(
            Arc::new(MemoryFastStore::new()),
            LockConfig {
                poll_interval_ms: 10,
                max_wait_ms: 200,
            },
        );

        let queue = OutboundQueue::new(
            Arc::clone(&store),
            Arc::clone(&wal),
            Arc::clone(&transport),
            locks,
            test_config(),
        )
        .unwrap();

        Fixture {
            queue,
            store,
            wal,
            transport,
            _dir: dir,
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let config = test_config();
        assert_eq!(config.backoff_delay_ms(1), 1_000);
        assert_eq!(config.backoff_delay_ms(2), 2_000);
        assert_eq!(config.backoff_delay_ms(3), 4_000);
        assert_eq!(config.backoff_delay_ms(4), 8_000);
        // Capped from here on.
        assert_eq!(config.backoff_delay_ms(5), 8_000);
        assert_eq!(config.backoff_delay_ms(40), 8_000);
    }

    #[test]
    fn backoff_is_deterministic() {
        let config = test_config();
        for retry_count in 1..20 {
            assert_eq!(
                config.backoff_delay_ms(retry_count),
                config.backoff_delay_ms(retry_count)
            );
        }
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = test_config();
        config.retry_ceiling = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.max_backoff_ms = config.base_backoff_ms - 1;
        assert!(config.validate().is_err());

        assert!(test_config().validate().is_ok());
    }

    #[tokio::test]
    async fn enqueue_persists_pending() {
        let fx = fixture(ScriptedTransport::always_ok()).await;

        let id = fx.queue.enqueue(draft()).await.unwrap();

        let message = fx.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert!(fx.wal.is_empty().await);
    }

    #[tokio::test]
    async fn enqueue_falls_back_to_wal_during_outage() {
        let fx = fixture(ScriptedTransport::always_ok()).await;

        fx.store.set_down(true);
        let id = fx.queue.enqueue(draft()).await.unwrap();

        assert!(fx.wal.contains(&id).await);
        assert_eq!(fx.queue.metrics_snapshot().wal_fallbacks, 1);
    }

    #[tokio::test]
    async fn attempt_send_success_is_terminal() {
        let fx = fixture(ScriptedTransport::always_ok()).await;
        let id = fx.queue.enqueue(draft()).await.unwrap();

        assert_eq!(fx.queue.attempt_send(&id).await.unwrap(), SendOutcome::Sent);

        let message = fx.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);

        // A second attempt never reaches the transport again.
        assert_eq!(
            fx.queue.attempt_send(&id).await.unwrap(),
            SendOutcome::AlreadySent
        );
        assert_eq!(fx.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn attempt_send_failure_schedules_backoff() {
        let fx = fixture(ScriptedTransport::scripted(vec![Err(
            TransportError::transient("450 mailbox busy"),
        )]))
        .await;
        let id = fx.queue.enqueue(draft()).await.unwrap();

        let before = UnixTimeMs::now();
        let outcome = fx.queue.attempt_send(&id).await.unwrap();

        match outcome {
            SendOutcome::Failed {
                retry_count,
                next_retry_at,
                permanent,
            } => {
                assert_eq!(retry_count, 1);
                assert!(!permanent);
                assert!(next_retry_at.0 >= before.0 + 1_000);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let message = fx.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.retry_count, 1);
        // Stored verbatim.
        assert_eq!(message.error_message.as_deref(), Some("450 mailbox busy"));
    }

    #[tokio::test]
    async fn permanent_failure_is_classified() {
        let fx = fixture(ScriptedTransport::scripted(vec![Err(
            TransportError::permanent("550 no such user"),
        )]))
        .await;
        let id = fx.queue.enqueue(draft()).await.unwrap();

        let outcome = fx.queue.attempt_send(&id).await.unwrap();
        assert!(matches!(
            outcome,
            SendOutcome::Failed {
                permanent: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn retry_not_found() {
        let fx = fixture(ScriptedTransport::always_ok()).await;
        let missing = MessageId::new("no-such-message").unwrap();

        assert!(matches!(
            fx.queue.retry(&missing).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retry_rejects_sent_and_leaves_row_unchanged() {
        let fx = fixture(ScriptedTransport::always_ok()).await;
        let id = fx.queue.enqueue(draft()).await.unwrap();
        fx.queue.attempt_send(&id).await.unwrap();

        let before = fx.store.get_message(&id).await.unwrap().unwrap();
        assert!(matches!(
            fx.queue.retry(&id).await,
            Err(QueueError::AlreadySent(_))
        ));
        let after = fx.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn retry_resets_failed_preserving_count() {
        let fx = fixture(ScriptedTransport::scripted(vec![
            Err(TransportError::transient("boom")),
            Err(TransportError::transient("boom")),
        ]))
        .await;
        let id = fx.queue.enqueue(draft()).await.unwrap();
        fx.queue.attempt_send(&id).await.unwrap();
        fx.queue.attempt_send(&id).await.unwrap();

        fx.queue.retry(&id).await.unwrap();

        let message = fx.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.retry_count, 2);
        assert!(message.error_message.is_none());
        assert!(message.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn sweep_sends_due_and_reports() {
        let fx = fixture(ScriptedTransport::always_ok()).await;
        fx.queue.enqueue(draft()).await.unwrap();
        fx.queue.enqueue(draft()).await.unwrap();

        let report = fx.queue.sweep().await.unwrap();

        assert!(!report.skipped);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(fx.queue.metrics_snapshot().sweep_cycles, 1);
    }

    #[tokio::test]
    async fn sweep_recovers_wal_backlog() {
        let fx = fixture(ScriptedTransport::always_ok()).await;

        fx.store.set_down(true);
        let id = fx.queue.enqueue(draft()).await.unwrap();
        fx.store.set_down(false);

        let report = fx.queue.sweep().await.unwrap();

        assert_eq!(report.wal_recovered, 1);
        assert!(fx.wal.is_empty().await);
        let message = fx.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn sweep_skips_messages_over_ceiling() {
        let fx = fixture(ScriptedTransport::scripted(vec![
            Err(TransportError::transient("boom")),
            Err(TransportError::transient("boom")),
            Err(TransportError::transient("boom")),
        ]))
        .await;
        let id = fx.queue.enqueue(draft()).await.unwrap();
        for _ in 0..3 {
            fx.queue.attempt_send(&id).await.unwrap();
        }

        let calls_before = fx.transport.call_count();
        let report = fx.queue.sweep().await.unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(fx.transport.call_count(), calls_before);

        let stuck = fx.queue.list_stuck(50).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].reason, StuckReason::RetryCeilingExceeded);
    }

    #[tokio::test]
    async fn contended_sweep_skips_cycle() {
        let fx = fixture(ScriptedTransport::always_ok()).await;
        fx.queue.enqueue(draft()).await.unwrap();

        // Simulate another process holding the sweep lock.
        let fast = Arc::new(MemoryFastStore::new());
        let foreign = LockManager::new(Arc::clone(&fast), LockConfig::default());
        let _held = foreign.acquire(SWEEP_LOCK_KEY, 60_000).await;

        // Rebuild the queue against the same fast store so it sees the lock.
        let locks = LockManager::new(
            fast,
            LockConfig {
                poll_interval_ms: 10,
                max_wait_ms: 100,
            },
        );
        let queue = OutboundQueue::new(
            Arc::clone(&fx.store),
            Arc::clone(&fx.wal),
            Arc::clone(&fx.transport),
            locks,
            test_config(),
        )
        .unwrap();

        let report = queue.sweep().await.unwrap();
        assert!(report.skipped);
        assert_eq!(fx.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_and_shuts_down() {
        let fx = fixture(ScriptedTransport::always_ok()).await;
        let id = fx.queue.enqueue(draft()).await.unwrap();

        let queue = Arc::new(
            OutboundQueue::new(
                Arc::clone(&fx.store),
                Arc::clone(&fx.wal),
                Arc::clone(&fx.transport),
                LockManager::new(
                    Arc::new(MemoryFastStore::new()),
                    LockConfig {
                        poll_interval_ms: 10,
                        max_wait_ms: 100,
                    },
                ),
                QueueConfig {
                    sweep_interval_ms: 20,
                    ..test_config()
                },
            )
            .unwrap(),
        );

        let handle = OutboundQueue::spawn_sweeper(Arc::clone(&queue));
        assert!(queue.metrics_snapshot().sweeper_running);

        // First tick fires immediately; give it a moment to complete.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert!(!queue.metrics_snapshot().sweeper_running);
        let message = fx.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
    }

    mod backoff_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn backoff_is_monotone_and_capped(retry_count in 1u32..64) {
                let config = QueueConfig::default();
                let current = config.backoff_delay_ms(retry_count);
                let next = config.backoff_delay_ms(retry_count + 1);

                prop_assert!(next >= current);
                prop_assert!(current >= config.base_backoff_ms);
                prop_assert!(current <= config.max_backoff_ms);
            }

            #[test]
            fn backoff_strictly_increases_below_cap(retry_count in 1u32..10) {
                let config = QueueConfig::default();
                let current = config.backoff_delay_ms(retry_count);
                let next = config.backoff_delay_ms(retry_count + 1);

                if next < config.max_backoff_ms {
                    prop_assert!(next > current);
                }
            }
        }
    }
}
