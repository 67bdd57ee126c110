//! Reliable message delivery and inbound deduplication.
//!
//! `courier` is the delivery backbone of an appointment-coordination
//! platform: it guarantees that outbound notification emails survive a
//! primary-store outage, that failed sends are retried with bounded backoff
//! and surfaced for operators once stuck, that inbound mailbox messages are
//! processed at most once across racing workers and restarts, and that a
//! shared OAuth credential is refreshed by one process at a time.
//!
//! The pieces, leaves first:
//!
//! - [`lock`] - distributed mutual exclusion over the fast shared store,
//!   with ownership-safe release and an explicit proceed-without-lock
//!   degraded path.
//! - [`wal`] - append-only durable buffer that bridges primary-store
//!   outages and is replayed back once the store recovers.
//! - [`queue`] - outbound message lifecycle: enqueue, send attempts with
//!   capped exponential backoff, stuck enumeration, operator retry, and the
//!   single-flight background sweep.
//! - [`dedup`] - two-tier (durable row + fast membership set) record of
//!   already-handled inbound ids; the durable uniqueness constraint is the
//!   at-most-once gate.
//! - [`credential`] - serializes OAuth token refresh behind the lock
//!   manager.
//! - [`health`] - read-only aggregation plus operator recovery actions for
//!   the admin layer.
//!
//! Store backends are injected through the [`store::PrimaryStore`] and
//! [`fast_store::FastStore`] seams; the transport and identity provider are
//! collaborator traits. Nothing in here holds a global client handle.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod credential;
pub mod dedup;
pub mod fast_store;
pub mod health;
pub mod lock;
pub mod model;
pub mod queue;
pub mod store;
pub mod wal;

pub use credential::{AccessToken, AuthError, IdentityProvider, RefreshConfig, RefreshCoordinator};
pub use dedup::{DedupConfig, DedupStore, ProcessOutcome};
pub use fast_store::{FastStore, FastStoreError, MemoryFastStore};
pub use health::{HealthReport, HealthReporter, SideEffectStatus, SubsystemStatus};
pub use lock::{DegradeReason, LockAcquisition, LockConfig, LockManager, OwnerToken};
pub use model::{
    MessageDraft, MessageId, MessageStatus, OutboundMessage, ProcessedRecord, StuckMessage,
    StuckReason, UnixTimeMs,
};
pub use queue::{
    MessageTransport, OutboundQueue, QueueConfig, QueueError, SendOutcome, SweepReport,
    SweeperHandle, TransportError, TransportErrorKind,
};
pub use store::{PrimaryStore, SqlitePrimaryStore, StatusCounts, StoreError};
pub use wal::{WalEntry, WalError, WriteAheadLog};
