//! Write-ahead log for outbound messages.
//!
//! An append-only durable buffer that exists to bridge a primary-store
//! outage window: the queue manager appends here when the store write path
//! reports unavailability, and the recovery sweep replays entries back into
//! the store once it returns. Entries are only ever appended or removed,
//! never mutated in place.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{MessageId, MessageStatus, OutboundMessage, UnixTimeMs};
use crate::store::PrimaryStore;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_WAL_BYTES: usize = 50 * 1024 * 1024;
const MAX_WAL_ENTRIES: usize = 10_000;
const WAL_MAGIC: &[u8; 4] = b"CWAL";

#[derive(Error, Debug)]
pub enum WalError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted log: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("log too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("too many entries: {count}, max {max}")]
    TooManyEntries { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for WalError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        WalError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for WalError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        WalError::Serialization(e.to_string())
    }
}

/// A buffered outbound message plus the moment it entered the log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WalEntry {
    pub message: OutboundMessage,
    pub written_at: UnixTimeMs,
}

#[derive(Serialize, Deserialize, Debug)]
struct WalEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct WalPayload {
    entries: Vec<WalEntry>,
}

/// File-backed WAL. Mutations rewrite the whole file through a checksummed
/// envelope and an atomic tmp+rename, so a crash mid-write leaves the
/// previous generation intact.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    entries: Mutex<Vec<WalEntry>>,
}

impl WriteAheadLog {
    /// Open the log at `path`, loading any entries a previous process left
    /// behind. A missing file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WalError> {
        let path = path.into();
        let entries = Self::load(&path)?;
        if !entries.is_empty() {
            info!(backlog = entries.len(), "write-ahead log opened with backlog");
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Append a message, idempotently by id: a second append with the same
    /// id replaces the buffered copy instead of duplicating it.
    pub async fn append(&self, message: OutboundMessage, now: UnixTimeMs) -> Result<(), WalError> {
        let mut entries = self.entries.lock().await;

        let entry = WalEntry {
            message,
            written_at: now,
        };

        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.message.id == entry.message.id)
        {
            *existing = entry;
        } else {
            if entries.len() >= MAX_WAL_ENTRIES {
                return Err(WalError::TooManyEntries {
                    count: entries.len() + 1,
                    max: MAX_WAL_ENTRIES,
                });
            }
            entries.push(entry);
        }

        Self::persist(&entries, &self.path)
    }

    /// Replay buffered entries into the primary store. Each successfully
    /// written entry is removed; failures stay for the next cycle. Returns
    /// the number migrated. Draining an empty log returns 0 and touches
    /// nothing.
    pub async fn drain<S>(&self, store: &S) -> Result<usize, WalError>
    where
        S: PrimaryStore + ?Sized,
    {
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return Ok(0);
        }

        let buffered = std::mem::take(&mut *entries);
        let total = buffered.len();
        let mut remaining = Vec::new();
        let mut migrated = 0usize;
        let mut iter = buffered.into_iter();

        while let Some(entry) = iter.next() {
            // Replayed messages re-enter the normal lifecycle as pending.
            let mut message = entry.message.clone();
            message.status = MessageStatus::Pending;

            match store.insert_message(&message).await {
                Ok(()) => migrated += 1,
                Err(err) if err.is_unavailable() => {
                    warn!(%err, "primary store still unavailable, stopping WAL drain");
                    remaining.push(entry);
                    remaining.extend(iter);
                    break;
                }
                Err(err) => {
                    warn!(id = entry.message.id.as_str(), %err, "WAL entry replay failed");
                    remaining.push(entry);
                }
            }
        }

        *entries = remaining;

        if migrated > 0 {
            Self::persist(&entries, &self.path)?;
            info!(migrated, total, "write-ahead log drained");
        }

        Ok(migrated)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.entries
            .lock()
            .await
            .iter()
            .any(|e| &e.message.id == id)
    }

    pub async fn oldest_written_at(&self) -> Option<UnixTimeMs> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.written_at)
            .min()
    }

    fn persist(entries: &[WalEntry], path: &Path) -> Result<(), WalError> {
        let payload = WalPayload {
            entries: entries.to_vec(),
        };

        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes)?;

        if payload_bytes.len() > MAX_WAL_BYTES {
            return Err(WalError::TooLarge {
                size: payload_bytes.len(),
                max: MAX_WAL_BYTES,
            });
        }

        let checksum = blake3::hash(&payload_bytes);

        let envelope = WalEnvelope {
            magic: *WAL_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: payload_bytes,
        };

        let mut envelope_bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut envelope_bytes)?;

        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&envelope_bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    fn load(path: &Path) -> Result<Vec<WalEntry>, WalError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let bytes = std::fs::read(path)?;

        if bytes.is_empty() {
            return Err(WalError::Corrupted {
                reason: "empty file",
            });
        }
        if bytes.len() > MAX_WAL_BYTES {
            return Err(WalError::TooLarge {
                size: bytes.len(),
                max: MAX_WAL_BYTES,
            });
        }

        let envelope: WalEnvelope = ciborium::from_reader(&bytes[..])?;

        if envelope.magic != *WAL_MAGIC {
            return Err(WalError::Corrupted {
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(WalError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version == 0 {
            return Err(WalError::UnknownSchema(0));
        }

        let actual_checksum = blake3::hash(&envelope.payload);
        if actual_checksum.as_bytes() != &envelope.checksum {
            return Err(WalError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual_checksum.as_bytes()),
            });
        }

        let payload: WalPayload = ciborium::from_reader(&envelope.payload[..])?;

        if payload.entries.len() > MAX_WAL_ENTRIES {
            return Err(WalError::TooManyEntries {
                count: payload.entries.len(),
                max: MAX_WAL_ENTRIES,
            });
        }

        Ok(payload.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageDraft;
    use crate::store::SqlitePrimaryStore;
    use tempfile::tempdir;

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    fn sample_message(id: &str) -> OutboundMessage {
        MessageDraft::new("user@example.com", "Reminder", "Your appointment is tomorrow")
            .unwrap()
            .into_message(MessageId::new(id).unwrap(), make_now())
    }

    #[tokio::test]
    async fn open_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("outbound.wal")).unwrap();
        assert!(wal.is_empty().await);
        assert_eq!(wal.oldest_written_at().await, None);
    }

    #[tokio::test]
    async fn append_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbound.wal");

        let wal = WriteAheadLog::open(&path).unwrap();
        wal.append(sample_message("m-1"), make_now()).await.unwrap();
        wal.append(sample_message("m-2"), make_now()).await.unwrap();

        let reopened = WriteAheadLog::open(&path).unwrap();
        assert_eq!(reopened.len().await, 2);
        assert!(reopened.contains(&MessageId::new("m-1").unwrap()).await);
    }

    #[tokio::test]
    async fn append_same_id_replaces() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("outbound.wal")).unwrap();

        let mut first = sample_message("m-1");
        first.subject = "first".into();
        let mut second = sample_message("m-1");
        second.subject = "second".into();

        wal.append(first, make_now()).await.unwrap();
        wal.append(second, make_now().saturating_add_ms(10)).await.unwrap();

        assert_eq!(wal.len().await, 1);
    }

    #[tokio::test]
    async fn drain_moves_entries_into_store_as_pending() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("outbound.wal")).unwrap();
        let store = SqlitePrimaryStore::connect_in_memory().await.unwrap();

        let mut buffered = sample_message("m-1");
        buffered.status = MessageStatus::Failed;
        wal.append(buffered, make_now()).await.unwrap();

        let migrated = wal.drain(&store).await.unwrap();
        assert_eq!(migrated, 1);
        assert!(wal.is_empty().await);

        let loaded = store
            .get_message(&MessageId::new("m-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn drain_empty_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbound.wal");
        let wal = WriteAheadLog::open(&path).unwrap();
        let store = SqlitePrimaryStore::connect_in_memory().await.unwrap();

        assert_eq!(wal.drain(&store).await.unwrap(), 0);
        assert_eq!(wal.drain(&store).await.unwrap(), 0);
        // Nothing migrated, nothing persisted.
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupted_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbound.wal");

        let wal = WriteAheadLog::open(&path).unwrap();
        wal.append(sample_message("m-1"), make_now()).await.unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        if let Some(byte) = bytes.last_mut() {
            *byte ^= 0xFF;
        }
        std::fs::write(&path, &bytes).unwrap();

        assert!(WriteAheadLog::open(&path).is_err());
    }

    #[tokio::test]
    async fn empty_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbound.wal");
        std::fs::write(&path, b"").unwrap();

        let result = WriteAheadLog::open(&path);
        assert!(matches!(result, Err(WalError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbound.wal");
        let tmp_path = path.with_extension("tmp");

        let wal = WriteAheadLog::open(&path).unwrap();
        wal.append(sample_message("m-1"), make_now()).await.unwrap();

        assert!(path.exists());
        assert!(!tmp_path.exists());
    }

    #[tokio::test]
    async fn oldest_written_at_tracks_minimum() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("outbound.wal")).unwrap();

        let base = make_now();
        wal.append(sample_message("m-2"), base.saturating_add_ms(500))
            .await
            .unwrap();
        wal.append(sample_message("m-1"), base).await.unwrap();

        assert_eq!(wal.oldest_written_at().await, Some(base));
    }
}
