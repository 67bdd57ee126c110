use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Explicit timestamp unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn saturating_sub_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Validated message identifier - immutable after construction.
///
/// Covers both locally generated outbound ids and caller-supplied inbound
/// mailbox ids, which share the same character set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), ModelError> {
        if id.is_empty() {
            return Err(ModelError::InvalidId("MessageId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "MessageId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidId(
                "MessageId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn try_from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// `Sent` is terminal - no further mutation permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent)
    }
}

/// An outbound notification owned by the queue manager and persisted in the
/// primary store (or bridged through the WAL during an outage).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<UnixTimeMs>,
    pub error_message: Option<String>,
    pub created_at: UnixTimeMs,
}

impl OutboundMessage {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Caller-facing payload for `enqueue`. The queue assigns the id and the
/// lifecycle fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl MessageDraft {
    const MAX_RECIPIENT_LENGTH: usize = 320;
    const MAX_SUBJECT_LENGTH: usize = 1_000;
    const MAX_BODY_BYTES: usize = 512 * 1024;

    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let draft = Self {
            recipient: recipient.into().trim().to_string(),
            subject: subject.into(),
            body: body.into(),
        };
        draft.validate()?;
        Ok(draft)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.recipient.is_empty() {
            return Err(ModelError::Validation("recipient cannot be empty".into()));
        }
        if self.recipient.len() > Self::MAX_RECIPIENT_LENGTH {
            return Err(ModelError::Validation(format!(
                "recipient exceeds {} characters",
                Self::MAX_RECIPIENT_LENGTH
            )));
        }
        if self.subject.len() > Self::MAX_SUBJECT_LENGTH {
            return Err(ModelError::Validation(format!(
                "subject exceeds {} characters",
                Self::MAX_SUBJECT_LENGTH
            )));
        }
        if self.body.len() > Self::MAX_BODY_BYTES {
            return Err(ModelError::Validation(format!(
                "body exceeds {} bytes",
                Self::MAX_BODY_BYTES
            )));
        }
        Ok(())
    }

    pub fn into_message(self, id: MessageId, now: UnixTimeMs) -> OutboundMessage {
        OutboundMessage {
            id,
            recipient: self.recipient,
            subject: self.subject,
            body: self.body,
            status: MessageStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            error_message: None,
            created_at: now,
        }
    }
}

/// Why a message surfaced in the stuck list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    /// Retry count reached the configured ceiling; only an operator retry
    /// can revive it.
    RetryCeilingExceeded,
    /// Scheduled retry time passed long ago without the sweep picking it up.
    SweepStale,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StuckMessage {
    pub message: OutboundMessage,
    pub reason: StuckReason,
}

/// Durable record of an already-handled inbound message id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub message_id: MessageId,
    pub processed_at: UnixTimeMs,
}
