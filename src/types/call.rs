//! Call identifiers, lifecycle enums and the server-persisted call record.

use super::user::UserId;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Unique identifier of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh call id from the current time and random bytes.
    pub fn generate() -> Self {
        let mut data = Vec::with_capacity(8 + 16);
        data.extend_from_slice(&Utc::now().timestamp_millis().to_be_bytes());
        let mut random_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut random_bytes);
        data.extend_from_slice(&random_bytes);

        let hash = Sha256::digest(&data);
        Self(hex::encode(&hash[..12]).to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Whether a call carries audio only or audio plus video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-authoritative lifecycle status of a call record.
///
/// Records only ever move forward; terminal statuses are never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRecordStatus {
    Initiated,
    Ringing,
    Connected,
    Completed,
    Rejected,
    Missed,
    Failed,
}

impl CallRecordStatus {
    /// An active call blocks a new attempt between the same pair.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initiated | Self::Ringing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Missed | Self::Failed
        )
    }
}

/// Client-local projection of the call lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    #[default]
    Idle,
    Incoming,
    Outgoing,
    Connecting,
    Connected,
    Ended,
}

impl CallPhase {
    pub fn is_in_call(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Phases where sitting still for too long indicates a stuck call.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Incoming | Self::Outgoing | Self::Connecting)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Why a call left the in-call phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    RemoteEnded,
    Rejected,
    Timeout,
    Unreachable,
    Error,
}

/// One persisted call attempt. Append-only: status transitions are
/// recorded in place, records are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub caller: UserId,
    pub recipient: UserId,
    pub kind: CallKind,
    pub status: CallRecordStatus,
    pub room_name: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Correlation id for the provider-side media session.
    pub session_ref: Option<String>,
}

impl CallRecord {
    pub fn new(caller: UserId, recipient: UserId, kind: CallKind) -> Self {
        let created_at = Utc::now();
        let room_name = room_name(kind, &caller, &recipient, created_at.timestamp_millis());
        Self {
            id: CallId::generate(),
            caller,
            recipient,
            kind,
            status: CallRecordStatus::Initiated,
            room_name,
            created_at,
            started_at: None,
            ended_at: None,
            session_ref: None,
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller == user || &self.recipient == user
    }

    /// The participant on the other side of `user`, if `user` is one.
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        if &self.caller == user {
            Some(&self.recipient)
        } else if &self.recipient == user {
            Some(&self.caller)
        } else {
            None
        }
    }
}

/// Room names are unique per attempt and shared by both participants.
pub fn room_name(kind: CallKind, caller: &UserId, recipient: &UserId, timestamp_ms: i64) -> String {
    format!("{kind}-{caller}-{recipient}-{timestamp_ms}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_name_format() {
        let name = room_name(
            CallKind::Voice,
            &UserId::from("A"),
            &UserId::from("B"),
            1700000000000,
        );
        assert_eq!(name, "voice-A-B-1700000000000");
    }

    #[test]
    fn test_generated_call_ids_are_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 24);
    }

    #[test]
    fn test_status_classification() {
        assert!(CallRecordStatus::Initiated.is_active());
        assert!(CallRecordStatus::Ringing.is_active());
        assert!(!CallRecordStatus::Connected.is_active());
        assert!(CallRecordStatus::Missed.is_terminal());
        assert!(!CallRecordStatus::Connected.is_terminal());
    }

    #[test]
    fn test_counterpart() {
        let record = CallRecord::new(UserId::from("A"), UserId::from("B"), CallKind::Video);
        assert_eq!(
            record.counterpart(&UserId::from("A")),
            Some(&UserId::from("B"))
        );
        assert_eq!(
            record.counterpart(&UserId::from("B")),
            Some(&UserId::from("A"))
        );
        assert_eq!(record.counterpart(&UserId::from("C")), None);
    }
}
