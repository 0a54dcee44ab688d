//! Signaling wire protocol: JSON text frames carrying one event each.
//!
//! Every frame is a [`SignalingEvent`] envelope: an optional correlation
//! `id`, an epoch-millisecond `timestamp`, a `requireAck` flag and a
//! type-tagged body. The body is a closed sum type so every dispatch site
//! is an exhaustive `match`; adding an event type is a compile-checked
//! change.

mod validate;

pub use validate::{ValidationError, sender_of, validate, validate_sender};

use crate::types::call::{CallId, CallKind};
use crate::types::user::{Presence, UserId};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Type-specific payload of a signaling event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// Binds the connection to a user identity. Registry-only, never relayed.
    #[serde(rename_all = "camelCase")]
    Register { sender_id: UserId },

    /// Presence change, broadcast to every open connection.
    #[serde(rename_all = "camelCase")]
    Status {
        sender_id: UserId,
        status: Presence,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<i64>,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        sender_id: UserId,
        receiver_id: UserId,
        is_typing: bool,
    },

    /// Chat message; the delivery timestamp is the envelope timestamp.
    #[serde(rename_all = "camelCase")]
    Message {
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
    },

    /// Read receipt; reads everything up to the envelope timestamp.
    #[serde(rename_all = "camelCase")]
    ReadStatus {
        sender_id: UserId,
        receiver_id: UserId,
    },

    /// Call invite, relayed to the recipient with a media-session token.
    #[serde(rename_all = "camelCase")]
    CallInitiate {
        call_id: CallId,
        caller_id: UserId,
        recipient_id: UserId,
        call_type: CallKind,
        room_name: String,
        token: String,
    },

    #[serde(rename_all = "camelCase")]
    CallAccept { call_id: CallId, acceptor_id: UserId },

    #[serde(rename_all = "camelCase")]
    CallReject { call_id: CallId, rejector_id: UserId },

    #[serde(rename_all = "camelCase")]
    CallEnd { call_id: CallId, user_id: UserId },

    /// Acknowledges the event whose id is in the envelope `id` field.
    Ack,

    /// Server-to-client failure report, correlated via the envelope `id`.
    Error { message: String },

    /// Keepalive. The only body that never requires acknowledgment.
    Ping,
}

impl EventBody {
    /// Wire tag of this body, for logging and priority decisions.
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::Register { .. } => "register",
            EventBody::Status { .. } => "status",
            EventBody::Typing { .. } => "typing",
            EventBody::Message { .. } => "message",
            EventBody::ReadStatus { .. } => "read_status",
            EventBody::CallInitiate { .. } => "call_initiate",
            EventBody::CallAccept { .. } => "call_accept",
            EventBody::CallReject { .. } => "call_reject",
            EventBody::CallEnd { .. } => "call_end",
            EventBody::Ack => "ack",
            EventBody::Error { .. } => "error",
            EventBody::Ping => "ping",
        }
    }

    /// Call-lifecycle events jump the outbound queue regardless of their
    /// numeric priority.
    pub fn is_call_event(&self) -> bool {
        matches!(
            self,
            EventBody::CallInitiate { .. }
                | EventBody::CallAccept { .. }
                | EventBody::CallReject { .. }
                | EventBody::CallEnd { .. }
        )
    }

    /// Everything except keepalives wants an application-level ack.
    pub fn wants_ack(&self) -> bool {
        !matches!(self, EventBody::Ping | EventBody::Ack)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The envelope around every signaling frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub timestamp: i64,
    #[serde(rename = "requireAck", default, skip_serializing_if = "is_false")]
    pub require_ack: bool,
    #[serde(flatten)]
    pub body: EventBody,
}

impl SignalingEvent {
    pub fn new(body: EventBody) -> Self {
        let require_ack = body.wants_ack();
        Self {
            id: None,
            timestamp: Utc::now().timestamp_millis(),
            require_ack,
            body,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// An `ack` frame for the event carrying `id`.
    pub fn ack(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            timestamp: Utc::now().timestamp_millis(),
            require_ack: false,
            body: EventBody::Ack,
        }
    }

    /// An `error` frame, correlated to `related_id` when present.
    pub fn error(related_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id: related_id,
            timestamp: Utc::now().timestamp_millis(),
            require_ack: false,
            body: EventBody::Error {
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let event = SignalingEvent::new(EventBody::CallInitiate {
            call_id: CallId::from("c1"),
            caller_id: UserId::from("A"),
            recipient_id: UserId::from("B"),
            call_type: CallKind::Voice,
            room_name: "voice-A-B-1700000000000".into(),
            token: "tok".into(),
        })
        .with_id("ev-1");

        let json = serde_json::to_string(&event).unwrap();
        let back: SignalingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let event = SignalingEvent::new(EventBody::CallInitiate {
            call_id: CallId::from("c1"),
            caller_id: UserId::from("A"),
            recipient_id: UserId::from("B"),
            call_type: CallKind::Video,
            room_name: "video-A-B-1".into(),
            token: "tok".into(),
        })
        .with_id("ev-2");

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "call_initiate");
        assert_eq!(value["callId"], "c1");
        assert_eq!(value["callerId"], "A");
        assert_eq!(value["recipientId"], "B");
        assert_eq!(value["callType"], "video");
        assert_eq!(value["roomName"], "video-A-B-1");
        assert_eq!(value["requireAck"], true);
    }

    #[test]
    fn test_ack_omits_require_ack_and_reuses_id() {
        let ack = SignalingEvent::ack("ev-9");
        let value: serde_json::Value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["id"], "ev-9");
        assert!(value.get("requireAck").is_none());
    }

    #[test]
    fn test_ping_does_not_want_ack() {
        assert!(!EventBody::Ping.wants_ack());
        assert!(
            EventBody::Message {
                sender_id: UserId::from("A"),
                receiver_id: UserId::from("B"),
                content: "hi".into(),
            }
            .wants_ack()
        );
    }

    #[test]
    fn test_call_events_are_flagged() {
        assert!(
            EventBody::CallEnd {
                call_id: CallId::from("c1"),
                user_id: UserId::from("A"),
            }
            .is_call_event()
        );
        assert!(
            !EventBody::Typing {
                sender_id: UserId::from("A"),
                receiver_id: UserId::from("B"),
                is_typing: true,
            }
            .is_call_event()
        );
    }
}
