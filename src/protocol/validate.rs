//! Pure semantic validation of signaling events.
//!
//! Deserialization already guarantees structure; this step enforces the
//! rules serde cannot express. It performs no I/O so the rules are
//! unit-testable without a socket.

use super::{EventBody, SignalingEvent};
use crate::types::user::UserId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid timestamp: {0}")]
    BadTimestamp(i64),

    #[error("event requires a correlation id")]
    MissingId,

    #[error("sender '{claimed}' does not match the registered connection '{registered}'")]
    SenderMismatch { claimed: UserId, registered: UserId },
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(())
    }
}

/// The identity a body claims to originate from, if it carries one.
pub fn sender_of(body: &EventBody) -> Option<&UserId> {
    match body {
        EventBody::Register { sender_id }
        | EventBody::Status { sender_id, .. }
        | EventBody::Typing { sender_id, .. }
        | EventBody::Message { sender_id, .. }
        | EventBody::ReadStatus { sender_id, .. } => Some(sender_id),
        EventBody::CallInitiate { caller_id, .. } => Some(caller_id),
        EventBody::CallAccept { acceptor_id, .. } => Some(acceptor_id),
        EventBody::CallReject { rejector_id, .. } => Some(rejector_id),
        EventBody::CallEnd { user_id, .. } => Some(user_id),
        EventBody::Ack | EventBody::Error { .. } | EventBody::Ping => None,
    }
}

/// Checks one event for semantic completeness.
pub fn validate(event: &SignalingEvent) -> Result<(), ValidationError> {
    if event.timestamp <= 0 {
        return Err(ValidationError::BadTimestamp(event.timestamp));
    }
    if event.require_ack && event.id.is_none() {
        return Err(ValidationError::MissingId);
    }

    match &event.body {
        EventBody::Register { sender_id } => require("senderId", sender_id.as_str()),
        EventBody::Status { sender_id, .. } => require("senderId", sender_id.as_str()),
        EventBody::Typing {
            sender_id,
            receiver_id,
            ..
        } => {
            require("senderId", sender_id.as_str())?;
            require("receiverId", receiver_id.as_str())
        }
        EventBody::Message {
            sender_id,
            receiver_id,
            ..
        } => {
            require("senderId", sender_id.as_str())?;
            require("receiverId", receiver_id.as_str())
        }
        EventBody::ReadStatus {
            sender_id,
            receiver_id,
            ..
        } => {
            require("senderId", sender_id.as_str())?;
            require("receiverId", receiver_id.as_str())
        }
        EventBody::CallInitiate {
            call_id,
            caller_id,
            recipient_id,
            room_name,
            token,
            ..
        } => {
            require("callId", call_id.as_str())?;
            require("callerId", caller_id.as_str())?;
            require("recipientId", recipient_id.as_str())?;
            require("roomName", room_name)?;
            require("token", token)
        }
        EventBody::CallAccept {
            call_id,
            acceptor_id,
        } => {
            require("callId", call_id.as_str())?;
            require("acceptorId", acceptor_id.as_str())
        }
        EventBody::CallReject {
            call_id,
            rejector_id,
        } => {
            require("callId", call_id.as_str())?;
            require("rejectorId", rejector_id.as_str())
        }
        EventBody::CallEnd { call_id, user_id } => {
            require("callId", call_id.as_str())?;
            require("userId", user_id.as_str())
        }
        EventBody::Ack => {
            if event.id.is_none() {
                return Err(ValidationError::MissingId);
            }
            Ok(())
        }
        EventBody::Error { .. } | EventBody::Ping => Ok(()),
    }
}

/// Rejects events whose claimed sender is not the identity bound to the
/// connection they arrived on.
pub fn validate_sender(
    event: &SignalingEvent,
    registered: &UserId,
) -> Result<(), ValidationError> {
    match sender_of(&event.body) {
        Some(claimed) if claimed != registered => Err(ValidationError::SenderMismatch {
            claimed: claimed.clone(),
            registered: registered.clone(),
        }),
        _ => Ok(()),
    }
}
