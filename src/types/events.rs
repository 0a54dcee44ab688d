//! Typed event bus surfacing signaling outcomes to the application layer.

use super::call::{CallId, CallKind, EndReason};
use super::user::UserId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use super::user::PresenceUpdate;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The transport connection came up (or back up).
#[derive(Debug, Clone)]
pub struct Connected;

/// The transport connection was lost.
#[derive(Debug, Clone)]
pub struct Disconnected;

/// An invite arrived while this client was idle.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller: UserId,
    pub caller_name: String,
    pub kind: CallKind,
    pub room_name: String,
}

/// Media is established on both sides.
#[derive(Debug, Clone)]
pub struct CallConnected {
    pub call_id: CallId,
    pub kind: CallKind,
}

/// The call left the in-call phases for any reason.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: Option<CallId>,
    pub reason: EndReason,
}

/// A chat message relayed through the signaling channel.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub from: UserId,
    pub to: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Peer started or stopped typing.
#[derive(Debug, Clone)]
pub struct TypingUpdate {
    pub from: UserId,
    pub is_typing: bool,
}

/// Peer read our messages up to `timestamp`.
#[derive(Debug, Clone)]
pub struct ReadReceipt {
    pub from: UserId,
    pub timestamp: DateTime<Utc>,
}

/// An error event from the server, correlated to an outbound event when
/// `related_id` is set.
#[derive(Debug, Clone)]
pub struct SignalError {
    pub related_id: Option<String>,
    pub message: String,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        /// Subscribers that lag simply miss events; nothing blocks the
        /// signaling loops.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Connection events
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),

    // Call events
    (incoming_call, Arc<IncomingCall>),
    (call_connected, Arc<CallConnected>),
    (call_ended, Arc<CallEnded>),

    // Chat-plane events
    (presence, Arc<PresenceUpdate>),
    (message, Arc<ChatMessage>),
    (typing, Arc<TypingUpdate>),
    (read_receipt, Arc<ReadReceipt>),

    // Error events
    (error, Arc<SignalError>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
