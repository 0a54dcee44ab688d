pub mod call;
pub mod events;
pub mod user;

pub use call::{CallId, CallKind, CallPhase, CallRecord, CallRecordStatus, EndReason};
pub use user::{Presence, UserId};
