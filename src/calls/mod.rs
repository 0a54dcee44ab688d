//! Client-side call signaling.
//!
//! # Architecture
//!
//! - [`CallStateManager`]: state machine tracking one call attempt's
//!   local lifecycle, with per-phase cleanup handlers
//! - [`CallEventHandler`]: maps inbound signaling events to transitions
//!   and orchestrates media setup/teardown
//! - [`MediaEngine`] / [`MediaSession`]: the external audio/video
//!   transport, consumed as a capability

pub mod error;
pub mod handler;
pub mod media;
pub mod state;

pub use error::CallError;
pub use handler::{CallEventHandler, OutgoingCall};
pub use media::{LocalMedia, MediaEngine, MediaError, MediaSession, QualitySample, RemoteMedia};
pub use state::{CallSession, CallStateManager, CallUpdate, CleanupHandler};
