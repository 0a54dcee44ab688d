//! Call-related error types.

use crate::types::call::CallPhase;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: CallPhase, to: CallPhase },

    #[error("{target} requires a room name")]
    MissingRoom { target: CallPhase },

    #[error("local media not ready for {target}")]
    MediaNotReady { target: CallPhase },

    #[error("media retries exhausted after {attempts} attempts")]
    MediaRetriesExhausted { attempts: u32 },

    #[error("no active call")]
    NotInCall,

    #[error("call is in {phase}, cannot {action}")]
    WrongPhase {
        phase: CallPhase,
        action: &'static str,
    },

    #[error("call stuck in {phase} for {secs}s")]
    StuckTransition { phase: CallPhase, secs: u64 },

    #[error("caller lookup failed for {0}")]
    UnknownCaller(String),

    #[error("media error: {0}")]
    Media(#[from] super::media::MediaError),
}
