//! Media-session capability, consumed as a black box.
//!
//! The actual audio/video transport (capture, encoding, traversal) is the
//! provider's concern. The signaling core only acquires local tracks,
//! opens a session against an agreed room, samples quality and tears
//! everything down again.

use crate::types::call::CallKind;
use crate::types::user::UserId;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("media session connect failed: {0}")]
    ConnectFailed(String),

    #[error("media session closed")]
    SessionClosed,
}

/// Handle to locally captured tracks (microphone, camera).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub kind: CallKind,
    pub track_ids: Vec<String>,
}

/// Handle to the remote party's tracks as attached by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub user: UserId,
    pub track_ids: Vec<String>,
}

/// One quality measurement of the media path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySample {
    pub rtt_ms: u32,
    pub packet_loss_pct: f32,
}

/// An established media session for one call attempt.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Remote tracks, once the peer's media is attached.
    async fn remote_media(&self) -> Option<RemoteMedia>;

    async fn quality(&self) -> Result<QualitySample, MediaError>;

    async fn disconnect(&self);
}

/// Factory for local capture and media sessions.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Captures local tracks for `kind`. Every successful acquisition
    /// must be matched by exactly one `release_local`.
    async fn acquire_local(&self, kind: CallKind) -> Result<LocalMedia, MediaError>;

    async fn release_local(&self, media: &LocalMedia);

    /// Connects to the provider room shared by both participants.
    async fn connect(
        &self,
        room_name: &str,
        token: &str,
        kind: CallKind,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}
